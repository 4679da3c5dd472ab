//! On-disk frame collector.
//!
//! Raw telemetry frames are appended to `<dir>/current` (with the epoch at
//! which it was opened stored in `<dir>/current_start_time`). After
//! `roll_after_n_messages` frames the file is atomically renamed to
//! `<start>_<end>_<seq>` and a fresh `current` is opened. A `current` left
//! over from a previous run is rolled out at startup. `data_created`
//! messages additionally append their payload to `<dir>/<name>.msgpack`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};

use crate::messages::{kind, wall_time, Message};
use crate::wire::{FrameListener, MessageListener};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("collector i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode data payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

struct CollectorState {
    current: File,
    msg_count: usize,
    file_seq: usize,
}

pub struct Collector {
    target_dir: PathBuf,
    roll_after_n_messages: usize,
    state: Mutex<CollectorState>,
}

impl Collector {
    pub fn new(
        target_dir: impl Into<PathBuf>,
        roll_after_n_messages: usize,
    ) -> Result<Self, CollectorError> {
        let target_dir = target_dir.into();
        std::fs::create_dir_all(&target_dir)?;

        let current_path = target_dir.join("current");
        let mut file_seq = 0;
        if current_path.is_file() {
            info!(path = ?current_path, "rolling out pre-existing current file");
            roll_file(&target_dir, &mut file_seq)?;
        }

        write_start_time(&target_dir)?;
        let current = File::create(&current_path)?;
        Ok(Collector {
            target_dir,
            roll_after_n_messages,
            state: Mutex::new(CollectorState {
                current,
                msg_count: 0,
                file_seq,
            }),
        })
    }

    /// Append one length-prefixed raw frame to the current file, rolling it
    /// once the message quota is reached.
    pub fn process_raw(&self, raw: &[u8]) -> Result<(), CollectorError> {
        let mut state = self.state.lock().unwrap();
        state.current.write_all(&(raw.len() as u32).to_be_bytes())?;
        state.current.write_all(raw)?;
        state.msg_count += 1;

        if state.msg_count >= self.roll_after_n_messages {
            state.msg_count = 0;
            state.current.flush()?;
            let mut seq = state.file_seq;
            roll_file(&self.target_dir, &mut seq)?;
            state.file_seq = seq;
            write_start_time(&self.target_dir)?;
            state.current = File::create(self.target_dir.join("current"))?;
        }
        Ok(())
    }

    /// Persist `data_created` payloads to their own per-name files.
    pub fn process_message(&self, msg: &Message) -> Result<(), CollectorError> {
        if msg.kind != kind::DATA_CREATED {
            return Ok(());
        }
        let (Some(name), Some(data)) = (
            msg.fields.get("name").and_then(|v| v.as_str()),
            msg.fields.get("data"),
        ) else {
            warn!("data_created message missing name or data field");
            return Ok(());
        };
        let path = self.target_dir.join(format!("{}.msgpack", name));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&rmp_serde::to_vec_named(data)?)?;
        Ok(())
    }
}

fn write_start_time(target_dir: &std::path::Path) -> Result<(), CollectorError> {
    std::fs::write(
        target_dir.join("current_start_time"),
        format!("{}", wall_time() as u64),
    )?;
    Ok(())
}

/// Rename `current` to `<start>_<end>_<seq>`, bumping `seq`.
fn roll_file(target_dir: &std::path::Path, file_seq: &mut usize) -> Result<(), CollectorError> {
    let start_time = std::fs::read_to_string(target_dir.join("current_start_time"))
        .unwrap_or_else(|_| "0".to_string());
    let end_time = wall_time() as u64;
    let rolled = target_dir.join(format!("{}_{}_{}", start_time.trim(), end_time, file_seq));
    info!(to = ?rolled, "rolling current file");
    std::fs::rename(target_dir.join("current"), &rolled)?;
    *file_seq += 1;
    Ok(())
}

impl FrameListener for Collector {
    fn on_frame(&self, raw: &[u8]) {
        if let Err(e) = self.process_raw(raw) {
            warn!(error = %e, "failed to persist telemetry frame");
        }
    }
}

impl MessageListener for Collector {
    fn on_message(&self, msg: &Message) {
        if let Err(e) = self.process_message(msg) {
            warn!(error = %e, "failed to persist data_created payload");
        }
    }
}
