//! Versioned configuration.
//!
//! The controller owns a [`ConfigManager`]: a key→value store where every
//! write bumps a global version and stamps the written key with it. Runners
//! receive the full snapshot at hello and only deltas afterwards; the
//! manager remembers the highest version each runner has seen. Applying the
//! deltas in order converges each runner on the controller's snapshot.
//!
//! Runner-side, [`RunnerConfig`] is the cheap shared view handed to every
//! journey context.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("config file root must be a mapping")]
    NotAMapping,
}

/// Controller-side versioned key→value store with per-runner delta tracking.
#[derive(Default)]
pub struct ConfigManager {
    version: u64,
    entries: HashMap<String, (Value, u64)>,
    runner_versions: HashMap<u64, u64>,
}

impl ConfigManager {
    pub fn new() -> Self {
        ConfigManager::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.version += 1;
        let key = key.into();
        debug!(key = %key, version = self.version, "config set");
        self.entries.insert(key, (value.into(), self.version));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|(v, _)| v)
    }

    /// The full current snapshot, for hello replies.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    /// Keys whose set-version is strictly greater than `version`.
    pub fn changes_since(&self, version: u64) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .filter(|(_, (_, set_version))| *set_version > version)
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    /// Delta for a runner since its last call, advancing its seen version.
    pub fn changes_for_runner(&mut self, runner_id: u64) -> Vec<(String, Value)> {
        let seen = self.runner_versions.get(&runner_id).copied().unwrap_or(0);
        self.runner_versions.insert(runner_id, self.version);
        self.changes_since(seen)
    }

    /// Mark the runner as having seen the full current snapshot (hello path).
    pub fn mark_current(&mut self, runner_id: u64) {
        self.runner_versions.insert(runner_id, self.version);
    }

    pub fn forget_runner(&mut self, runner_id: u64) {
        self.runner_versions.remove(&runner_id);
    }

    /// Load a flat YAML mapping into the store, one versioned set per key.
    pub fn load_yaml_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let parsed: serde_yaml::Value = serde_yaml::from_str(&content)?;
        let mapping = parsed.as_mapping().ok_or(ConfigError::NotAMapping)?;
        for (k, v) in mapping {
            let key = k.as_str().map(str::to_string).unwrap_or_else(|| {
                serde_yaml::to_string(k).unwrap_or_default().trim().to_string()
            });
            let value: Value = serde_yaml::from_value(v.clone())?;
            self.set(key, value);
        }
        Ok(())
    }
}

/// Runner-side config view. Cheap to clone; shared by the runner loop (which
/// applies incoming deltas) and every journey context (which reads).
#[derive(Clone, Default)]
pub struct RunnerConfig {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl RunnerConfig {
    pub fn new() -> Self {
        RunnerConfig::default()
    }

    pub fn apply(&self, kv: Vec<(String, Value)>) {
        let mut inner = self.inner.lock().unwrap();
        for (k, v) in kv {
            inner.insert(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
