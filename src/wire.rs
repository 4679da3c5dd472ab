//! Wire protocol: controller RPC and the telemetry bus.
//!
//! Both planes use length-prefixed frames (`LengthDelimitedCodec`) over TCP
//! carrying MessagePack bodies.
//!
//! Controller RPC is request/reply, one socket per runner. Each frame is a
//! one-byte message type followed by the MessagePack-encoded payload:
//! `HELLO=1` (empty payload), `REQUEST_WORK=2`, `BYE=3`.
//!
//! The telemetry bus is push/pull fan-in: the receiving end binds, any number
//! of senders connect and push self-describing [`Message`] maps one per
//! frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::messages::{Message, MessageSink};
use crate::scenario::Grant;

pub const MSG_TYPE_HELLO: u8 = 1;
pub const MSG_TYPE_REQUEST_WORK: u8 = 2;
pub const MSG_TYPE_BYE: u8 = 3;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("empty frame")]
    EmptyFrame,
}

// ── RPC payloads ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReply {
    pub runner_id: u64,
    pub test_name: String,
    pub config: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub runner_id: u64,
    pub current_work: HashMap<u64, u64>,
    /// `(scenario_id, data_id)` pairs finished since the previous call.
    pub completed: Vec<(u64, u64)>,
    /// Remaining task capacity on this runner; `None` means unlimited.
    pub max_work: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkReply {
    pub grants: Vec<Grant>,
    pub config: Vec<(String, Value)>,
    pub stop: bool,
}

fn encode_frame<T: Serialize>(msg_type: u8, payload: &T) -> Result<Bytes, TransportError> {
    let mut buf = vec![msg_type];
    rmp_serde::encode::write(&mut buf, payload)?;
    Ok(Bytes::from(buf))
}

fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<(u8, T), TransportError> {
    let (&msg_type, body) = frame.split_first().ok_or(TransportError::EmptyFrame)?;
    Ok((msg_type, rmp_serde::from_slice(body)?))
}

// ── Runner-side transport ─────────────────────────────────────────────────────

/// The runner's view of its controller connection.
#[async_trait]
pub trait RunnerTransport: Send {
    async fn hello(&mut self) -> Result<HelloReply, TransportError>;
    async fn request_work(&mut self, req: WorkRequest) -> Result<WorkReply, TransportError>;
    async fn bye(&mut self, runner_id: u64) -> Result<(), TransportError>;
}

/// In-process transport: the controller behind a lock. Serves the
/// single-process test modes and the test suite.
pub struct DirectRunnerTransport {
    controller: Arc<Mutex<Controller>>,
}

impl DirectRunnerTransport {
    pub fn new(controller: Arc<Mutex<Controller>>) -> Self {
        DirectRunnerTransport { controller }
    }
}

#[async_trait]
impl RunnerTransport for DirectRunnerTransport {
    async fn hello(&mut self) -> Result<HelloReply, TransportError> {
        Ok(self.controller.lock().unwrap().hello())
    }

    async fn request_work(&mut self, req: WorkRequest) -> Result<WorkReply, TransportError> {
        Ok(self.controller.lock().unwrap().request_work(req))
    }

    async fn bye(&mut self, runner_id: u64) -> Result<(), TransportError> {
        self.controller.lock().unwrap().bye(runner_id);
        Ok(())
    }
}

/// TCP request/reply transport to a remote controller.
pub struct TcpRunnerTransport {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl TcpRunnerTransport {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(addr, "connected to controller");
        Ok(TcpRunnerTransport {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    async fn round_trip<Req: Serialize, Reply: DeserializeOwned>(
        &mut self,
        msg_type: u8,
        payload: &Req,
    ) -> Result<Reply, TransportError> {
        self.framed.send(encode_frame(msg_type, payload)?).await?;
        let frame = self
            .framed
            .next()
            .await
            .ok_or(TransportError::ConnectionClosed)??;
        let (reply_type, reply) = decode_frame(&frame)?;
        if reply_type != msg_type {
            return Err(TransportError::UnknownMessageType(reply_type));
        }
        Ok(reply)
    }
}

#[async_trait]
impl RunnerTransport for TcpRunnerTransport {
    async fn hello(&mut self) -> Result<HelloReply, TransportError> {
        self.round_trip(MSG_TYPE_HELLO, &()).await
    }

    async fn request_work(&mut self, req: WorkRequest) -> Result<WorkReply, TransportError> {
        self.round_trip(MSG_TYPE_REQUEST_WORK, &req).await
    }

    async fn bye(&mut self, runner_id: u64) -> Result<(), TransportError> {
        self.round_trip::<_, ()>(MSG_TYPE_BYE, &runner_id).await
    }
}

// ── Controller server ─────────────────────────────────────────────────────────

/// Accepts runner connections and serves the three RPCs. Every RPC locks the
/// controller for its whole duration, which is what makes each one atomic
/// with respect to all shared state.
pub struct ControllerServer {
    listener: TcpListener,
    controller: Arc<Mutex<Controller>>,
}

impl ControllerServer {
    pub async fn bind(
        addr: &str,
        controller: Arc<Mutex<Controller>>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "controller socket bound");
        Ok(ControllerServer {
            listener,
            controller,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "runner connected");
                    let controller = self.controller.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, controller).await {
                            match e {
                                TransportError::ConnectionClosed => {
                                    debug!(%peer, "runner connection closed")
                                }
                                other => warn!(%peer, error = %other, "runner connection failed"),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed on controller socket");
                    return;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    controller: Arc<Mutex<Controller>>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let (&msg_type, body) = frame.split_first().ok_or(TransportError::EmptyFrame)?;
        let reply = match msg_type {
            MSG_TYPE_HELLO => {
                let reply = controller.lock().unwrap().hello();
                encode_frame(msg_type, &reply)?
            }
            MSG_TYPE_REQUEST_WORK => {
                let req: WorkRequest = rmp_serde::from_slice(body)?;
                let reply = controller.lock().unwrap().request_work(req);
                encode_frame(msg_type, &reply)?
            }
            MSG_TYPE_BYE => {
                let runner_id: u64 = rmp_serde::from_slice(body)?;
                controller.lock().unwrap().bye(runner_id);
                encode_frame(msg_type, &())?
            }
            other => return Err(TransportError::UnknownMessageType(other)),
        };
        framed.send(reply).await?;
    }
    Err(TransportError::ConnectionClosed)
}

// ── Telemetry bus ─────────────────────────────────────────────────────────────

/// Push side of the telemetry bus. Sends never block the caller: messages go
/// through an unbounded channel to a background writer task. Frames that
/// cannot be delivered are dropped with a warning; telemetry is best-effort.
pub struct TelemetrySender {
    tx: mpsc::UnboundedSender<Message>,
}

impl TelemetrySender {
    pub async fn connect(addr: &str) -> Result<Arc<Self>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(addr, "connected to message socket");
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let bytes = match rmp_serde::to_vec_named(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable telemetry frame");
                        continue;
                    }
                };
                if let Err(e) = framed.send(Bytes::from(bytes)).await {
                    warn!(error = %e, "telemetry connection lost");
                    return;
                }
            }
        });
        Ok(Arc::new(TelemetrySender { tx }))
    }
}

impl MessageSink for TelemetrySender {
    fn send(&self, msg: Message) {
        // Receiver gone means the writer task exited; nothing to do.
        let _ = self.tx.send(msg);
    }
}

/// Observer of raw telemetry frames (pre-decode).
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, raw: &[u8]);
}

/// Observer of decoded telemetry messages.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, msg: &Message);
}

/// Pull side of the telemetry bus: binds the message socket and fans incoming
/// frames out to its listeners. Raw listeners see every frame; message
/// listeners see only frames that decode as [`Message`].
pub struct TelemetryReceiver {
    listener: TcpListener,
    frame_listeners: Vec<Arc<dyn FrameListener>>,
    message_listeners: Vec<Arc<dyn MessageListener>>,
}

impl TelemetryReceiver {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "message socket bound");
        Ok(TelemetryReceiver {
            listener,
            frame_listeners: Vec::new(),
            message_listeners: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn add_frame_listener(&mut self, listener: Arc<dyn FrameListener>) {
        self.frame_listeners.push(listener);
    }

    pub fn add_message_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.push(listener);
    }

    pub async fn run(self) {
        let frame_listeners = Arc::new(self.frame_listeners);
        let message_listeners = Arc::new(self.message_listeners);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "telemetry sender connected");
                    let frame_listeners = frame_listeners.clone();
                    let message_listeners = message_listeners.clone();
                    tokio::spawn(async move {
                        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                        while let Some(frame) = framed.next().await {
                            let frame = match frame {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!(%peer, error = %e, "telemetry read failed");
                                    return;
                                }
                            };
                            for listener in frame_listeners.iter() {
                                listener.on_frame(&frame);
                            }
                            if !message_listeners.is_empty() {
                                match rmp_serde::from_slice::<Message>(&frame) {
                                    Ok(msg) => {
                                        for listener in message_listeners.iter() {
                                            listener.on_message(&msg);
                                        }
                                    }
                                    Err(e) => {
                                        warn!(%peer, error = %e, "undecodable telemetry frame")
                                    }
                                }
                            }
                        }
                        debug!(%peer, "telemetry sender disconnected");
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed on message socket");
                    return;
                }
            }
        }
    }
}
