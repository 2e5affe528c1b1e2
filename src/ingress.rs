//! Ingress Handler (C7)
//!
//! Accepts client connections over WebSocket, frames incoming audio
//! chunks onto the bus, and routes `chunk_done` completion events back to
//! the originating connection via the Connection Registry (C6, in
//! [`crate::connection`]). Grounded in the teacher's
//! `call_server.rs::handle_connection`: one reader loop per connection
//! plus a single writer task fed by an `mpsc` channel, which is exactly
//! the single-writer resource Invariant I5 requires.

use crate::bus::{EventBus, EventHandler};
use crate::config::ProcessingConfig;
use crate::connection::{decrement, ConnectionRegistry};
use crate::error::{IngressError, SessionError};
use crate::model::{ChunkDone, ChunkIn, Event, EventPayload, TOPIC_CHUNK_DONE};
use crate::session::SessionManager;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Client -> server control frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ClientCommand {
    Ping,
    GetSessionInfo,
}

/// Server -> client control/result frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    SessionEstablished {
        session_id: String,
    },
    ChunkAccepted {
        chunk_id: u64,
        size: usize,
    },
    RejectedBackpressure {
        chunk_id: u64,
    },
    Pong,
    SessionInfo {
        session_id: String,
        chunks_in: u64,
        bytes_in: u64,
        status: String,
    },
    Error {
        message: String,
    },
    Result(ChunkDone),
}

/// Analyzer payloads carry `f64`s sourced from external, untrusted
/// implementations (§1) and are never validated finite, so serialization
/// can fail on a NaN/Infinity value. Drop the frame rather than panic the
/// connection task, matching the teacher's own `if let Ok(json)` pattern.
fn to_ws_message(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize server message, dropping frame");
            None
        }
    }
}

async fn send_ws(tx: &mpsc::Sender<Message>, msg: ServerMessage) {
    if let Some(message) = to_ws_message(&msg) {
        let _ = tx.send(message).await;
    }
}

pub struct IngressHandler {
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    registry: Arc<ConnectionRegistry>,
    config: ProcessingConfig,
    subscribed_as: parking_lot::RwLock<Option<Arc<dyn EventHandler>>>,
    shutdown_tx: tokio::sync::Mutex<Option<watch::Sender<()>>>,
    accept_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IngressHandler {
    pub fn new(
        bus: Arc<EventBus>,
        sessions: Arc<SessionManager>,
        registry: Arc<ConnectionRegistry>,
        config: ProcessingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            sessions,
            registry,
            config,
            subscribed_as: parking_lot::RwLock::new(None),
            shutdown_tx: tokio::sync::Mutex::new(None),
            accept_handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Subscribe to `chunk_done` and begin accepting connections on
    /// `bind_addr`. Returns the socket actually bound (useful when
    /// `bind_addr` asks for an ephemeral port).
    pub async fn start(self: &Arc<Self>, bind_addr: &str) -> std::io::Result<std::net::SocketAddr> {
        let handler: Arc<dyn EventHandler> = self.clone();
        self.bus.subscribe(TOPIC_CHUNK_DONE, handler.clone());
        *self.subscribed_as.write() = Some(handler);

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, mut rx) = watch::channel(());
        *self.shutdown_tx.lock().await = Some(tx);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let this = this.clone();
                                tokio::spawn(async move { this.handle_connection(stream).await });
                            }
                            Err(e) => tracing::warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
        });
        *self.accept_handle.lock().await = Some(handle);
        Ok(local_addr)
    }

    /// Stop accepting new connections. Sends already in flight on
    /// existing connections are left to drain naturally; this does not
    /// forcibly close open sockets.
    pub async fn stop(&self) {
        if let Some(handler) = self.subscribed_as.write().take() {
            self.bus.unsubscribe(TOPIC_CHUNK_DONE, &handler);
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.accept_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "websocket handshake failed");
                return;
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let session_id = self.sessions.create().await;
        let (tx, mut rx) = mpsc::channel::<Message>(WRITER_CHANNEL_CAPACITY);
        let unresolved = self.registry.register(session_id.clone(), tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        send_ws(
            &tx,
            ServerMessage::SessionEstablished {
                session_id: session_id.clone(),
            },
        )
        .await;

        while let Some(frame) = read.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    let err = IngressError::WebSocket(e);
                    tracing::debug!(session_id = %session_id, error = %err, "read loop ending");
                    break;
                }
            };
            match frame {
                Message::Binary(data) => {
                    self.handle_chunk(&session_id, data, &tx, &unresolved).await;
                }
                Message::Text(text) => {
                    self.handle_command(&session_id, &text, &tx).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.registry.unregister(&session_id);
        self.sessions.end(&session_id).await;
        drop(tx);
        let _ = writer.await;
    }

    async fn handle_chunk(
        &self,
        session_id: &str,
        data: Vec<u8>,
        tx: &mpsc::Sender<Message>,
        unresolved: &Arc<AtomicU64>,
    ) {
        let max = self.config.max_chunk_bytes;
        if data.is_empty() || data.len() > max {
            let err = if data.is_empty() {
                IngressError::EmptyChunk
            } else {
                IngressError::ChunkTooLarge { len: data.len(), max }
            };
            send_ws(tx, ServerMessage::Error { message: err.to_string() }).await;
            return;
        }

        let chunk_id = match self.sessions.next_chunk_id(session_id).await {
            Ok(id) => id,
            Err(e) => {
                send_ws(tx, ServerMessage::Error { message: IngressError::from(e).to_string() }).await;
                return;
            }
        };
        let _ = self.sessions.record_bytes(session_id, data.len() as u64).await;

        if let Some(cap) = self.config.max_unresolved_per_session {
            if unresolved.load(Ordering::Relaxed) as usize >= cap {
                send_ws(tx, ServerMessage::RejectedBackpressure { chunk_id }).await;
                return;
            }
        }

        let size = data.len();
        unresolved.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(Event::new(
            "ingress",
            format!("{session_id}:{chunk_id}"),
            EventPayload::ChunkIn(ChunkIn {
                session_id: session_id.to_string(),
                chunk_id,
                data,
                sample_rate: self.config.sample_rate_default,
                channels: self.config.channels_default,
            }),
        ));

        send_ws(tx, ServerMessage::ChunkAccepted { chunk_id, size }).await;
    }

    async fn handle_command(&self, session_id: &str, text: &str, tx: &mpsc::Sender<Message>) {
        let command: Result<ClientCommand, _> = serde_json::from_str(text);
        let reply = match command {
            Ok(ClientCommand::Ping) => ServerMessage::Pong,
            Ok(ClientCommand::GetSessionInfo) => match self.sessions.info(session_id).await {
                Some(info) => ServerMessage::SessionInfo {
                    session_id: info.session_id,
                    chunks_in: info.chunks_in,
                    bytes_in: info.bytes_in,
                    status: match info.status {
                        crate::session::SessionStatus::Active => "active".to_string(),
                        crate::session::SessionStatus::Ended => "ended".to_string(),
                    },
                },
                None => {
                    let err = IngressError::Session(SessionError::UnknownSession(session_id.to_string()));
                    ServerMessage::Error { message: err.to_string() }
                }
            },
            Err(e) => {
                let err = IngressError::MalformedControl(e.to_string());
                ServerMessage::Error { message: err.to_string() }
            }
        };
        send_ws(tx, reply).await;
    }
}

#[async_trait]
impl EventHandler for IngressHandler {
    async fn handle(&self, event: Event) {
        if let EventPayload::ChunkDone(done) = event.payload {
            if let Some(counter) = self.registry.unresolved_counter(&done.session_id) {
                decrement(&counter);
            }
            let session_id = done.session_id.clone();
            if let Some(message) = to_ws_message(&ServerMessage::Result(done)) {
                if !self.registry.send(&session_id, message).await {
                    tracing::debug!(session_id = %session_id, "no connection for chunk_done, session already closed");
                }
            }
        }
    }
}
