//! Error Types
//!
//! One `thiserror` enum per component, mirroring the error boundaries in
//! the component design: validation errors surface to the client directly,
//! everything else is logged and isolated at its own layer.

use thiserror::Error;

/// Errors surfaced while handling a client connection.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("chunk too large: {len} bytes exceeds max_chunk_bytes {max}")]
    ChunkTooLarge { len: usize, max: usize },

    #[error("chunk is empty")]
    EmptyChunk,

    #[error("malformed control frame: {0}")]
    MalformedControl(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors raised by the Session Manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Errors raised inside a Worker's own lifecycle operations.
///
/// Analyzer failures during processing are *not* represented here — those
/// are captured as `ok = false` on the `AnalyzerResult` itself, per
/// Invariant I2. This enum only covers `start`/`stop` bookkeeping.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("analyzer initialization failed: {0}")]
    InitFailed(String),

    #[error("analyzer cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("worker already running")]
    AlreadyRunning,
}

/// Errors raised by the Aggregator's own bookkeeping (not analyzer errors).
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("aggregator already running")]
    AlreadyRunning,
}

/// Errors raised by an Analyzer Service implementation.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer not initialized")]
    NotInitialized,

    #[error("analyzer initialization failed: {0}")]
    InitFailed(String),

    #[error("analyzer processing failed: {0}")]
    ProcessingFailed(String),
}

/// Errors raised while bringing the pipeline up, per the Lifecycle
/// Controller's start order (bus, workers, aggregator, ingress).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("worker failed to start: {0}")]
    Worker(#[from] WorkerError),

    #[error("aggregator failed to start: {0}")]
    Aggregator(#[from] AggregatorError),

    #[error("ingress failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}
