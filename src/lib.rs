//! Speech Pipeline
//!
//! A concurrent, event-driven backbone for real-time voice processing:
//! audio chunks come in over WebSocket, fan out to VAD/ASR/diarization
//! workers over an in-process pub/sub bus, and their results join back
//! into one completion event per chunk.
//!
//! # Architecture
//!
//! ```text
//! client --(binary frames)--> Ingress --publish(chunk_in)--> Event Bus
//!                                                                |
//!                                   +----------------------------+----------------------------+
//!                                   |                            |                            |
//!                                Worker(VAD)                 Worker(ASR)               Worker(Diarization)
//!                                   |                            |                            |
//!                             publish(vad_done)           publish(asr_done)            publish(dia_done)
//!                                   |                            |                            |
//!                                   +----------------------------+----------------------------+
//!                                                                |
//!                                                           Aggregator
//!                                                                |
//!                                                      publish(chunk_done)
//!                                                                |
//!                                                             Ingress --(result frame)--> client
//! ```
//!
//! Every arrow is a bus publish/subscribe, not a direct call: a worker
//! never knows about the aggregator, and the aggregator never knows
//! about ingress. [`lifecycle`] is the one module that wires them
//! together and owns their start/stop order.

pub mod aggregator;
pub mod analyzer;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod ingress;
pub mod lifecycle;
pub mod model;
pub mod session;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use aggregator::{Aggregator, AggregatorConfig, AggregatorStats};
pub use analyzer::{AnalyzerService, FakeAsr, FakeDiarization, FakeVad};
pub use bus::{EventBus, EventHandler};
pub use config::Config;
pub use connection::ConnectionRegistry;
pub use ingress::IngressHandler;
pub use lifecycle::PipelineController;
pub use model::{
    AnalyzerKind, AnalyzerPayload, AnalyzerResult, ChunkDone, ChunkIn, ChunkKey, Event,
    EventPayload, SpeechPresent,
};
pub use session::{Session, SessionManager, SessionStatus};
pub use stats::PipelineStats;
pub use worker::{Worker, WorkerConfig, WorkerStatus};
