//! Data Model
//!
//! The shapes shared by every component: the event envelope, per-topic
//! payloads, analyzer results, and the aggregated completion payload.
//! Payloads are tagged Rust enums/structs rather than dynamically
//! validated maps, so a malformed payload cannot exist past construction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const TOPIC_CHUNK_IN: &str = "chunk_in";
pub const TOPIC_SPEECH_PRESENT: &str = "speech_present";
pub const TOPIC_VAD_DONE: &str = "vad_done";
pub const TOPIC_ASR_DONE: &str = "asr_done";
pub const TOPIC_DIA_DONE: &str = "dia_done";
pub const TOPIC_CHUNK_DONE: &str = "chunk_done";

/// The pair that uniquely names a chunk for its lifetime in the pipeline
/// (Invariant I1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub session_id: String,
    pub chunk_id: u64,
}

impl ChunkKey {
    pub fn new(session_id: impl Into<String>, chunk_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            chunk_id,
        }
    }

    /// `"{session_id}:{chunk_id}"`, per §3.
    pub fn correlation_id(&self) -> String {
        format!("{}:{}", self.session_id, self.chunk_id)
    }
}

/// Which analyzer produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    Vad,
    Asr,
    Diarization,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 3] = [
        AnalyzerKind::Vad,
        AnalyzerKind::Asr,
        AnalyzerKind::Diarization,
    ];

    /// The topic a worker of this kind publishes its results on.
    pub fn output_topic(self) -> &'static str {
        match self {
            AnalyzerKind::Vad => TOPIC_VAD_DONE,
            AnalyzerKind::Asr => TOPIC_ASR_DONE,
            AnalyzerKind::Diarization => TOPIC_DIA_DONE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalyzerKind::Vad => "vad",
            AnalyzerKind::Asr => "asr",
            AnalyzerKind::Diarization => "diarization",
        }
    }
}

/// `chunk_in` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkIn {
    pub session_id: String,
    pub chunk_id: u64,
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u8,
}

/// `speech_present` payload — the optional VAD-gated routing variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechPresent {
    pub session_id: String,
    pub chunk_id: u64,
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub vad_confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VadPayload {
    pub is_speech: bool,
    pub confidence: f32,
    /// `[start_s, end_s]` segments.
    pub segments: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsrSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsrPayload {
    pub text: String,
    pub confidence: f32,
    pub segments: Vec<AsrSegment>,
    pub language: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiarizationSegment {
    pub speaker: String,
    pub start_s: f64,
    pub end_s: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiarizationPayload {
    pub speakers: BTreeSet<String>,
    pub segments: Vec<DiarizationSegment>,
}

/// The kind-specific payload carried by an `AnalyzerResult`.
///
/// Invariant I2: even on failure, the payload still carries the
/// kind-required keys with safe defaults (each variant's `Default`),
/// so a downstream consumer never fails to parse a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnalyzerPayload {
    Vad(VadPayload),
    Asr(AsrPayload),
    Diarization(DiarizationPayload),
}

impl AnalyzerPayload {
    pub fn kind(&self) -> AnalyzerKind {
        match self {
            AnalyzerPayload::Vad(_) => AnalyzerKind::Vad,
            AnalyzerPayload::Asr(_) => AnalyzerKind::Asr,
            AnalyzerPayload::Diarization(_) => AnalyzerKind::Diarization,
        }
    }

    pub fn default_for(kind: AnalyzerKind) -> Self {
        match kind {
            AnalyzerKind::Vad => AnalyzerPayload::Vad(VadPayload::default()),
            AnalyzerKind::Asr => AnalyzerPayload::Asr(AsrPayload::default()),
            AnalyzerKind::Diarization => AnalyzerPayload::Diarization(DiarizationPayload::default()),
        }
    }
}

/// `{vad,asr,dia}_done` payload — one analyzer's verdict on one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerResult {
    pub session_id: String,
    pub chunk_id: u64,
    pub payload: AnalyzerPayload,
    pub processing_ms: f64,
    pub ok: bool,
    pub error: Option<String>,
}

impl AnalyzerResult {
    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.session_id.clone(), self.chunk_id)
    }

    pub fn kind(&self) -> AnalyzerKind {
        self.payload.kind()
    }
}

/// `chunk_done` payload, built by the Aggregator's Close operation (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDone {
    pub session_id: String,
    pub chunk_id: u64,
    pub aggregation_ms: f64,
    pub completed: Vec<AnalyzerKind>,
    pub missing: Vec<AnalyzerKind>,
    pub is_complete: bool,
    pub is_timeout: bool,
    /// `kind -> result.payload for kind in received`, per §4.3.
    pub results: HashMap<AnalyzerKind, AnalyzerPayload>,
}

/// Tagged event payload, one variant per topic in `§6`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum EventPayload {
    ChunkIn(ChunkIn),
    SpeechPresent(SpeechPresent),
    AnalyzerDone(AnalyzerResult),
    ChunkDone(ChunkDone),
}

impl EventPayload {
    pub fn topic(&self) -> &'static str {
        match self {
            EventPayload::ChunkIn(_) => TOPIC_CHUNK_IN,
            EventPayload::SpeechPresent(_) => TOPIC_SPEECH_PRESENT,
            EventPayload::AnalyzerDone(r) => r.kind().output_topic(),
            EventPayload::ChunkDone(_) => TOPIC_CHUNK_DONE,
        }
    }
}

/// An immutable record flowing through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    pub source: &'static str,
    pub correlation_id: String,
}

impl Event {
    pub fn topic(&self) -> &'static str {
        self.payload.topic()
    }

    pub fn new(source: &'static str, correlation_id: String, payload: EventPayload) -> Self {
        Self {
            payload,
            source,
            correlation_id,
        }
    }
}
