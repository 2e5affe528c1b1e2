//! Analyzer Service (C2)
//!
//! The opaque `initialize / process / cleanup` contract every VAD, ASR,
//! and diarization implementation must satisfy. Real implementations are
//! external collaborators (§1); this module only defines the trait and
//! the deterministic fakes used by the testable properties in §8.

use crate::error::AnalyzerError;
use crate::model::{AnalyzerKind, AnalyzerPayload, AsrPayload, AsrSegment, DiarizationPayload,
    DiarizationSegment, VadPayload};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One pluggable analyzer. Implementations are not assumed thread-safe;
/// a Worker serializes calls into its own analyzer instance with an inner
/// semaphore sized to [`concurrency`](AnalyzerService::concurrency) (§5).
#[async_trait]
pub trait AnalyzerService: Send + Sync {
    fn kind(&self) -> AnalyzerKind;

    fn name(&self) -> &str;

    /// Idempotent; may load models or allocate resources. `options` is an
    /// opaque per-analyzer blob from configuration (§6), untouched by the
    /// Worker and passed through exactly as supplied.
    async fn initialize(&self, options: &serde_json::Value) -> Result<(), AnalyzerError>;

    /// May be long-running. Implementations that support cooperative
    /// cancellation should check for it; the Worker applies a deadline
    /// around this call regardless.
    async fn process(&self, data: &[u8], sample_rate: u32) -> Result<AnalyzerPayload, AnalyzerError>;

    /// Idempotent.
    async fn cleanup(&self) -> Result<(), AnalyzerError>;

    /// How many concurrent `process` calls this implementation tolerates.
    /// Defaults to 1 (assumed not thread-safe, per §5); an implementation
    /// backed by a stateless or internally-pooled model can declare more.
    fn concurrency(&self) -> usize {
        1
    }
}

/// Duration in seconds implied by a byte length at 16-bit PCM, used by
/// the fakes below to produce input-derived (not random) output.
fn implied_duration_s(len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    len as f64 / (sample_rate as f64 * 2.0)
}

/// Deterministic VAD fake: `is_speech = len(bytes) > 1024`, per §8.
pub struct FakeVad {
    initialized: AtomicBool,
    /// Optional artificial delay, for exercising worker timeouts.
    pub delay: Option<Duration>,
    /// When true, `process` returns an error instead of a payload.
    pub fail: bool,
}

impl FakeVad {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            delay: None,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl Default for FakeVad {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyzerService for FakeVad {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Vad
    }

    fn name(&self) -> &str {
        "fake-vad"
    }

    async fn initialize(&self, _options: &serde_json::Value) -> Result<(), AnalyzerError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, data: &[u8], sample_rate: u32) -> Result<AnalyzerPayload, AnalyzerError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AnalyzerError::NotInitialized);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AnalyzerError::ProcessingFailed("fake vad failure".to_string()));
        }

        let is_speech = data.len() > 1024;
        let duration_s = implied_duration_s(data.len(), sample_rate);
        Ok(AnalyzerPayload::Vad(VadPayload {
            is_speech,
            confidence: if is_speech { 0.9 } else { 0.1 },
            segments: if is_speech { vec![(0.0, duration_s)] } else { vec![] },
        }))
    }

    async fn cleanup(&self) -> Result<(), AnalyzerError> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Deterministic ASR fake: `text = "T" + len(bytes)`, per §8.
pub struct FakeAsr {
    initialized: AtomicBool,
    pub delay: Option<Duration>,
    pub fail: bool,
}

impl FakeAsr {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            delay: None,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl Default for FakeAsr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyzerService for FakeAsr {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Asr
    }

    fn name(&self) -> &str {
        "fake-asr"
    }

    async fn initialize(&self, _options: &serde_json::Value) -> Result<(), AnalyzerError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, data: &[u8], sample_rate: u32) -> Result<AnalyzerPayload, AnalyzerError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AnalyzerError::NotInitialized);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AnalyzerError::ProcessingFailed("fake asr failure".to_string()));
        }

        let text = format!("T{}", data.len());
        let duration_s = implied_duration_s(data.len(), sample_rate);
        Ok(AnalyzerPayload::Asr(AsrPayload {
            text: text.clone(),
            confidence: 1.0,
            segments: vec![AsrSegment {
                start_s: 0.0,
                end_s: duration_s,
                text,
                confidence: 1.0,
            }],
            language: "en".to_string(),
        }))
    }

    async fn cleanup(&self) -> Result<(), AnalyzerError> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Deterministic diarization fake: `speakers = ["S0"]`, per §8.
pub struct FakeDiarization {
    initialized: AtomicBool,
    pub delay: Option<Duration>,
    pub fail: bool,
}

impl FakeDiarization {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            delay: None,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl Default for FakeDiarization {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyzerService for FakeDiarization {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Diarization
    }

    fn name(&self) -> &str {
        "fake-diarization"
    }

    async fn initialize(&self, _options: &serde_json::Value) -> Result<(), AnalyzerError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, data: &[u8], sample_rate: u32) -> Result<AnalyzerPayload, AnalyzerError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AnalyzerError::NotInitialized);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AnalyzerError::ProcessingFailed("fake diarization failure".to_string()));
        }

        let duration_s = implied_duration_s(data.len(), sample_rate);
        let mut speakers = std::collections::BTreeSet::new();
        speakers.insert("S0".to_string());
        Ok(AnalyzerPayload::Diarization(DiarizationPayload {
            speakers,
            segments: vec![DiarizationSegment {
                speaker: "S0".to_string(),
                start_s: 0.0,
                end_s: duration_s,
            }],
        }))
    }

    async fn cleanup(&self) -> Result<(), AnalyzerError> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vad_fake_matches_happy_path_scenario() {
        let vad = FakeVad::new();
        vad.initialize(&serde_json::Value::Null).await.unwrap();
        let payload = vad.process(&vec![0u8; 2000], 16_000).await.unwrap();
        match payload {
            AnalyzerPayload::Vad(p) => assert!(p.is_speech),
            _ => panic!("wrong payload kind"),
        }
    }

    #[tokio::test]
    async fn vad_fake_below_threshold_is_not_speech() {
        let vad = FakeVad::new();
        vad.initialize(&serde_json::Value::Null).await.unwrap();
        let payload = vad.process(&vec![0u8; 500], 16_000).await.unwrap();
        match payload {
            AnalyzerPayload::Vad(p) => assert!(!p.is_speech),
            _ => panic!("wrong payload kind"),
        }
    }

    #[tokio::test]
    async fn asr_fake_text_derived_from_length() {
        let asr = FakeAsr::new();
        asr.initialize(&serde_json::Value::Null).await.unwrap();
        let payload = asr.process(&vec![0u8; 2000], 16_000).await.unwrap();
        match payload {
            AnalyzerPayload::Asr(p) => assert_eq!(p.text, "T2000"),
            _ => panic!("wrong payload kind"),
        }
    }

    #[tokio::test]
    async fn not_initialized_is_an_error() {
        let vad = FakeVad::new();
        let err = vad.process(&[0u8; 10], 16_000).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::NotInitialized));
    }
}
