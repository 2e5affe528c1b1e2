//! Worker (C3)
//!
//! Wraps one `AnalyzerService`, subscribed to an input topic. Implements
//! the admission-control state machine in §4.2: an event that arrives
//! while the worker isn't running, or while `in_flight == max_in_flight`,
//! is dropped rather than queued — the producer side (Ingress) is the
//! throttling point, not the worker.
//!
//! Grounded in the admission check in the Python original's
//! `VADWorker._handle_audio_chunk` (drop-and-log when the task set is at
//! capacity) and its `stop()` (each cleanup phase's errors are logged
//! without aborting the rest).

use crate::analyzer::AnalyzerService;
use crate::bus::{EventBus, EventHandler};
use crate::error::WorkerError;
use crate::model::{
    AnalyzerKind, AnalyzerPayload, AnalyzerResult, ChunkKey, Event, EventPayload, SpeechPresent,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_in_flight: usize,
    pub chunk_timeout: Duration,
    /// `chunk_in` normally; `speech_present` under VAD-gated routing.
    pub input_topic: String,
    /// Opaque per-analyzer options blob, passed through to
    /// `AnalyzerService::initialize` untouched (§6).
    pub analyzer_options: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub timeout_s: f64,
    pub analyzer_info: String,
    pub dropped_not_running: u64,
    pub dropped_admission: u64,
}

pub struct Worker {
    bus: Arc<EventBus>,
    analyzer: Arc<dyn AnalyzerService>,
    kind: AnalyzerKind,
    config: WorkerConfig,
    running: AtomicBool,
    semaphore: Arc<Semaphore>,
    /// Serializes calls into `analyzer.process` to the analyzer's declared
    /// concurrency (1 unless it opts into more, per §5) — distinct from
    /// `semaphore`, which bounds *admitted* tasks rather than concurrent
    /// calls into the analyzer itself.
    analyzer_semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    subscribed_as: parking_lot::RwLock<Option<Arc<dyn EventHandler>>>,
    dropped_not_running: AtomicU64,
    dropped_admission: AtomicU64,
}

impl Worker {
    pub fn new(
        bus: Arc<EventBus>,
        analyzer: Arc<dyn AnalyzerService>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let kind = analyzer.kind();
        let max_in_flight = config.max_in_flight.max(1);
        let analyzer_concurrency = analyzer.concurrency().max(1);
        Arc::new(Self {
            bus,
            analyzer,
            kind,
            config,
            running: AtomicBool::new(false),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            analyzer_semaphore: Arc::new(Semaphore::new(analyzer_concurrency)),
            tasks: Mutex::new(JoinSet::new()),
            subscribed_as: parking_lot::RwLock::new(None),
            dropped_not_running: AtomicU64::new(0),
            dropped_admission: AtomicU64::new(0),
        })
    }

    /// Initialize the analyzer, then subscribe to the input topic.
    pub async fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }
        self.analyzer
            .initialize(&self.config.analyzer_options)
            .await
            .map_err(|e| WorkerError::InitFailed(e.to_string()))?;

        let handler: Arc<dyn EventHandler> = self.clone();
        self.bus.subscribe(self.config.input_topic.clone(), handler.clone());
        *self.subscribed_as.write() = Some(handler);
        Ok(())
    }

    /// Unsubscribe, wait up to `2 * chunk_timeout` for outstanding tasks,
    /// cancel the rest, then clean up the analyzer. Each phase's errors
    /// are logged and never abort the next phase (W3).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handler) = self.subscribed_as.write().take() {
            self.bus.unsubscribe(&self.config.input_topic, &handler);
        }

        let drain_deadline = self.config.chunk_timeout * 2;
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(drain_deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                analyzer = self.analyzer.name(),
                "outstanding tasks exceeded drain deadline, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        drop(tasks);

        if let Err(e) = self.analyzer.cleanup().await {
            tracing::error!(analyzer = self.analyzer.name(), error = %e, "analyzer cleanup failed");
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let max_in_flight = self.config.max_in_flight.max(1);
        WorkerStatus {
            running: self.running.load(Ordering::SeqCst),
            in_flight: max_in_flight - self.semaphore.available_permits(),
            max_in_flight,
            timeout_s: self.config.chunk_timeout.as_secs_f64(),
            analyzer_info: self.analyzer.name().to_string(),
            dropped_not_running: self.dropped_not_running.load(Ordering::Relaxed),
            dropped_admission: self.dropped_admission.load(Ordering::Relaxed),
        }
    }
}

/// Pull the fields common to `chunk_in` and `speech_present` — whichever
/// topic this worker is subscribed to.
fn extract_chunk(event: &Event) -> Option<(String, u64, Vec<u8>, u32)> {
    match &event.payload {
        EventPayload::ChunkIn(c) => Some((c.session_id.clone(), c.chunk_id, c.data.clone(), c.sample_rate)),
        EventPayload::SpeechPresent(s) => {
            Some((s.session_id.clone(), s.chunk_id, s.data.clone(), s.sample_rate))
        }
        _ => None,
    }
}

#[async_trait]
impl EventHandler for Worker {
    async fn handle(&self, event: Event) {
        if !self.running.load(Ordering::SeqCst) {
            self.dropped_not_running.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.dropped_admission.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    analyzer = self.analyzer.name(),
                    "at max_in_flight, dropping chunk at admission"
                );
                return;
            }
        };

        let Some((session_id, chunk_id, data, sample_rate)) = extract_chunk(&event) else {
            return;
        };

        let analyzer = self.analyzer.clone();
        let bus = self.bus.clone();
        let kind = self.kind;
        let timeout = self.config.chunk_timeout;
        let analyzer_semaphore = self.analyzer_semaphore.clone();

        self.tasks.lock().await.spawn(async move {
            let _permit = permit;
            let start = Instant::now();
            let key = ChunkKey::new(session_id.clone(), chunk_id);

            let outcome = {
                let _analyzer_permit = analyzer_semaphore
                    .acquire_owned()
                    .await
                    .expect("analyzer semaphore is never closed");
                tokio::time::timeout(timeout, analyzer.process(&data, sample_rate)).await
            };
            let (payload, ok, error, processing_ms) = match outcome {
                Ok(Ok(payload)) => (payload, true, None, start.elapsed().as_secs_f64() * 1000.0),
                Ok(Err(e)) => (
                    AnalyzerPayload::default_for(kind),
                    false,
                    Some(e.to_string()),
                    start.elapsed().as_secs_f64() * 1000.0,
                ),
                Err(_) => (
                    AnalyzerPayload::default_for(kind),
                    false,
                    Some("timeout".to_string()),
                    timeout.as_secs_f64() * 1000.0,
                ),
            };

            let speech_present = matches!(
                &payload,
                AnalyzerPayload::Vad(p) if ok && p.is_speech
            );
            let vad_confidence = match &payload {
                AnalyzerPayload::Vad(p) => p.confidence,
                _ => 0.0,
            };

            let result = AnalyzerResult {
                session_id: session_id.clone(),
                chunk_id,
                payload,
                processing_ms,
                ok,
                error,
            };

            bus.publish(Event::new(
                "worker",
                key.correlation_id(),
                EventPayload::AnalyzerDone(result),
            ));

            if kind == AnalyzerKind::Vad && speech_present {
                bus.publish(Event::new(
                    "worker",
                    key.correlation_id(),
                    EventPayload::SpeechPresent(SpeechPresent {
                        session_id,
                        chunk_id,
                        data,
                        sample_rate,
                        vad_confidence,
                    }),
                ));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{FakeAsr, FakeVad};
    use crate::model::{ChunkIn, TOPIC_ASR_DONE, TOPIC_CHUNK_IN, TOPIC_VAD_DONE};
    use std::time::Duration;

    struct CollectingHandler {
        results: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl EventHandler for CollectingHandler {
        async fn handle(&self, event: Event) {
            self.results.lock().await.push(event);
        }
    }

    fn chunk_event(session_id: &str, chunk_id: u64, len: usize) -> Event {
        let key = ChunkKey::new(session_id.to_string(), chunk_id);
        Event::new(
            "ingress",
            key.correlation_id(),
            EventPayload::ChunkIn(ChunkIn {
                session_id: session_id.to_string(),
                chunk_id,
                data: vec![0u8; len],
                sample_rate: 16_000,
                channels: 1,
            }),
        )
    }

    fn default_config() -> WorkerConfig {
        WorkerConfig {
            max_in_flight: 4,
            chunk_timeout: Duration::from_secs(5),
            input_topic: TOPIC_CHUNK_IN.to_string(),
            analyzer_options: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn admitted_chunk_yields_exactly_one_result() {
        let bus = Arc::new(EventBus::new());
        let results = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            TOPIC_VAD_DONE,
            Arc::new(CollectingHandler {
                results: results.clone(),
            }),
        );

        let worker = Worker::new(bus.clone(), Arc::new(FakeVad::new()), default_config());
        worker.start().await.unwrap();

        bus.publish(chunk_event("s1", 0, 2000));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(results.lock().await.len(), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn event_dropped_silently_when_not_running() {
        let bus = Arc::new(EventBus::new());
        let worker = Worker::new(bus.clone(), Arc::new(FakeVad::new()), default_config());
        // Not started.
        worker.handle(chunk_event("s1", 0, 2000)).await;
        assert_eq!(worker.status().dropped_not_running, 1);
    }

    #[tokio::test]
    async fn admission_control_drops_beyond_capacity() {
        let bus = Arc::new(EventBus::new());
        let config = WorkerConfig {
            max_in_flight: 1,
            chunk_timeout: Duration::from_secs(5),
            input_topic: TOPIC_CHUNK_IN.to_string(),
            analyzer_options: serde_json::Value::Null,
        };
        let analyzer = FakeVad::new().with_delay(Duration::from_millis(200));
        let worker = Worker::new(bus.clone(), Arc::new(analyzer), config);
        worker.start().await.unwrap();

        worker.handle(chunk_event("s1", 0, 2000)).await;
        worker.handle(chunk_event("s1", 1, 2000)).await;
        worker.handle(chunk_event("s1", 2, 2000)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.status().dropped_admission, 2);

        worker.stop().await;
    }

    #[tokio::test]
    async fn timeout_produces_ok_false_result() {
        let bus = Arc::new(EventBus::new());
        let results = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            TOPIC_ASR_DONE,
            Arc::new(CollectingHandler {
                results: results.clone(),
            }),
        );

        let config = WorkerConfig {
            max_in_flight: 4,
            chunk_timeout: Duration::from_millis(50),
            input_topic: TOPIC_CHUNK_IN.to_string(),
            analyzer_options: serde_json::Value::Null,
        };
        let analyzer = FakeAsr::new().with_delay(Duration::from_millis(200));
        let worker = Worker::new(bus.clone(), Arc::new(analyzer), config);
        worker.start().await.unwrap();

        bus.publish(chunk_event("s1", 0, 2000));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = results.lock().await;
        assert_eq!(events.len(), 1);
        if let EventPayload::AnalyzerDone(r) = &events[0].payload {
            assert!(!r.ok);
            assert_eq!(r.error.as_deref(), Some("timeout"));
        } else {
            panic!("wrong payload");
        }
        drop(events);
        worker.stop().await;
    }

    #[tokio::test]
    async fn concurrent_chunks_serialize_through_the_analyzer() {
        let bus = Arc::new(EventBus::new());
        let results = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            TOPIC_VAD_DONE,
            Arc::new(CollectingHandler {
                results: results.clone(),
            }),
        );

        let config = WorkerConfig {
            max_in_flight: 4,
            chunk_timeout: Duration::from_secs(5),
            input_topic: TOPIC_CHUNK_IN.to_string(),
            analyzer_options: serde_json::Value::Null,
        };
        let analyzer = FakeVad::new().with_delay(Duration::from_millis(80));
        let worker = Worker::new(bus.clone(), Arc::new(analyzer), config);
        worker.start().await.unwrap();

        let start = Instant::now();
        worker.handle(chunk_event("s1", 0, 2000)).await;
        worker.handle(chunk_event("s1", 1, 2000)).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Both chunks were admitted (max_in_flight = 4), but the default
        // analyzer concurrency of 1 forces their `process` calls one after
        // the other, so total elapsed time is additive rather than
        // overlapping.
        assert_eq!(results.lock().await.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(150));

        worker.stop().await;
    }
}
