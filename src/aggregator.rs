//! Aggregator (C4)
//!
//! Joins per-chunk analyzer results under a single atomic-per-key table.
//! Grounded in `result_aggregator.py`'s `ChunkAggregationState`/
//! `ResultAggregator`: a sharded map keyed by `(session_id, chunk_id)`
//! gives the same per-key-locking semantics the original gets from its
//! `asyncio.Lock`-protected dict, but without a single global lock.

use crate::bus::{EventBus, EventHandler};
use crate::error::AggregatorError;
use crate::model::{
    AnalyzerKind, AnalyzerPayload, AnalyzerResult, ChunkDone, ChunkKey, Event, EventPayload,
    TOPIC_ASR_DONE, TOPIC_CHUNK_DONE, TOPIC_DIA_DONE, TOPIC_VAD_DONE,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const OUTPUT_TOPICS: [&str; 3] = [TOPIC_VAD_DONE, TOPIC_ASR_DONE, TOPIC_DIA_DONE];

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub aggregation_timeout: Duration,
    pub cleanup_interval: Duration,
    /// VAD-gated routing: a non-speech VAD verdict closes the chunk
    /// immediately with `completed: [vad]`, since ASR/Diarization will
    /// never see it (§9 open question, option b).
    pub speech_gated: bool,
}

struct AggregationEntry {
    created_at: Instant,
    deadline: Instant,
    expected: Vec<AnalyzerKind>,
    received: HashMap<AnalyzerKind, AnalyzerResult>,
}

impl AggregationEntry {
    fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            created_at: now,
            deadline: now + timeout,
            expected: AnalyzerKind::ALL.to_vec(),
            received: HashMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.expected.iter().all(|k| self.received.contains_key(k))
    }
}

enum CloseCause {
    Complete,
    Deadline,
    Partial,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AggregatorStats {
    pub chunks_completed: u64,
    pub chunks_timed_out: u64,
    pub chunks_partial: u64,
    pub average_aggregation_ms: f64,
}

pub struct Aggregator {
    bus: Arc<EventBus>,
    config: AggregatorConfig,
    table: DashMap<ChunkKey, AggregationEntry>,
    running: AtomicBool,
    subscribed_as: parking_lot::RwLock<Option<Arc<dyn EventHandler>>>,
    shutdown_tx: Mutex<Option<watch::Sender<()>>>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
    stats: SyncMutex<AggregatorStats>,
}

impl Aggregator {
    pub fn new(bus: Arc<EventBus>, config: AggregatorConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            table: DashMap::new(),
            running: AtomicBool::new(false),
            subscribed_as: parking_lot::RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            sweeper_handle: Mutex::new(None),
            stats: SyncMutex::new(AggregatorStats::default()),
        })
    }

    /// Subscribe to the three result topics and start the deadline sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<(), AggregatorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AggregatorError::AlreadyRunning);
        }

        let handler: Arc<dyn EventHandler> = self.clone();
        for topic in OUTPUT_TOPICS {
            self.bus.subscribe(topic, handler.clone());
        }
        *self.subscribed_as.write() = Some(handler);

        let (tx, mut rx) = watch::channel(());
        *self.shutdown_tx.lock().await = Some(tx);

        let this = self.clone();
        let interval_dur = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_dur);
            ticker.tick().await; // first tick fires immediately; discard it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.sweep_once();
                    }
                    _ = rx.changed() => {
                        break;
                    }
                }
            }
        });
        *self.sweeper_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop accepting new subscriptions, stop the sweeper, then Close
    /// every remaining Open entry with cause Partial, per the shutdown
    /// flush contract.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handler) = self.subscribed_as.write().take() {
            for topic in OUTPUT_TOPICS {
                self.bus.unsubscribe(topic, &handler);
            }
        }

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.sweeper_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.flush_remaining();
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats.lock().clone()
    }

    pub fn open_entry_count(&self) -> usize {
        self.table.len()
    }

    fn sweep_once(&self) {
        let now = Instant::now();
        let expired: Vec<ChunkKey> = self
            .table
            .iter()
            .filter(|entry| now >= entry.value().deadline)
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.close(&key, CloseCause::Deadline);
        }
    }

    fn flush_remaining(&self) {
        let keys: Vec<ChunkKey> = self.table.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.close(&key, CloseCause::Partial);
        }
    }

    fn add_result(&self, result: AnalyzerResult) {
        let key = result.key();
        let kind = result.kind();
        let force_complete = self.config.speech_gated
            && kind == AnalyzerKind::Vad
            && matches!(&result.payload, AnalyzerPayload::Vad(p) if result.ok && !p.is_speech);

        let should_close = {
            let now = Instant::now();
            let timeout = self.config.aggregation_timeout;
            let mut entry = self
                .table
                .entry(key.clone())
                .or_insert_with(|| AggregationEntry::new(now, timeout));
            entry.received.insert(kind, result);
            if force_complete {
                entry.expected = vec![AnalyzerKind::Vad];
            }
            entry.is_complete()
        };

        if should_close {
            self.close(&key, CloseCause::Complete);
        }
    }

    /// Atomically read-and-remove the entry and publish `chunk_done`.
    /// A no-op if the key was already closed (I4).
    fn close(&self, key: &ChunkKey, cause: CloseCause) {
        let Some((_, entry)) = self.table.remove(key) else {
            return;
        };

        let aggregation_ms = entry.created_at.elapsed().as_secs_f64() * 1000.0;
        let mut completed: Vec<AnalyzerKind> = entry.received.keys().copied().collect();
        completed.sort();
        let mut missing: Vec<AnalyzerKind> = entry
            .expected
            .iter()
            .filter(|k| !entry.received.contains_key(k))
            .copied()
            .collect();
        missing.sort();
        let is_complete = missing.is_empty();
        let is_timeout = matches!(cause, CloseCause::Deadline);

        let results: HashMap<AnalyzerKind, AnalyzerPayload> = entry
            .received
            .into_iter()
            .map(|(k, result)| (k, result.payload))
            .collect();

        let done = ChunkDone {
            session_id: key.session_id.clone(),
            chunk_id: key.chunk_id,
            aggregation_ms,
            completed,
            missing,
            is_complete,
            is_timeout,
            results,
        };

        self.bus.publish(Event::new(
            "aggregator",
            key.correlation_id(),
            EventPayload::ChunkDone(done),
        ));

        let mut stats = self.stats.lock();
        match cause {
            CloseCause::Complete => stats.chunks_completed += 1,
            CloseCause::Deadline => stats.chunks_timed_out += 1,
            CloseCause::Partial => stats.chunks_partial += 1,
        }
        let n = stats.chunks_completed + stats.chunks_timed_out + stats.chunks_partial;
        stats.average_aggregation_ms += (aggregation_ms - stats.average_aggregation_ms) / n as f64;
    }
}

#[async_trait]
impl EventHandler for Aggregator {
    async fn handle(&self, event: Event) {
        if let EventPayload::AnalyzerDone(result) = event.payload {
            self.add_result(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventHandler as _;
    use crate::model::{AsrPayload, DiarizationPayload, VadPayload};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn vad_result(session: &str, chunk: u64, is_speech: bool) -> AnalyzerResult {
        AnalyzerResult {
            session_id: session.to_string(),
            chunk_id: chunk,
            payload: AnalyzerPayload::Vad(VadPayload {
                is_speech,
                confidence: 0.9,
                segments: vec![],
            }),
            processing_ms: 1.0,
            ok: true,
            error: None,
        }
    }

    fn asr_result(session: &str, chunk: u64) -> AnalyzerResult {
        AnalyzerResult {
            session_id: session.to_string(),
            chunk_id: chunk,
            payload: AnalyzerPayload::Asr(AsrPayload {
                text: "T2000".to_string(),
                confidence: 1.0,
                segments: vec![],
                language: "en".to_string(),
            }),
            processing_ms: 1.0,
            ok: true,
            error: None,
        }
    }

    fn dia_result(session: &str, chunk: u64) -> AnalyzerResult {
        let mut speakers = BTreeSet::new();
        speakers.insert("S0".to_string());
        AnalyzerResult {
            session_id: session.to_string(),
            chunk_id: chunk,
            payload: AnalyzerPayload::Diarization(DiarizationPayload {
                speakers,
                segments: vec![],
            }),
            processing_ms: 1.0,
            ok: true,
            error: None,
        }
    }

    fn config(timeout_ms: u64) -> AggregatorConfig {
        AggregatorConfig {
            aggregation_timeout: Duration::from_millis(timeout_ms),
            cleanup_interval: Duration::from_millis(20),
            speech_gated: false,
        }
    }

    struct CollectingHandler {
        results: Arc<SyncMutex<Vec<ChunkDone>>>,
    }

    #[async_trait]
    impl EventHandler for CollectingHandler {
        async fn handle(&self, event: Event) {
            if let EventPayload::ChunkDone(done) = event.payload {
                self.results.lock().push(done);
            }
        }
    }

    #[tokio::test]
    async fn speech_gated_non_speech_vad_short_circuits_the_chunk() {
        let bus = Arc::new(EventBus::new());
        let results = Arc::new(SyncMutex::new(Vec::new()));
        bus.subscribe(
            TOPIC_CHUNK_DONE,
            Arc::new(CollectingHandler {
                results: results.clone(),
            }),
        );

        let agg = Aggregator::new(
            bus.clone(),
            AggregatorConfig {
                aggregation_timeout: Duration::from_millis(5_000),
                cleanup_interval: Duration::from_millis(20),
                speech_gated: true,
            },
        );
        agg.start().await.unwrap();

        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(vad_result("s", 0, false)),
        ))
        .await;

        assert_eq!(agg.open_entry_count(), 0);
        let done = results.lock().pop().expect("chunk_done was published");
        assert_eq!(done.completed, vec![AnalyzerKind::Vad]);
        assert!(done.is_complete);
        assert!(!done.is_timeout);

        agg.stop().await;
    }

    #[tokio::test]
    async fn completes_once_all_three_arrive() {
        let bus = Arc::new(EventBus::new());
        let agg = Aggregator::new(bus.clone(), config(5_000));
        agg.start().await.unwrap();

        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(vad_result("s", 0, true)),
        ))
        .await;
        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(asr_result("s", 0)),
        ))
        .await;
        assert_eq!(agg.open_entry_count(), 1);
        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(dia_result("s", 0)),
        ))
        .await;

        assert_eq!(agg.open_entry_count(), 0);
        assert_eq!(agg.stats().chunks_completed, 1);
        agg.stop().await;
    }

    #[tokio::test]
    async fn duplicate_kind_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let agg = Aggregator::new(bus.clone(), config(5_000));
        agg.start().await.unwrap();

        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(vad_result("s", 0, true)),
        ))
        .await;
        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(vad_result("s", 0, false)),
        ))
        .await;

        assert_eq!(agg.open_entry_count(), 1);
        assert_eq!(agg.stats().chunks_completed, 0);
        agg.stop().await;
    }

    #[tokio::test]
    async fn deadline_sweep_closes_with_timeout() {
        let bus = Arc::new(EventBus::new());
        let agg = Aggregator::new(bus.clone(), config(30));
        agg.start().await.unwrap();

        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(vad_result("s", 0, true)),
        ))
        .await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(agg.open_entry_count(), 0);
        assert_eq!(agg.stats().chunks_timed_out, 1);
        agg.stop().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_open_entries_as_partial() {
        let bus = Arc::new(EventBus::new());
        let agg = Aggregator::new(bus.clone(), config(5_000));
        agg.start().await.unwrap();

        agg.handle(Event::new(
            "w",
            "s:0".to_string(),
            EventPayload::AnalyzerDone(vad_result("s", 0, true)),
        ))
        .await;

        agg.stop().await;

        assert_eq!(agg.open_entry_count(), 0);
        assert_eq!(agg.stats().chunks_partial, 1);
    }
}
