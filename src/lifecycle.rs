//! Lifecycle Controller (C8)
//!
//! Owns every long-lived component and enforces the start/stop order that
//! keeps a chunk from ever reaching a subscriber that isn't ready for it:
//! workers and the aggregator come up before ingress opens the listening
//! socket, and shut down in the reverse order so nothing new arrives
//! mid-teardown. Each stop phase logs and continues rather than aborting
//! the rest, matching Worker::stop/Aggregator::stop's own W3 behavior.

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::analyzer::AnalyzerService;
use crate::bus::EventBus;
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::error::LifecycleError;
use crate::ingress::IngressHandler;
use crate::model::{AnalyzerKind, TOPIC_CHUNK_IN, TOPIC_SPEECH_PRESENT};
use crate::session::SessionManager;
use crate::worker::{Worker, WorkerConfig, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;

pub struct PipelineController {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<ConnectionRegistry>,
    workers: Vec<Arc<Worker>>,
    aggregator: Arc<Aggregator>,
    ingress: Arc<IngressHandler>,
}

impl PipelineController {
    /// Wire up the bus, one Worker per supplied analyzer, the Aggregator,
    /// and Ingress. Analyzer implementations are supplied by the caller
    /// (§1: real VAD/ASR/diarization engines are external collaborators,
    /// not something this crate implements).
    pub fn new(config: &Config, analyzers: Vec<Arc<dyn AnalyzerService>>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let sessions = SessionManager::new(Duration::from_secs(config.processing.session_grace_s));
        let registry = ConnectionRegistry::new();

        let workers = analyzers
            .into_iter()
            .map(|analyzer| {
                let input_topic = if config.processing.speech_gated && analyzer.kind() != AnalyzerKind::Vad {
                    TOPIC_SPEECH_PRESENT
                } else {
                    TOPIC_CHUNK_IN
                };
                let analyzer_options = config
                    .processing
                    .analyzer_options
                    .get(analyzer.name())
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Worker::new(
                    bus.clone(),
                    analyzer,
                    WorkerConfig {
                        max_in_flight: config.processing.max_in_flight,
                        chunk_timeout: Duration::from_secs_f64(config.processing.chunk_timeout_s),
                        input_topic: input_topic.to_string(),
                        analyzer_options,
                    },
                )
            })
            .collect();

        let aggregator = Aggregator::new(
            bus.clone(),
            AggregatorConfig {
                aggregation_timeout: Duration::from_secs_f64(config.processing.aggregation_timeout_s),
                cleanup_interval: Duration::from_secs_f64(config.processing.cleanup_interval_s),
                speech_gated: config.processing.speech_gated,
            },
        );

        let ingress = IngressHandler::new(
            bus.clone(),
            sessions.clone(),
            registry.clone(),
            config.processing.clone(),
        );

        Arc::new(Self {
            bus,
            sessions,
            registry,
            workers,
            aggregator,
            ingress,
        })
    }

    /// Event Bus (already live) -> Workers -> Aggregator -> Ingress.
    /// Returns the socket Ingress actually bound.
    pub async fn start(&self, bind_addr: &str) -> Result<std::net::SocketAddr, LifecycleError> {
        for worker in &self.workers {
            worker.start().await?;
        }
        self.aggregator.start().await?;
        let local_addr = self.ingress.start(bind_addr).await?;
        tracing::info!(%local_addr, workers = self.workers.len(), "pipeline started");
        Ok(local_addr)
    }

    /// Ingress -> Aggregator -> Workers -> Event Bus, the exact reverse of
    /// `start`. Every phase runs even if an earlier one logged an error.
    pub async fn stop(&self) {
        self.ingress.stop().await;
        self.aggregator.stop().await;
        for worker in &self.workers {
            worker.stop().await;
        }
        self.bus.clear(None);
        tracing::info!("pipeline stopped");
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|w| w.status()).collect()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{FakeAsr, FakeDiarization, FakeVad};
    use crate::config::Config;

    fn fakes() -> Vec<Arc<dyn AnalyzerService>> {
        vec![
            Arc::new(FakeVad::new()),
            Arc::new(FakeAsr::new()),
            Arc::new(FakeDiarization::new()),
        ]
    }

    #[tokio::test]
    async fn start_and_stop_all_components_cleanly() {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        let controller = PipelineController::new(&config, fakes());

        controller.start(&config.server.bind_addr).await.unwrap();
        assert_eq!(controller.worker_statuses().len(), 3);
        assert!(controller.worker_statuses().iter().all(|s| s.running));

        controller.stop().await;
        assert!(controller.worker_statuses().iter().all(|s| !s.running));
    }
}
