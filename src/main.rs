//! Speech Pipeline Server
//!
//! Loads configuration, wires up the pipeline via the Lifecycle
//! Controller, and runs until interrupted.

use speech_pipeline::analyzer::{AnalyzerService, FakeAsr, FakeDiarization, FakeVad};
use speech_pipeline::config::Config;
use speech_pipeline::lifecycle::PipelineController;
use speech_pipeline::telemetry;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    telemetry::init(&config.logging);
    tracing::info!(bind_addr = %config.server.bind_addr, "loaded configuration");

    // Real VAD/ASR/diarization engines are external collaborators; the
    // fakes below are wired in until a deployment supplies its own.
    let analyzers: Vec<Arc<dyn AnalyzerService>> = vec![
        Arc::new(FakeVad::new()),
        Arc::new(FakeAsr::new()),
        Arc::new(FakeDiarization::new()),
    ];

    let controller = PipelineController::new(&config, analyzers);
    controller.start(&config.server.bind_addr).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    controller.stop().await;

    Ok(())
}
