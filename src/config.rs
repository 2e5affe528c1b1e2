//! Configuration
//!
//! Typed configuration matching the option list in the external interface
//! contract: every field has a default, every field can be overridden by
//! an environment variable, and an optional TOML file can supply the rest.
//! There is no process-wide settings singleton; a `Config` value is built
//! once at startup and threaded through component constructors by the
//! Lifecycle Controller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration, covering every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub processing: ProcessingConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            processing: ProcessingConfig::default(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

/// Processing knobs shared by Workers, the Aggregator, and Ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_chunk_bytes: usize,
    pub max_in_flight: usize,
    pub chunk_timeout_s: f64,
    pub aggregation_timeout_s: f64,
    pub cleanup_interval_s: f64,
    pub session_grace_s: u64,
    pub sample_rate_default: u32,
    pub channels_default: u8,
    /// Per-session cap on unresolved chunks, enforced at Ingress (§4.5).
    /// `None` disables the cap.
    pub max_unresolved_per_session: Option<usize>,
    /// Enable VAD-gated routing: ASR/Diarization subscribe to
    /// `speech_present` instead of `chunk_in`, and the Aggregator
    /// short-circuits non-speech chunks.
    pub speech_gated: bool,
    /// Per-analyzer opaque options blob, keyed by `AnalyzerService::name()`
    /// and passed through to that analyzer's `initialize` untouched (§6).
    pub analyzer_options: HashMap<String, serde_json::Value>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 64 * 1024,
            max_in_flight: 4,
            chunk_timeout_s: 30.0,
            aggregation_timeout_s: 30.0,
            cleanup_interval_s: 1.0,
            session_grace_s: 300,
            sample_rate_default: 16_000,
            channels_default: 1,
            max_unresolved_per_session: Some(8),
            speech_gated: false,
            analyzer_options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl Config {
    /// Load configuration: start from defaults, merge an optional TOML
    /// file, then apply environment variable overrides — in that order,
    /// so the environment always wins.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match toml_path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
                toml::from_str(&text)
                    .map_err(|e| ConfigError::Parse(path.display().to_string(), e))?
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SPEECH_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env_parse::<usize>("SPEECH_MAX_CHUNK_BYTES") {
            self.processing.max_chunk_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("SPEECH_MAX_IN_FLIGHT") {
            self.processing.max_in_flight = v;
        }
        if let Some(v) = env_parse::<f64>("SPEECH_CHUNK_TIMEOUT_S") {
            self.processing.chunk_timeout_s = v;
        }
        if let Some(v) = env_parse::<f64>("SPEECH_AGGREGATION_TIMEOUT_S") {
            self.processing.aggregation_timeout_s = v;
        }
        if let Some(v) = env_parse::<f64>("SPEECH_CLEANUP_INTERVAL_S") {
            self.processing.cleanup_interval_s = v;
        }
        if let Some(v) = env_parse::<u64>("SPEECH_SESSION_GRACE_S") {
            self.processing.session_grace_s = v;
        }
        if let Ok(v) = std::env::var("SPEECH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("SPEECH_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "pretty" => self.logging.format = LogFormat::Pretty,
                other => tracing::warn!(value = other, "unrecognized SPEECH_LOG_FORMAT, ignoring"),
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
}
