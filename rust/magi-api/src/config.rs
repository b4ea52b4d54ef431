//! Configuration management for the MAGI API.
//!
//! Configuration is loaded from three layers, later layers winning:
//! built-in defaults, an optional `config/magi` file, and `MAGI`-prefixed
//! environment variables (double-underscore separated, e.g.
//! `MAGI__ENGINE__DEBATE_ROUNDS=2`). A handful of conventional variables
//! (`MAGI_API_KEY`, `OPENAI_API_KEY`, `MAGI_MODEL`) are honored directly.

use serde::{Deserialize, Serialize};

use magi_core::config::EngineConfig;
use magi_core::error::{MagiError, MagiResult};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Deliberation engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Session lifecycle configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_request_timeout(),
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Retention in seconds.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    /// Expiry sweep cadence in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Simultaneously running sessions.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Default deliberation deadline in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_session_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config files and environment.
    pub fn load() -> MagiResult<Self> {
        let config = Self::load_unchecked()?;
        config.validate()?;
        Ok(config)
    }

    /// Load without validation; useful in tests.
    pub fn load_unchecked() -> MagiResult<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let layered = config::Config::builder()
            .add_source(config::File::with_name("config/magi").required(false))
            .add_source(
                config::Environment::with_prefix("MAGI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MagiError::Configuration(e.to_string()))?;

        let mut app_config: AppConfig = layered
            .try_deserialize()
            .map_err(|e| MagiError::Configuration(e.to_string()))?;

        // Conventional environment overrides.
        if let Ok(key) = std::env::var("MAGI_API_KEY") {
            app_config.engine.llm.api_key = Some(key);
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            app_config.engine.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("MAGI_MODEL") {
            app_config.engine.llm.model = model;
        }
        if let Ok(base_url) = std::env::var("MAGI_BASE_URL") {
            app_config.engine.llm.base_url = base_url;
        }

        Ok(app_config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> MagiResult<()> {
        self.engine.validate()?;
        if self.session.max_concurrency == 0 {
            return Err(MagiError::Configuration(
                "session.max_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_session_ttl() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    10
}

fn default_session_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}
