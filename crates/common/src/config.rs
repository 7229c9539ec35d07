//! Configuration structures for relayq
//!
//! This module defines the configuration used by the broker, workers and
//! clients. Configuration is read from an optional YAML file and can be
//! overridden by `RELAYQ_*` environment variables, using `__` between
//! nested keys (`RELAYQ_BROKER__FRONTEND_ADDRESS=0.0.0.0:5505`).

use crate::error::{RelayError, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "RELAYQ_CONFIG";

/// Configuration file used when `RELAYQ_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "configs/relayq.yaml";

const ENV_PREFIX: &str = "RELAYQ";

/// Top-level configuration for relayq components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Broker endpoints
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Worker peer configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Client peer configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Broker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address clients connect to
    #[serde(default = "default_frontend_address")]
    pub frontend_address: String,

    /// Address workers connect to
    #[serde(default = "default_backend_address")]
    pub backend_address: String,

    /// Capacity of the channels feeding the broker loop
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Broker backend address
    #[serde(default = "default_backend_address")]
    pub backend_address: String,

    /// Name announced in the ready handshake
    #[serde(default)]
    pub name: Option<String>,

    /// Leave the pool after this many replies
    #[serde(default)]
    pub max_replies: Option<u64>,
}

/// Client-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker frontend address
    #[serde(default = "default_frontend_address")]
    pub frontend_address: String,

    /// Number of requests to issue
    #[serde(default = "default_requests")]
    pub requests: u32,

    /// Pause between consecutive requests in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_frontend_address() -> String {
    "127.0.0.1:5505".to_string()
}

fn default_backend_address() -> String {
    "127.0.0.1:5506".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_requests() -> u32 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend_address: default_frontend_address(),
            backend_address: default_backend_address(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend_address: default_backend_address(),
            name: None,
            max_replies: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            frontend_address: default_frontend_address(),
            requests: default_requests(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the file named by `RELAYQ_CONFIG`
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// still apply.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = Config::builder()
            .add_source(File::with_name(&path).format(FileFormat::Yaml).required(false));

        Self::finish(builder, None)
    }

    /// Load configuration from a YAML file, with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RelayError::config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        let builder = Config::builder().add_source(File::from(path).format(FileFormat::Yaml));
        Self::finish(builder, None)
    }

    /// Parse configuration from a YAML document, without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: RelayConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn finish(
        builder: ConfigBuilder<config::builder::DefaultState>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let config: RelayConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.broker.frontend_address.trim().is_empty() {
            return Err(RelayError::config("Broker frontend address is empty"));
        }
        if self.broker.backend_address.trim().is_empty() {
            return Err(RelayError::config("Broker backend address is empty"));
        }
        if self.broker.frontend_address == self.broker.backend_address {
            return Err(RelayError::config(format!(
                "Frontend and backend share the address {}",
                self.broker.frontend_address
            )));
        }
        if self.broker.queue_capacity == 0 {
            return Err(RelayError::config("Broker queue capacity must be positive"));
        }
        if self.worker.backend_address.trim().is_empty() {
            return Err(RelayError::config("Worker backend address is empty"));
        }
        if self.worker.max_replies == Some(0) {
            return Err(RelayError::config("Worker max_replies must be positive when set"));
        }
        if self.client.frontend_address.trim().is_empty() {
            return Err(RelayError::config("Client frontend address is empty"));
        }
        if self.client.requests == 0 {
            return Err(RelayError::config("Client must issue at least one request"));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Pause between consecutive requests
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
