//! Configuration for the transformation server.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::PoolConfig;

const ENV_PREFIX: &str = "TRANSFORMATION_SERVER_";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub filter: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to bind
    pub host: String,

    /// Listening port; 0 asks the OS for a free one
    pub port: u16,

    /// Concurrent transformation invocations
    pub max_workers: usize,

    /// Requests allowed to wait for a worker; unlimited when absent
    pub max_queue_depth: Option<usize>,

    /// Largest encoded request or response accepted, in bytes
    pub max_message_bytes: usize,

    /// Advertise the service over gRPC reflection
    pub reflection: bool,

    /// Project the served registry belongs to
    pub project: String,

    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6566,
            max_workers: 10,
            max_queue_depth: None,
            max_message_bytes: 64 * 1024 * 1024,
            reflection: true,
            project: "default".to_string(),
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `TRANSFORMATION_SERVER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Read a JSON config file; missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup`, keyed by full variable name.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let key = format!("{ENV_PREFIX}{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = get("HOST") {
            self.host = value;
        }
        if let Some((key, value)) = get("PORT") {
            self.port = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_WORKERS") {
            self.max_workers = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_QUEUE_DEPTH") {
            self.max_queue_depth = match value.trim() {
                "" | "none" | "unbounded" => None,
                v => Some(parse(&key, v)?),
            };
        }
        if let Some((key, value)) = get("MAX_MESSAGE_BYTES") {
            self.max_message_bytes = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("REFLECTION") {
            self.reflection = parse(&key, &value)?;
        }
        if let Some((_, value)) = get("PROJECT") {
            self.project = value;
        }
        if let Some((key, value)) = get("LOG_FORMAT") {
            self.log.format = match value.to_ascii_lowercase().as_str() {
                "pretty" | "text" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => return Err(ConfigError::InvalidValue { key, value }),
            };
        }
        if let Some((_, value)) = get("LOG_FILTER") {
            self.log.filter = Some(value);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: Option<usize>) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_queue_depth == Some(0) {
            return Err(ConfigError::Invalid(
                "max_queue_depth must be at least 1 when set".into(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("max_message_bytes must be positive".into()));
        }
        if self.project.is_empty() {
            return Err(ConfigError::Invalid("project must not be empty".into()));
        }
        self.listen_addr().map(|_| ())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host.parse().map_err(|_| ConfigError::InvalidValue {
            key: "host".into(),
            value: self.host.clone(),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            max_queue_depth: self.max_queue_depth,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
