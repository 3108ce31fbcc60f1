//! # Configuration Management
//!
//! Centralized configuration for the packet engine.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`PACKET_ENGINE_*` variables)
//!
//! ## Sizing Considerations
//! - Every connection holds three pooled buffers of `buffer_size` bytes, and every
//!   packet group in flight holds up to two more.
//! - A single incoming packet can never be larger than `buffer_size`; peers sending
//!   more than that get disconnected with "incoming buffer full".

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Size of every pooled buffer (50 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 50 * 1024;

/// Number of outgoing worker threads
pub const DEFAULT_WORKER_THREADS: usize = 3;

/// How often a connection flushes its joined packet group
pub const DEFAULT_JOINED_GROUP_INTERVAL: Duration = Duration::from_millis(333);

/// Upper bound on the packets merged into one joined group
pub const DEFAULT_MAX_JOINED_PACKETS: usize = 64;

/// Idle buffers the pool keeps between uses
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 1024;

fn default_max_idle_buffers() -> usize {
    DEFAULT_MAX_IDLE_BUFFERS
}

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Connection pipeline and worker pool configuration
    #[serde(default)]
    pub core: CoreConfig,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PACKET_ENGINE_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(size) = std::env::var("PACKET_ENGINE_BUFFER_SIZE") {
            config.core.buffer_size = size.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid PACKET_ENGINE_BUFFER_SIZE: {e}"))
            })?;
        }

        if let Ok(workers) = std::env::var("PACKET_ENGINE_WORKER_THREADS") {
            config.core.worker_threads = workers.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid PACKET_ENGINE_WORKER_THREADS: {e}"))
            })?;
        }

        if let Ok(interval) = std::env::var("PACKET_ENGINE_JOINED_GROUP_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.core.joined_group_interval = Duration::from_millis(val);
            }
        }

        if let Ok(max) = std::env::var("PACKET_ENGINE_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.core.validate());
        errors.extend(self.server.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Connection pipeline and worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Size of every pooled buffer in bytes
    pub buffer_size: usize,

    /// Buffers allocated up front when the pool is created
    pub preallocated_buffers: usize,

    /// Number of outgoing worker threads
    pub worker_threads: usize,

    /// Flush interval for joined packet groups
    #[serde(with = "duration_serde")]
    pub joined_group_interval: Duration,

    /// Maximum number of packets merged into one joined group
    pub max_joined_packets: usize,

    /// Idle buffers kept by the pool; buffers returned beyond this are freed
    #[serde(default = "default_max_idle_buffers")]
    pub max_idle_buffers: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            preallocated_buffers: 32,
            worker_threads: DEFAULT_WORKER_THREADS,
            joined_group_interval: DEFAULT_JOINED_GROUP_INTERVAL,
            max_joined_packets: DEFAULT_MAX_JOINED_PACKETS,
            max_idle_buffers: DEFAULT_MAX_IDLE_BUFFERS,
        }
    }
}

impl CoreConfig {
    /// Validate core configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.buffer_size < 1024 {
            errors.push(format!(
                "Buffer size too small: {} bytes (minimum: 1 KB)",
                self.buffer_size
            ));
        } else if self.buffer_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Buffer size too large: {} bytes (maximum: 16 MB)",
                self.buffer_size
            ));
        }

        if self.preallocated_buffers > 100_000 {
            errors.push(format!(
                "Too many preallocated buffers: {} (maximum: 100,000)",
                self.preallocated_buffers
            ));
        }

        if self.max_idle_buffers < self.preallocated_buffers {
            errors.push(format!(
                "Max idle buffers ({}) below preallocated buffers ({})",
                self.max_idle_buffers, self.preallocated_buffers
            ));
        }

        if self.worker_threads == 0 {
            errors.push("Worker threads must be greater than 0".to_string());
        } else if self.worker_threads > 256 {
            errors.push(format!(
                "Worker threads too many: {} (maximum: 256)",
                self.worker_threads
            ));
        }

        if self.joined_group_interval.as_millis() < 10 {
            errors.push("Joined group interval too short (minimum: 10ms)".to_string());
        } else if self.joined_group_interval.as_secs() > 10 {
            errors.push("Joined group interval too long (maximum: 10s)".to_string());
        }

        if self.max_joined_packets == 0 {
            errors.push("Max joined packets must be greater than 0".to_string());
        }

        errors
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "0.0.0.0:2593")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:2593"),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:2593')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("packet-engine"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
