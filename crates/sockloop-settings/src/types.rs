//! Settings types.
//!
//! Every section uses `#[serde(rename_all = "camelCase", default)]`, so a
//! settings file only needs the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound on offload worker threads.
pub const MAX_POOL_SIZE: usize = 256;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SockloopSettings {
    /// HTTP and WebSocket listener.
    pub server: ServerSettings,
    /// Blocking work offload pool.
    pub offload: OffloadSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Console input thread.
    pub console: ConsoleSettings,
}

impl SockloopSettings {
    /// Reject values the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host must not be empty".into()));
        }
        if self.offload.pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "offload.poolSize must be at least 1".into(),
            ));
        }
        if self.offload.pool_size > MAX_POOL_SIZE {
            return Err(SettingsError::InvalidValue(format!(
                "offload.poolSize must be at most {MAX_POOL_SIZE}"
            )));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks a free port.
    pub port: u16,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// How long the loop waits for the HTTP server to drain on stop.
    pub cleanup_timeout_ms: u64,
    /// Whether Ctrl-C / SIGTERM trigger shutdown.
    pub handle_signals: bool,
    /// Serve this file at `/` instead of the embedded page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<String>,
}

impl ServerSettings {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Cleanup timeout as a [`Duration`].
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_message_size: 1024 * 1024,
            cleanup_timeout_ms: 5_000,
            handle_signals: true,
            index_path: None,
        }
    }
}

/// Offload pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OffloadSettings {
    /// Number of worker threads.
    pub pool_size: usize,
    /// Blocking delay performed by `long_request`.
    pub long_request_delay_ms: u64,
    /// Upper bound on waiting for `long_request`. `None` waits forever.
    pub long_request_timeout_ms: Option<u64>,
}

impl OffloadSettings {
    /// Blocking delay as a [`Duration`].
    pub fn long_request_delay(&self) -> Duration {
        Duration::from_millis(self.long_request_delay_ms)
    }

    /// Wait bound as a [`Duration`].
    pub fn long_request_timeout(&self) -> Option<Duration> {
        self.long_request_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for OffloadSettings {
    fn default() -> Self {
        Self {
            pool_size: 2,
            long_request_delay_ms: 4_000,
            long_request_timeout_ms: Some(30_000),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`) or a full filter directive.
    pub level: String,
    /// Write logs to this file (truncated at startup) instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Console settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsoleSettings {
    /// Echo every console line back to stdout reversed.
    pub reverse_echo: bool,
}
