//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML / environment data
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize
//! - **Duration helpers**: Raw numbers live in the file, typed `Duration`s live in the code
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__HOST, APP_SESSION__CLEANUP_BUDGET_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one component of the bridge: the listener, the
/// per-connection session lifecycle, the shutdown coordinator, the summary
/// helper and the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub shutdown: ShutdownConfig,
    pub summary: SummaryConfig,
    pub records: RecordsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-connection session lifecycle settings.
///
/// ## Fields:
/// - `cleanup_budget_ms`: Time allowed for the graceful chain after an abrupt disconnect
/// - `reaper_interval_secs`: How often the reaper scans the registry
/// - `inactivity_timeout_secs`: Idle time after which a session is force-closed
/// - `heartbeat_interval_secs`: WebSocket ping period
/// - `client_timeout_secs`: Silence after which the WebSocket is considered dead
/// - `event_buffer`: Capacity of each session's outbound event channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub cleanup_budget_ms: u64,
    pub reaper_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub event_buffer: usize,
}

/// Process shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Hard deadline for the whole drain, after which the process exits unsuccessfully
    pub deadline_ms: u64,
}

/// Settings for the end-of-call summarization backend.
///
/// An empty `endpoint` disables the external call; every summary then falls
/// back to the failure placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub anthropic_version: String,
    pub timeout_ms: u64,
}

/// Record store settings.
///
/// An empty `seed_file` starts the store with no records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsConfig {
    pub table: String,
    pub key_attribute: String,
    pub seed_file: String,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// The session and shutdown numbers are the design defaults of the bridge
/// (3s disconnect cleanup, 60s reaper period, 5min inactivity, 5s shutdown).
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8082,
            },
            session: SessionConfig {
                cleanup_budget_ms: 3_000,
                reaper_interval_secs: 60,
                inactivity_timeout_secs: 300,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                event_buffer: 256,
            },
            shutdown: ShutdownConfig { deadline_ms: 5_000 },
            summary: SummaryConfig {
                endpoint: String::new(),
                api_key: String::new(),
                model_id: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
                max_tokens: 300,
                anthropic_version: "bedrock-2023-05-31".to_string(),
                timeout_ms: 10_000,
            },
            records: RecordsConfig {
                table: "customer-hotel-reservation".to_string(),
                key_attribute: "reservationId".to_string(),
                seed_file: String::new(),
            },
        }
    }
}

impl SessionConfig {
    pub fn cleanup_budget(&self) -> Duration {
        Duration::from_millis(self.cleanup_budget_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl ShutdownConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl SummaryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_SESSION__INACTIVITY_TIMEOUT_SECS=120`: Reap idle sessions after two minutes
    /// - `APP_SUMMARY__ENDPOINT=http://localhost:9000/invoke`: Enable summaries
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// The double underscore keeps field names such as `cleanup_budget_ms`
    /// intact while still addressing nested sections.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Every timer and budget is non-zero (a zero budget would force-close every disconnect)
    /// - The event channel has room for at least one event
    /// - The summary request asks for at least one token
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let timers = [
            ("session.cleanup_budget_ms", self.session.cleanup_budget_ms),
            ("session.reaper_interval_secs", self.session.reaper_interval_secs),
            ("session.inactivity_timeout_secs", self.session.inactivity_timeout_secs),
            ("session.heartbeat_interval_secs", self.session.heartbeat_interval_secs),
            ("session.client_timeout_secs", self.session.client_timeout_secs),
            ("shutdown.deadline_ms", self.shutdown.deadline_ms),
            ("summary.timeout_ms", self.summary.timeout_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(anyhow::anyhow!("{} must be greater than 0", name));
            }
        }

        if self.session.event_buffer == 0 {
            return Err(anyhow::anyhow!("session.event_buffer must be greater than 0"));
        }

        if self.summary.max_tokens == 0 {
            return Err(anyhow::anyhow!("summary.max_tokens must be greater than 0"));
        }

        if self.records.key_attribute.trim().is_empty() {
            return Err(anyhow::anyhow!("records.key_attribute cannot be empty"));
        }

        Ok(())
    }
}
