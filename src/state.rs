//! # Application State Management
//!
//! This module holds the state shared by HTTP handlers, WebSocket connections,
//! the reaper and the shutdown coordinator.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many connection tasks hold the same registry and backend
//! - **Thread safety**: actix runs one runtime per worker thread, so every
//!   shared component must be `Send + Sync`
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership
//! - **RwLock**: Multiple readers OR one writer
//! - Only the metrics counters are written after startup; the config is a
//!   plain `Arc` because nothing changes it once loaded
//! - Locks here are only taken for short, synchronous reads and writes
//!
//! ### Trait objects
//! - `Arc<dyn SessionBackend>` and `Arc<dyn RecordStore>` let tests and
//!   deployments swap implementations without touching the handlers

use crate::config::AppConfig;
use crate::connection::handler::ConnectionContext;
use crate::records::{InMemoryRecordStore, RecordStore};
use crate::registry::SessionRegistry;
use crate::session::loopback::LoopbackBackend;
use crate::session::SessionBackend;
use crate::summary::{HttpSummaryBackend, Summarizer};
use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed after startup
    pub config: Arc<AppConfig>,

    /// Session lifecycle counters
    pub metrics: Arc<SessionMetrics>,

    /// Live sessions keyed by connection identity
    pub registry: Arc<SessionRegistry>,

    /// Factory for new session resources
    pub backend: Arc<dyn SessionBackend>,

    /// End-of-call summary helper
    pub summarizer: Arc<Summarizer>,

    /// Record lookups exposed over REST
    pub records: Arc<dyn RecordStore>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters describing what happened to sessions since startup.
///
/// ## Why these metrics matter:
/// - **connections_opened**: Total WebSocket connections accepted
/// - **graceful_closes**: Sessions released through the full graceful chain
/// - **forced_closes**: Sessions released by force after a failed or stalled chain
/// - **reaped_sessions**: Sessions force-closed by the reaper for inactivity
/// - **event_errors**: Inbound events that failed and were reported to the client
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub connections_opened: u64,
    pub graceful_closes: u64,
    pub forced_closes: u64,
    pub reaped_sessions: u64,
    pub event_errors: u64,
}

/// Thread-safe wrapper around [`AppMetrics`].
#[derive(Debug, Default)]
pub struct SessionMetrics {
    inner: RwLock<AppMetrics>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, apply: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut metrics);
    }

    pub fn record_connection_opened(&self) {
        self.update(|m| m.connections_opened += 1);
    }

    pub fn record_graceful_close(&self) {
        self.update(|m| m.graceful_closes += 1);
    }

    pub fn record_forced_close(&self) {
        self.update(|m| m.forced_closes += 1);
    }

    pub fn record_reaped(&self, count: usize) {
        self.update(|m| m.reaped_sessions += count as u64);
    }

    pub fn record_event_error(&self) {
        self.update(|m| m.event_errors += 1);
    }

    /// Copy of the counters, so the lock is not held while serializing.
    pub fn snapshot(&self) -> AppMetrics {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AppState {
    /// Build the state with the bundled backends described by `config`.
    ///
    /// ## What this does:
    /// 1. Creates an empty session registry
    /// 2. Creates the loopback session backend with the configured event buffer
    /// 3. Creates the summary helper (HTTP backend, or disabled when no endpoint is set)
    /// 4. Loads the record store seed file, if any
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let backend = Arc::new(LoopbackBackend::new(config.session.event_buffer));
        let summarizer = Arc::new(Summarizer::new(
            Arc::new(HttpSummaryBackend::new(&config.summary)?),
            &config.summary,
        ));
        let records: Arc<dyn RecordStore> = if config.records.seed_file.is_empty() {
            Arc::new(InMemoryRecordStore::new(&config.records, Vec::new()))
        } else {
            Arc::new(InMemoryRecordStore::from_file(&config.records)?)
        };

        Ok(Self::new(config, backend, summarizer, records))
    }

    pub fn new(
        config: AppConfig,
        backend: Arc<dyn SessionBackend>,
        summarizer: Arc<Summarizer>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(SessionMetrics::new()),
            registry: Arc::new(SessionRegistry::new()),
            backend,
            summarizer,
            records,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the configuration.
    pub fn get_config(&self) -> AppConfig {
        AppConfig::clone(&self.config)
    }

    /// Everything a new WebSocket connection needs to run its handler.
    pub fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            summarizer: self.summarizer.clone(),
            metrics: self.metrics.clone(),
            cleanup_budget: self.config.session.cleanup_budget(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
