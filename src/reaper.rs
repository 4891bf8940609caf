//! Periodic sweep that force-closes sessions idle past the inactivity ceiling.
//!
//! The reaper only ever uses the forced path and never waits on a session's
//! graceful shutdown. Staleness is bounded by the sweep interval.

use crate::registry::SessionRegistry;
use crate::session::ConnectionId;
use crate::state::SessionMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Reaper {
    registry: Arc<SessionRegistry>,
    metrics: Arc<SessionMetrics>,
    ceiling: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        metrics: Arc<SessionMetrics>,
        ceiling: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            ceiling,
            interval,
        }
    }

    /// Force-close every session idle for longer than the ceiling at `now`.
    ///
    /// Returns the identities this sweep removed. A failing force-close is
    /// logged and does not stop the sweep.
    pub fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        let mut reaped = Vec::new();
        for id in self.registry.list_active() {
            // Gone between listing and lookup.
            let Some(last_activity) = self.registry.last_activity(&id) else {
                continue;
            };
            let idle = now.saturating_duration_since(last_activity);
            if idle <= self.ceiling {
                continue;
            }

            match self.registry.force_close(&id) {
                Ok(true) => {
                    info!(connection_id = %id, idle_secs = idle.as_secs(), "Reaped inactive session");
                    reaped.push(id);
                }
                Ok(false) => debug!(connection_id = %id, "Session removed before it could be reaped"),
                Err(err) => error!(connection_id = %id, error = %err, "Failed to force-close inactive session"),
            }
        }

        if !reaped.is_empty() {
            self.metrics.record_reaped(reaped.len());
        }
        reaped
    }

    /// Sweep on every interval tick until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_secs = self.interval.as_secs(),
            ceiling_secs = self.ceiling.as_secs(),
            "Session reaper started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Session reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let reaped = self.sweep(Instant::now());
                    debug!(reaped = reaped.len(), live = self.registry.len(), "Reaper sweep finished");
                }
            }
        }
    }
}
