//! # Shutdown Coordination
//!
//! Orderly process termination on SIGINT/SIGTERM. The whole sequence races
//! one overall deadline; whichever finishes first decides the exit status
//! and the loser's remaining work is dropped.
//!
//! ## Sequence:
//! 1. Stop accepting new connections
//! 2. Drain every registered session concurrently: graceful chain, then
//!    unregister; on failure force-close through the registry, so a session
//!    the reaper or its connection already removed is not closed twice
//! 3. Close the listening endpoint
//!
//! ## Exit status:
//! Success only when all three steps finish before the deadline. Individual
//! session failures during the drain do not change the outcome.

use crate::deadline::{self, Deadline};
use crate::registry::SessionRegistry;
use crate::session::{graceful_chain, ConnectionId, SessionControl};
use crate::state::SessionMetrics;
use actix_web::dev::ServerHandle;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The connection-accepting side of the server.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn stop_accepting(&self);

    async fn close(&self);
}

#[async_trait]
impl Endpoint for ServerHandle {
    async fn stop_accepting(&self) {
        self.pause().await;
    }

    async fn close(&self) {
        self.stop(false).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every step finished in time
    Drained { closed: usize, forced: usize },
    /// The deadline fired first; unfinished steps were abandoned
    DeadlineExceeded,
}

impl ShutdownOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ShutdownOutcome::Drained { .. })
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Drain {
    Closed,
    Forced,
    /// Another actor (reaper or connection teardown) removed it first
    AlreadyRemoved,
}

pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    metrics: Arc<SessionMetrics>,
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<SessionMetrics>, deadline: Duration) -> Self {
        Self {
            registry,
            metrics,
            deadline,
        }
    }

    pub async fn run<E: Endpoint + ?Sized>(&self, endpoint: &E) -> ShutdownOutcome {
        info!(
            sessions = self.registry.len(),
            deadline_ms = self.deadline.as_millis() as u64,
            "Shutting down"
        );

        match deadline::race(self.deadline, self.sequence(endpoint)).await {
            Deadline::Completed((closed, forced)) => {
                info!(closed, forced, "Shutdown complete");
                ShutdownOutcome::Drained { closed, forced }
            }
            Deadline::Expired => {
                error!(
                    remaining = self.registry.len(),
                    "Shutdown deadline exceeded, terminating"
                );
                ShutdownOutcome::DeadlineExceeded
            }
        }
    }

    async fn sequence<E: Endpoint + ?Sized>(&self, endpoint: &E) -> (usize, usize) {
        endpoint.stop_accepting().await;

        if self.registry.is_empty() {
            debug!("No live sessions to drain");
        }
        let drains = self
            .registry
            .snapshot()
            .into_iter()
            .map(|(id, handle)| self.drain(id, handle));
        let results = join_all(drains).await;

        endpoint.close().await;

        let closed = results.iter().filter(|r| **r == Drain::Closed).count();
        let forced = results.iter().filter(|r| **r == Drain::Forced).count();
        (closed, forced)
    }

    async fn drain(&self, id: ConnectionId, handle: Arc<dyn SessionControl>) -> Drain {
        match graceful_chain(handle.as_ref()).await {
            Ok(()) => {
                self.registry.unregister(&id);
                self.metrics.record_graceful_close();
                Drain::Closed
            }
            Err(err) => {
                warn!(connection_id = %id, error = %err, "Graceful close failed during shutdown, forcing");
                match self.registry.force_close(&id) {
                    Ok(true) => {
                        self.metrics.record_forced_close();
                        Drain::Forced
                    }
                    Ok(false) => {
                        debug!(connection_id = %id, "Session already removed");
                        Drain::AlreadyRemoved
                    }
                    Err(err) => {
                        // The entry was still ours to remove.
                        error!(connection_id = %id, error = %err, "Force-close failed during shutdown");
                        self.metrics.record_forced_close();
                        Drain::Forced
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedSession;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEndpoint {
        steps: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        async fn stop_accepting(&self) {
            self.steps.lock().unwrap().push("stop_accepting");
        }

        async fn close(&self) {
            self.steps.lock().unwrap().push("close");
        }
    }

    fn coordinator(registry: Arc<SessionRegistry>) -> ShutdownCoordinator {
        ShutdownCoordinator::new(registry, Arc::new(SessionMetrics::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_drain_isolates_failing_session() {
        let registry = Arc::new(SessionRegistry::new());
        let healthy = ScriptedSession::new("a");
        let broken = ScriptedSession::new("b");
        broken.fail_on("endPrompt");
        registry.register(ConnectionId::from("a"), healthy.clone()).unwrap();
        registry.register(ConnectionId::from("b"), broken.clone()).unwrap();

        let endpoint = RecordingEndpoint::default();
        let outcome = coordinator(registry.clone()).run(&endpoint).await;

        assert_eq!(outcome, ShutdownOutcome::Drained { closed: 1, forced: 1 });
        assert!(outcome.is_success());
        assert_eq!(healthy.calls(), vec!["endAudioContent", "endPrompt", "close"]);
        assert_eq!(broken.force_close_count(), 1);
        assert!(registry.is_empty());
        assert_eq!(*endpoint.steps.lock().unwrap(), vec!["stop_accepting", "close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_drain_hits_deadline() {
        let registry = Arc::new(SessionRegistry::new());
        let stuck = ScriptedSession::new("stuck");
        stuck.hang_on("endAudioContent");
        registry.register(ConnectionId::from("stuck"), stuck.clone()).unwrap();
        registry.register(ConnectionId::from("quick"), ScriptedSession::new("quick")).unwrap();

        let endpoint = RecordingEndpoint::default();
        let started = tokio::time::Instant::now();
        let outcome = coordinator(registry.clone()).run(&endpoint).await;

        assert_eq!(outcome, ShutdownOutcome::DeadlineExceeded);
        assert!(!outcome.is_success());
        assert!(started.elapsed() >= Duration::from_secs(5));
        // The stalled session was abandoned, never gracefully closed.
        assert!(!stuck.calls().contains(&"close".to_string()));
        assert!(registry.contains(&ConnectionId::from("stuck")));
        // The listener close step was abandoned with it.
        assert_eq!(*endpoint.steps.lock().unwrap(), vec!["stop_accepting"]);
    }

    #[tokio::test]
    async fn test_drain_does_not_force_close_already_reaped_session() {
        let registry = Arc::new(SessionRegistry::new());
        let id = ConnectionId::from("reaped");
        let session = ScriptedSession::new("reaped");
        session.fail_on("endAudioContent");
        registry.register(id.clone(), session.clone()).unwrap();

        // Snapshot taken by the drain, then the reaper wins the removal.
        let handle = registry.get(&id).unwrap();
        assert_eq!(registry.force_close(&id), Ok(true));

        let coordinator = coordinator(registry.clone());
        assert_eq!(coordinator.drain(id, handle).await, Drain::AlreadyRemoved);
        assert_eq!(session.force_close_count(), 1);
        assert_eq!(coordinator.metrics.snapshot().forced_closes, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_drains_immediately() {
        let endpoint = RecordingEndpoint::default();
        let outcome = coordinator(Arc::new(SessionRegistry::new())).run(&endpoint).await;
        assert_eq!(outcome, ShutdownOutcome::Drained { closed: 0, forced: 0 });
    }
}
