//! # Session Registry
//!
//! Process-wide table of live sessions keyed by connection identity. It is
//! the only state shared between connection tasks, the reaper and the
//! shutdown coordinator.
//!
//! ## Invariants:
//! - At most one session per connection identity; a duplicate `register`
//!   is reported as an invariant violation, never silently overwritten
//! - An entry is keyed by the identity its session was created for
//! - Removal happens exactly once: `unregister` hands the removed handle to
//!   exactly one caller, every other caller gets `None`
//!
//! ## Thread Safety:
//! A `std::sync::RwLock` guards the map. Every method takes the lock, does
//! its work and releases it before returning, so no lock is ever held across
//! an `.await` on a session call.

use crate::error::{AppError, AppResult};
use crate::session::{ConnectionId, SessionControl, SessionError};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;
use tracing::{debug, error};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Arc<dyn SessionControl>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Record the session created for `id`.
    pub fn register(&self, id: ConnectionId, handle: Arc<dyn SessionControl>) -> AppResult<()> {
        if handle.id() != &id {
            error!(connection_id = %id, session = %handle.id(), "Session belongs to another connection");
            return Err(AppError::InvariantViolation(format!(
                "session {} cannot be registered under {}",
                handle.id(),
                id
            )));
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.entry(id) {
            Entry::Occupied(entry) => {
                error!(connection_id = %entry.key(), "Refusing to register a second session");
                Err(AppError::InvariantViolation(format!(
                    "session {} is already registered",
                    entry.key()
                )))
            }
            Entry::Vacant(entry) => {
                debug!(connection_id = %entry.key(), "Session registered");
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Remove `id`, returning the handle only to the caller that removed it.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<dyn SessionControl>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            debug!(connection_id = %id, "Session unregistered");
        }
        removed
    }

    /// Unregister and force-close `id`.
    ///
    /// Returns `Ok(true)` if this call performed the removal, `Ok(false)` if
    /// the session was already gone (a repeat call is a no-op).
    pub fn force_close(&self, id: &ConnectionId) -> Result<bool, SessionError> {
        match self.unregister(id) {
            Some(handle) => handle.force_close().map(|()| true),
            None => Ok(false),
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn is_active(&self, id: &ConnectionId) -> bool {
        self.get(id).map(|handle| handle.is_active()).unwrap_or(false)
    }

    pub fn last_activity(&self, id: &ConnectionId) -> Option<Instant> {
        self.get(id).map(|handle| handle.last_activity())
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn SessionControl>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Identities of every registered session.
    pub fn list_active(&self) -> Vec<ConnectionId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Point-in-time copy of the table; the lock is released on return.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<dyn SessionControl>)> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedSession;

    #[test]
    fn test_duplicate_register_is_rejected() {
        let registry = SessionRegistry::new();
        let first = ScriptedSession::new("conn-1");
        let second = ScriptedSession::new("conn-1");

        registry.register(ConnectionId::from("conn-1"), first.clone()).unwrap();
        let err = registry
            .register(ConnectionId::from("conn-1"), second)
            .unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert_eq!(registry.len(), 1);

        // The original entry survives the rejected registration.
        let kept = registry.get(&ConnectionId::from("conn-1")).unwrap();
        kept.force_close().unwrap();
        assert_eq!(first.force_close_count(), 1);
    }

    #[test]
    fn test_repeat_unregister_is_noop() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::from("conn-2");
        registry.register(id.clone(), ScriptedSession::new("conn-2")).unwrap();

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_force_close_twice_closes_once() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::from("conn-3");
        let session = ScriptedSession::new("conn-3");
        registry.register(id.clone(), session.clone()).unwrap();

        assert_eq!(registry.force_close(&id), Ok(true));
        assert_eq!(registry.force_close(&id), Ok(false));
        assert_eq!(session.force_close_count(), 1);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_collaborator_queries() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::from("conn-4");
        let session = ScriptedSession::new("conn-4");
        registry.register(id.clone(), session.clone()).unwrap();

        assert!(registry.is_active(&id));
        assert_eq!(registry.list_active(), vec![id.clone()]);
        assert_eq!(registry.last_activity(&id), Some(session.last_activity()));
        assert!(!registry.is_active(&ConnectionId::from("missing")));
    }

    #[test]
    fn test_register_under_foreign_identity_is_rejected() {
        let registry = SessionRegistry::new();
        let err = registry
            .register(ConnectionId::from("conn-6"), ScriptedSession::new("conn-7"))
            .unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_unregister_has_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let id = ConnectionId::from("conn-5");
        registry.register(id.clone(), ScriptedSession::new("conn-5")).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { registry.unregister(&id).is_some() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
