//! Registry of agent sessions.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tether_core::SessionId;
use thiserror::Error;

use crate::Session;

/// Registry error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session id already registered: {0}")]
    Duplicate(SessionId),
}

/// Registry for the sessions known to the controller.
///
/// Cheap to clone; all clones share one map. Every operation takes the lock
/// for a bounded, non-async critical section, so no caller ever holds it
/// across I/O.
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<BTreeMap<SessionId, Arc<Session>>>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next session id. Ids start at 1 and are never reused.
    #[must_use]
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a freshly connected session.
    ///
    /// # Errors
    /// Returns error if the id is already present.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let id = session.id();
        if sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        sessions.insert(id, session);
        tracing::debug!(session = id, total = sessions.len(), "Registered session");
        Ok(())
    }

    /// Flag a session as disconnected. Idempotent; returns true only if this
    /// call changed the flag.
    pub fn mark_disconnected(&self, id: SessionId) -> bool {
        let sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let flipped = sessions
            .get(&id)
            .is_some_and(|session| session.mark_disconnected());
        if flipped {
            tracing::info!(session = id, "Client disconnected");
        }
        flipped
    }

    /// Snapshot of every session with its connected flag, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<(Arc<Session>, bool)> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| (Arc::clone(s), s.is_connected()))
            .collect()
    }

    /// Snapshot of connected sessions, ordered by id.
    #[must_use]
    pub fn connected(&self) -> Vec<Arc<Session>> {
        self.list()
            .into_iter()
            .filter_map(|(s, connected)| connected.then_some(s))
            .collect()
    }

    /// Get a session by id.
    ///
    /// # Errors
    /// Returns error if no session has this id.
    pub fn lookup(&self, id: SessionId) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Drop disconnected sessions. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| s.is_connected());
        before - sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn add(registry: &Registry) -> SessionId {
        let id = registry.allocate_id();
        registry
            .register(Arc::new(Session::new(id, None, tokio::io::sink())))
            .unwrap();
        id
    }

    #[test]
    fn ids_are_unique_under_concurrent_registration() {
        let registry = Registry::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        add(&registry);
                    }
                });
            }
        });

        let listed = registry.list();
        assert_eq!(listed.len(), 400);
        let ids: HashSet<_> = listed.iter().map(|(s, _)| s.id()).collect();
        assert_eq!(ids.len(), 400);
        assert!(ids.contains(&1));
    }

    #[test]
    fn connected_flag_only_goes_down() {
        let registry = Registry::new();
        let id = add(&registry);

        assert!(registry.mark_disconnected(id));
        assert!(!registry.mark_disconnected(id));
        assert!(!registry.mark_disconnected(999));

        let (session, connected) = &registry.list()[0];
        assert_eq!(session.id(), id);
        assert!(!connected);

        // A reconnect is a new session, never a revival of the old one.
        let again = add(&registry);
        assert_ne!(again, id);
        assert!(!registry.lookup(id).unwrap().is_connected());
        assert!(registry.lookup(again).unwrap().is_connected());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = Registry::new();
        let id = add(&registry);
        let clash = Arc::new(Session::new(id, None, tokio::io::sink()));
        assert_eq!(registry.register(clash), Err(RegistryError::Duplicate(id)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_and_prune() {
        let registry = Registry::new();
        let a = add(&registry);
        let b = add(&registry);
        assert_eq!(registry.lookup(42).unwrap_err(), RegistryError::NotFound(42));

        registry.mark_disconnected(a);
        assert_eq!(
            registry.connected().iter().map(|s| s.id()).collect::<Vec<_>>(),
            vec![b]
        );
        assert_eq!(registry.prune(), 1);
        assert!(registry.lookup(a).is_err());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
