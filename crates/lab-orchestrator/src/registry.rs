//! In-memory session table
//!
//! Each session sits behind its own async mutex so operations on one session
//! serialize (including across provisioner and archive awaits) while
//! different sessions proceed in parallel.

use crate::session::{Session, SessionId, SessionSnapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type SessionCell = Arc<Mutex<Session>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionCell>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionCell> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Fetch the session, inserting `make()` if it does not exist yet
    pub fn get_or_create(&self, id: &SessionId, make: impl FnOnce() -> Session) -> SessionCell {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(make())))
            .value()
            .clone()
    }

    /// All session cells, cloned out so no map shard stays locked
    pub fn cells(&self) -> Vec<(SessionId, SessionCell)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshots of every session not currently locked by an operation
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.cells()
            .into_iter()
            .filter_map(|(_, cell)| cell.try_lock().ok().map(|session| session.snapshot()))
            .collect()
    }

    /// Drop terminal sessions that finished more than `ttl` before `now`
    pub fn prune_terminated(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut pruned = 0;

        for (id, cell) in self.cells() {
            let expired = match cell.try_lock() {
                Ok(session) => {
                    session.state.is_terminal()
                        && now.signed_duration_since(session.last_active_at) > ttl
                }
                Err(_) => false,
            };
            // Only remove the exact cell we inspected
            if expired
                && self
                    .sessions
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &cell))
                    .is_some()
            {
                pruned += 1;
            }
        }

        pruned
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointDefinition;
    use crate::session::SessionState;

    fn session(id: &SessionId) -> Session {
        Session::new(id.clone(), "alice", &[CheckpointDefinition::network_layer_subnet()])
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_cell() {
        let registry = SessionRegistry::new();
        let id = SessionId::new();

        let first = registry.get_or_create(&id, || session(&id));
        let second = registry.get_or_create(&id, || panic!("must not rebuild"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&SessionId::new()).is_none());
    }

    #[tokio::test]
    async fn test_prune_only_old_terminal_sessions() {
        let registry = SessionRegistry::new();
        let done = SessionId::new();
        let active = SessionId::new();

        let cell = registry.get_or_create(&done, || session(&done));
        cell.lock().await.transition(SessionState::Abandoned).unwrap();
        registry.get_or_create(&active, || session(&active));

        let ttl = Duration::from_secs(60);
        assert_eq!(registry.prune_terminated(Utc::now(), ttl), 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.prune_terminated(later, ttl), 1);
        assert!(registry.get(&done).is_none());
        assert!(registry.get(&active).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_skips_locked_sessions() {
        let registry = SessionRegistry::new();
        let a = SessionId::new();
        let b = SessionId::new();
        let cell = registry.get_or_create(&a, || session(&a));
        registry.get_or_create(&b, || session(&b));

        let _guard = cell.lock().await;
        let snapshots = registry.snapshot();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].session_id, b);
    }
}
