//! Registry of open caller channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::session::{SessionManager, SessionState};

/// Identifies one caller connection.
pub type ChannelId = Uuid;

/// Tracks the session of every connected caller, up to a fixed limit.
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<SessionManager>>,
    /// Slots handed out; reserved before insertion so the limit holds under
    /// concurrent accepts.
    reserved: AtomicUsize,
    max_channels: usize,
}

impl ChannelRegistry {
    pub fn new(max_channels: usize) -> Self {
        Self {
            channels: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_channels,
        }
    }

    /// Registers a session under a fresh channel id.
    ///
    /// Returns `None` when the registry is full.
    pub fn register(&self, session: Arc<SessionManager>) -> Option<ChannelId> {
        let max = self.max_channels;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()?;

        let id = Uuid::new_v4();
        self.channels.insert(id, session);
        Some(id)
    }

    /// Removes a channel, returning its session.
    pub fn remove(&self, id: &ChannelId) -> Option<Arc<SessionManager>> {
        let removed = self.channels.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<SessionManager>> {
        self.channels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Counts channels whose shell is currently running.
    pub async fn running_shells(&self) -> usize {
        // Snapshot first: no DashMap guard may be held across an await.
        let sessions: Vec<_> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut running = 0;
        for session in sessions {
            if session.state().await == SessionState::Running {
                running += 1;
            }
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ShellCommand, TerminalSettings};

    fn session() -> Arc<SessionManager> {
        let (session, _rx) =
            SessionManager::channel(TerminalSettings::default(), ShellCommand::new("/bin/sh"));
        Arc::new(session)
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ChannelRegistry::new(4);
        assert!(registry.is_empty());

        let id = registry.register(session()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_limit_enforced() {
        let registry = ChannelRegistry::new(2);
        let a = registry.register(session()).unwrap();
        let _b = registry.register(session()).unwrap();
        assert!(registry.register(session()).is_none());

        // Freed slots can be reused
        registry.remove(&a);
        assert!(registry.register(session()).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = ChannelRegistry::new(16);
        let a = registry.register(session()).unwrap();
        let b = registry.register(session()).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_running_shells() {
        let registry = ChannelRegistry::new(4);
        let idle = session();
        let busy = session();
        registry.register(Arc::clone(&idle)).unwrap();
        registry.register(Arc::clone(&busy)).unwrap();

        assert_eq!(registry.running_shells().await, 0);

        busy.init().await.unwrap();
        assert_eq!(registry.running_shells().await, 1);

        busy.teardown().await;
        assert_eq!(registry.running_shells().await, 0);
    }
}
