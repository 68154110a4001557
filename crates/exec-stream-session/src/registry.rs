//! Registry of live sessions.

use std::{collections::HashMap, time::Duration};

use futures::future::join_all;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::controller::SessionHandle;

/// Live sessions of one serving process, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session.
    pub async fn insert(&self, handle: SessionHandle) {
        tracing::debug!(id = %handle.id(), "Registering session");
        self.sessions.write().await.insert(handle.id(), handle);
    }

    /// Stop tracking a session.
    pub async fn remove(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Ask every session to shut down with `reason`.
    ///
    /// Returns how many sessions accepted the request.
    pub async fn shutdown_all(&self, reason: Option<&str>) -> usize {
        let sessions = self.sessions.read().await;
        let accepted = sessions
            .values()
            .filter(|handle| handle.shutdown(reason.map(str::to_string)))
            .count();
        tracing::info!(sessions = sessions.len(), accepted, "Shutting down sessions");
        accepted
    }

    /// Wait up to `limit` for every tracked session to reach a terminal
    /// state. Returns whether they all did.
    pub async fn wait_all(&self, limit: Duration) -> bool {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        tokio::time::timeout(limit, join_all(handles.iter().map(SessionHandle::wait)))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use exec_stream_core::{
        ExitStatus, ProcessEndpoint, ProcessError, ProcessHandle, SessionConfig, memory,
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::{SessionController, SessionState};

    /// Runs until killed.
    struct Sleeper(Arc<Notify>);

    #[async_trait]
    impl ProcessHandle for Sleeper {
        async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
            self.0.notified().await;
            Ok(ExitStatus::from_signal(15))
        }

        fn kill(&mut self) -> Result<(), ProcessError> {
            self.0.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = SessionRegistry::new();
        let mut peers = Vec::new();
        for _ in 0..2 {
            let (local, peer) = memory::pair(16);
            let controller = SessionController::new(SessionConfig::default()).unwrap();
            registry.insert(controller.handle()).await;
            let endpoint = ProcessEndpoint::new(Sleeper(Arc::new(Notify::new())));
            tokio::spawn(controller.serve(local, endpoint));
            peers.push(peer);
        }
        assert_eq!(registry.len().await, 2);

        assert_eq!(registry.shutdown_all(Some("server stopping")).await, 2);
        assert!(registry.wait_all(Duration::from_secs(5)).await);
        for id in registry.ids().await {
            let handle = registry.remove(id).await.unwrap();
            assert_eq!(
                handle.state(),
                SessionState::Shutdown {
                    reason: Some("server stopping".into())
                }
            );
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_wait_all_times_out() {
        let registry = SessionRegistry::new();
        let (local, _peer) = memory::pair(16);
        let controller = SessionController::new(SessionConfig::default()).unwrap();
        let id = controller.id();
        registry.insert(controller.handle()).await;
        tokio::spawn(controller.serve(local, ProcessEndpoint::new(Sleeper(Arc::new(Notify::new())))));

        assert!(!registry.wait_all(Duration::from_millis(50)).await);
        assert!(registry.get(id).await.is_some());
    }
}
