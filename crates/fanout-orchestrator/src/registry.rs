use crate::session::OrchestrationSession;
use chrono::Utc;
use fanout_core::{FanoutError, FanoutResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// In-memory index of live and recently finished sessions.
///
/// Terminal sessions stay reachable for `retention` after completion so a
/// client can reconnect to their stream or fetch the outcome.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<OrchestrationSession>>>,
    retention: Duration,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// How long terminal sessions are kept.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Register a session under its id.
    pub async fn insert(&self, session: Arc<OrchestrationSession>) {
        debug!(session_id = %session.id(), "Session registered");
        self.sessions.write().await.insert(session.id(), session);
    }

    /// Look up a session; [`FanoutError::SessionNotFound`] if unknown or already reclaimed.
    pub async fn get(&self, id: Uuid) -> FanoutResult<Arc<OrchestrationSession>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FanoutError::SessionNotFound(id))
    }

    /// Forget a session immediately.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<OrchestrationSession>> {
        self.sessions.write().await.remove(&id)
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop terminal sessions whose retention window has passed. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| match session.completed_at() {
            Some(done) if session.state().is_terminal() => (now - done)
                .to_std()
                .map_or(true, |age| age < self.retention),
            _ => true,
        });
        let swept = before - sessions.len();
        if swept > 0 {
            info!(swept, remaining = sessions.len(), "Expired sessions reclaimed");
        }
        swept
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }
}
