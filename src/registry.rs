//! Read-only view of the sessions currently attached to containers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{SessionState, SessionSummary};

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, SessionSummary>>>,
}

/// Removes its session from the registry when dropped.
pub struct RegistrationGuard {
    registry: SessionRegistry,
    id: Uuid,
}

impl RegistrationGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.inner.write().remove(&self.id);
    }
}

impl SessionRegistry {
    pub fn register(&self, id: Uuid, container_id: &str, state: SessionState) -> RegistrationGuard {
        let summary = SessionSummary {
            id,
            container_id: container_id.to_string(),
            state,
            started_at: Utc::now(),
        };
        self.inner.write().insert(id, summary);
        RegistrationGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn update(&self, id: Uuid, state: SessionState) {
        if let Some(summary) = self.inner.write().get_mut(&id) {
            summary.state = state;
        }
    }

    /// Sessions ordered by start time, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self.inner.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Number of live sessions attached to `container_id`.
    pub fn count_for(&self, container_id: &str) -> usize {
        self.inner
            .read()
            .values()
            .filter(|s| s.container_id == container_id)
            .count()
    }
}
