use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PersistenceStore, StoreError};
use crate::domain::{ChargingSession, Decision};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    decisions: RwLock<Vec<Decision>>,
    sessions: RwLock<Vec<ChargingSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions.read().clone()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        self.decisions.write().push(decision.clone());
        Ok(())
    }

    async fn save_session(&self, session: &ChargingSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        Ok(())
    }

    async fn load_active_session(&self) -> Result<Option<ChargingSession>, StoreError> {
        Ok(self.sessions.read().iter().find(|s| s.is_active()).cloned())
    }

    async fn load_sessions(&self) -> Result<Vec<ChargingSession>, StoreError> {
        Ok(self.sessions.read().clone())
    }
}
