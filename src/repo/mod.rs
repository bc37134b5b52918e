//! Durable record of decisions and sessions.

pub mod json;
pub mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::domain::{ChargingSession, Decision};

pub use json::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored data is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Append one decision to the log.
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError>;
    /// Insert or replace a session by id.
    async fn save_session(&self, session: &ChargingSession) -> Result<(), StoreError>;
    async fn load_active_session(&self) -> Result<Option<ChargingSession>, StoreError>;
    async fn load_sessions(&self) -> Result<Vec<ChargingSession>, StoreError>;
}

pub async fn open_store(cfg: &PersistenceConfig) -> Result<Arc<dyn PersistenceStore>> {
    Ok(match cfg.backend {
        PersistenceBackend::Memory => Arc::new(MemoryStore::new()),
        PersistenceBackend::Json => Arc::new(
            JsonFileStore::open(&cfg.data_dir)
                .await
                .with_context(|| format!("opening store in {}", cfg.data_dir.display()))?,
        ),
    })
}
