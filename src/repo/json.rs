use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{PersistenceStore, StoreError};
use crate::domain::{ChargingSession, Decision};

const SESSIONS_FILE: &str = "sessions.json";
const DECISIONS_FILE: &str = "decisions.jsonl";

/// File-backed store under one data directory.
///
/// Sessions are rewritten as a whole through a temp file and rename, so a
/// crash mid-write leaves the previous file intact. Decisions are appended
/// as JSON lines.
#[derive(Debug)]
pub struct JsonFileStore {
    sessions_path: PathBuf,
    decisions_path: PathBuf,
    sessions: Mutex<Vec<ChargingSession>>,
    decisions: Mutex<()>,
}

impl JsonFileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let sessions_path = dir.join(SESSIONS_FILE);
        let sessions = read_sessions(&sessions_path).await?;
        info!(
            path = %sessions_path.display(),
            sessions = sessions.len(),
            "Opened session store"
        );
        Ok(Self {
            decisions_path: dir.join(DECISIONS_FILE),
            sessions_path,
            sessions: Mutex::new(sessions),
            decisions: Mutex::new(()),
        })
    }

    /// Every decision in the log, oldest first.
    pub async fn read_decisions(&self) -> Result<Vec<Decision>, StoreError> {
        let _guard = self.decisions.lock().await;
        let contents = match fs::read_to_string(&self.decisions_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StoreError::from))
            .collect()
    }

    async fn write_sessions(&self, sessions: &[ChargingSession]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(sessions)?;
        let temp_path = self.sessions_path.with_extension("tmp");
        fs::write(&temp_path, &json).await?;
        fs::rename(&temp_path, &self.sessions_path).await?;
        debug!(sessions = sessions.len(), "Persisted sessions");
        Ok(())
    }
}

async fn read_sessions(path: &Path) -> Result<Vec<ChargingSession>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(decision)?;
        line.push(b'\n');

        let _guard = self.decisions.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.decisions_path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn save_session(&self, session: &ChargingSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        self.write_sessions(&sessions).await
    }

    async fn load_active_session(&self) -> Result<Option<ChargingSession>, StoreError> {
        Ok(self.sessions.lock().await.iter().find(|s| s.is_active()).cloned())
    }

    async fn load_sessions(&self) -> Result<Vec<ChargingSession>, StoreError> {
        Ok(self.sessions.lock().await.clone())
    }
}
