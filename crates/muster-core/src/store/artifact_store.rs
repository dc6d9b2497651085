//! Artifact Store: addressable storage for inter-task payloads.
//!
//! Producers write under their own task id (`tasks/{task_id}/{name}`) so
//! plans never collide. Writes are last-write-wins and atomic per key.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::models::artifact::ArtifactRecord;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `content` under `key`, replacing any previous value.
    async fn save(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<()>;

    /// Full record for `key`, or `NotFound`.
    async fn load_record(&self, key: &str) -> Result<ArtifactRecord>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Content stored under `key`. A record saved with a different content
    /// type is reported as `NotFound`.
    async fn load(&self, key: &str, content_type: &str) -> Result<Vec<u8>> {
        let record = self.load_record(key).await?;
        if record.content_type != content_type {
            return Err(EngineError::NotFound(format!(
                "Artifact {} is stored as {}, not {}",
                key, record.content_type, content_type
            )));
        }
        Ok(record.content)
    }
}

/// Process-local backend; contents are lost on exit.
#[derive(Default)]
pub struct MemoryArtifactStore {
    records: RwLock<BTreeMap<String, ArtifactRecord>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<()> {
        let record = ArtifactRecord::new(key.to_string(), content, content_type.to_string());
        self.records
            .write()
            .map_err(|_| EngineError::Storage("artifact map lock poisoned".to_string()))?
            .insert(key.to_string(), record);
        tracing::debug!("[Artifacts] Saved {}", key);
        Ok(())
    }

    async fn load_record(&self, key: &str) -> Result<ArtifactRecord> {
        self.records
            .read()
            .map_err(|_| EngineError::Storage("artifact map lock poisoned".to_string()))?
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Artifact not found: {}", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self
            .records
            .read()
            .map_err(|_| EngineError::Storage("artifact map lock poisoned".to_string()))?;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Durable backend on the shared SQLite [`Database`].
pub struct SqliteArtifactStore {
    db: Database,
}

impl SqliteArtifactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(Database::open(db_path)?))
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn save(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<()> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        let now = Utc::now().timestamp_millis();
        let logged_key = key.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO artifacts (key, content, content_type, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key) DO UPDATE SET
                       content = excluded.content,
                       content_type = excluded.content_type,
                       updated_at = excluded.updated_at",
                    rusqlite::params![key, content, content_type, now],
                )?;
                Ok(())
            })
            .await?;
        tracing::debug!("[Artifacts] Saved {}", logged_key);
        Ok(())
    }

    async fn load_record(&self, key: &str) -> Result<ArtifactRecord> {
        let k = key.to_string();
        let record = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, content, content_type, updated_at FROM artifacts WHERE key = ?1",
                )?;
                stmt.query_row(rusqlite::params![k], |row| Ok(row_to_artifact(row)))
                    .optional()
            })
            .await?;
        record.ok_or_else(|| EngineError::NotFound(format!("Artifact not found: {}", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM artifacts
                     WHERE substr(key, 1, length(?1)) = ?1
                     ORDER BY key",
                )?;
                let keys = stmt
                    .query_map(rusqlite::params![prefix], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
    }
}

use rusqlite::Row;

/// Column order: key(0), content(1), content_type(2), updated_at(3)
fn row_to_artifact(row: &Row<'_>) -> ArtifactRecord {
    let updated_ms: i64 = row.get(3).unwrap_or(0);
    ArtifactRecord {
        key: row.get(0).unwrap_or_default(),
        content: row.get(1).unwrap_or_default(),
        content_type: row.get(2).unwrap_or_default(),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}
