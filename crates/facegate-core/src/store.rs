//! Storage backends for the user registry.
//!
//! Each backend persists the whole user list under one logical key. A
//! missing or unparseable value loads as an empty list; write failures
//! are returned to the caller.

use crate::types::UserRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Logical key holding the serialized user list.
pub const REGISTRY_KEY: &str = "registered_users";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Load/save of the full user list.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> Result<Vec<UserRecord>, StoreError>;
    async fn save(&self, users: &[UserRecord]) -> Result<(), StoreError>;
}

/// Parse a stored value, treating garbage as "no users".
fn parse_users(raw: &str, origin: &str) -> Vec<UserRecord> {
    match serde_json::from_str(raw) {
        Ok(users) => users,
        Err(e) => {
            tracing::warn!(origin, error = %e, "unparseable registry data; starting empty");
            Vec::new()
        }
    }
}

/// In-process store, for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    value: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a raw stored value, as if written by an earlier run.
    #[cfg(test)]
    pub fn with_raw(raw: &str) -> Self {
        Self {
            value: Mutex::new(Some(raw.to_string())),
        }
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> Result<Vec<UserRecord>, StoreError> {
        let value = self
            .value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Ok(value.map(|raw| parse_users(&raw, "memory")).unwrap_or_default())
    }

    async fn save(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(users)?;
        *self
            .value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(raw);
        Ok(())
    }
}

/// One JSON file holding the list. Saves go through a temp file and a
/// rename, so a reader never sees a half-written file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<UserRecord>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(parse_users(&raw, &self.path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_vec_pretty(users)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), users = users.len(), "registry saved");
        Ok(())
    }
}

/// SQLite key-value table; the user list lives under [`REGISTRY_KEY`].
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

const CREATE_KV: &str =
    "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)";

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path.as_ref()).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(CREATE_KV)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn load(&self) -> Result<Vec<UserRecord>, StoreError> {
        use rusqlite::OptionalExtension;

        let raw: Option<String> = self
            .conn
            .call(|conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM kv WHERE key = ?1",
                        [REGISTRY_KEY],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(raw.map(|raw| parse_users(&raw, "sqlite")).unwrap_or_default())
    }

    async fn save(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(users)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![REGISTRY_KEY, raw],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
