mod files;
mod secrets;
mod uploads;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqlitePool, migrate::Migrator};
use thiserror::Error;

pub use files::{FileRecord, FileStore};
pub use secrets::{CredentialStorage, SecretError};
pub use uploads::{UploadInput, UploadRecord, UploadResult, UploadStatus, UploadStore};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {column} value: {value}")]
    InvalidValue { column: &'static str, value: i64 },
    #[error("row not found after write")]
    MissingRow,
}

/// Shared SQLite pool behind the upload and file stores.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let database = Self { pool };
        database.init().await?;
        Ok(database)
    }

    /// Single-connection in-memory database, so every handle sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let database = Self { pool };
        database.init().await?;
        Ok(database)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn uploads(&self) -> UploadStore {
        UploadStore::from_pool(self.pool.clone())
    }

    pub fn files(&self) -> FileStore {
        FileStore::from_pool(self.pool.clone())
    }
}

pub(crate) fn now_millis() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}
