use nextsync_core::RemoteFile;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub account: String,
    pub remote_path: String,
    pub storage_path: Option<String>,
    pub size: Option<i64>,
    pub modified: Option<i64>,
    pub etag: Option<String>,
    pub remote_id: Option<String>,
    pub mime_type: Option<String>,
    pub last_sync: Option<i64>,
    pub in_conflict: bool,
}

/// Local view of remote files, one row per account and remote path.
#[derive(Clone)]
pub struct FileStore {
    pool: SqlitePool,
}

impl FileStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, account_name, remote_path, storage_path, size, modified, etag, remote_id, mime_type, last_sync, in_conflict FROM files WHERE account_name = ?1 AND remote_path = ?2",
        )
        .bind(account)
        .bind(remote_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Saves what a finished transfer learned about the file and clears any
    /// conflict mark. Fields the server did not report keep their old value.
    pub async fn merge_remote(
        &self,
        account: &str,
        remote: &RemoteFile,
        storage_path: Option<&str>,
        synced_at: i64,
    ) -> Result<FileRecord, StoreError> {
        let size = remote.size.and_then(|size| i64::try_from(size).ok());
        sqlx::query(
            "\n            INSERT INTO files (\n                account_name,\n                remote_path,\n                storage_path,\n                size,\n                modified,\n                etag,\n                remote_id,\n                mime_type,\n                last_sync,\n                in_conflict\n            )\n            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)\n            ON CONFLICT(account_name, remote_path) DO UPDATE SET\n                storage_path = COALESCE(excluded.storage_path, files.storage_path),\n                size = COALESCE(excluded.size, files.size),\n                modified = COALESCE(excluded.modified, files.modified),\n                etag = COALESCE(excluded.etag, files.etag),\n                remote_id = COALESCE(excluded.remote_id, files.remote_id),\n                mime_type = COALESCE(excluded.mime_type, files.mime_type),\n                last_sync = excluded.last_sync,\n                in_conflict = 0;\n            ",
        )
        .bind(account)
        .bind(&remote.remote_path)
        .bind(storage_path)
        .bind(size)
        .bind(remote.modified)
        .bind(&remote.etag)
        .bind(&remote.remote_id)
        .bind(&remote.mime_type)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;

        self.get(account, &remote.remote_path)
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn set_conflict(
        &self,
        account: &str,
        remote_path: &str,
        in_conflict: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE files SET in_conflict = ?1 WHERE account_name = ?2 AND remote_path = ?3")
            .bind(in_conflict)
            .bind(account)
            .bind(remote_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_account(&self, account: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM files WHERE account_name = ?1")
            .bind(account)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, StoreError> {
    Ok(FileRecord {
        id: row.try_get("id")?,
        account: row.try_get("account_name")?,
        remote_path: row.try_get("remote_path")?,
        storage_path: row.try_get("storage_path")?,
        size: row.try_get("size")?,
        modified: row.try_get("modified")?,
        etag: row.try_get("etag")?,
        remote_id: row.try_get("remote_id")?,
        mime_type: row.try_get("mime_type")?,
        last_sync: row.try_get("last_sync")?,
        in_conflict: row.try_get("in_conflict")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn remote(path: &str, etag: Option<&str>) -> RemoteFile {
        RemoteFile {
            remote_path: path.into(),
            etag: etag.map(str::to_string),
            modified: Some(1_700_000_000),
            size: Some(5),
            remote_id: Some("42".into()),
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn merge_remote_inserts_then_updates() {
        let store = Database::in_memory().await.unwrap().files();

        let first = store
            .merge_remote("alice", &remote("/a.txt", Some("e1")), Some("/data/a.txt"), 10)
            .await
            .unwrap();
        assert_eq!(first.etag.as_deref(), Some("e1"));
        assert_eq!(first.storage_path.as_deref(), Some("/data/a.txt"));

        let second = store
            .merge_remote("alice", &remote("/a.txt", None), None, 20)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.etag.as_deref(), Some("e1"));
        assert_eq!(second.storage_path.as_deref(), Some("/data/a.txt"));
        assert_eq!(second.last_sync, Some(20));
    }

    #[tokio::test]
    async fn merge_remote_clears_conflict() {
        let store = Database::in_memory().await.unwrap().files();
        store
            .merge_remote("alice", &remote("/a.txt", Some("e1")), None, 10)
            .await
            .unwrap();
        store.set_conflict("alice", "/a.txt", true).await.unwrap();
        assert!(store.get("alice", "/a.txt").await.unwrap().unwrap().in_conflict);

        let merged = store
            .merge_remote("alice", &remote("/a.txt", Some("e2")), None, 20)
            .await
            .unwrap();
        assert!(!merged.in_conflict);
        assert_eq!(merged.etag.as_deref(), Some("e2"));
    }
}
