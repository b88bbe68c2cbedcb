use nextsync_core::NameCollisionPolicy;
use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use super::{StoreError, now_millis};
use crate::transfer::{CreatedBy, LocalBehaviour};

const UPLOAD_COLUMNS: &str = "id, local_path, remote_path, account_name, file_size, status, local_behaviour, name_collision_policy, create_remote_folder, last_result, created_by, wifi_only, charging_only, upload_end_timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    InProgress = 0,
    Failed = 1,
    Succeeded = 2,
    Cancelled = 3,
}

impl UploadStatus {
    pub fn value(self) -> i64 {
        self as i64
    }

    fn parse(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(UploadStatus::InProgress),
            1 => Ok(UploadStatus::Failed),
            2 => Ok(UploadStatus::Succeeded),
            3 => Ok(UploadStatus::Cancelled),
            other => Err(StoreError::InvalidValue {
                column: "status",
                value: other,
            }),
        }
    }
}

/// Last outcome persisted for an upload. Values live on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadResult {
    Unknown = -1,
    Uploaded = 0,
    NetworkConnection = 1,
    CredentialError = 2,
    FolderError = 3,
    ConflictError = 4,
    FileError = 5,
    PrivilegesError = 6,
    Cancelled = 7,
    FileNotFound = 8,
    DelayedForWifi = 9,
    ServiceInterrupted = 10,
    DelayedForCharging = 11,
    MaintenanceMode = 12,
    LockFailed = 13,
    DelayedInPowerSaveMode = 14,
    SslRecoverablePeerUnverified = 15,
    VirusDetected = 16,
    LocalStorageFull = 17,
    OldAndroidApi = 18,
    SyncConflict = 19,
    CannotCreateFile = 20,
    LocalStorageNotCopied = 21,
    QuotaExceeded = 22,
    SameFileConflict = 23,
}

impl UploadResult {
    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            0 => UploadResult::Uploaded,
            1 => UploadResult::NetworkConnection,
            2 => UploadResult::CredentialError,
            3 => UploadResult::FolderError,
            4 => UploadResult::ConflictError,
            5 => UploadResult::FileError,
            6 => UploadResult::PrivilegesError,
            7 => UploadResult::Cancelled,
            8 => UploadResult::FileNotFound,
            9 => UploadResult::DelayedForWifi,
            10 => UploadResult::ServiceInterrupted,
            11 => UploadResult::DelayedForCharging,
            12 => UploadResult::MaintenanceMode,
            13 => UploadResult::LockFailed,
            14 => UploadResult::DelayedInPowerSaveMode,
            15 => UploadResult::SslRecoverablePeerUnverified,
            16 => UploadResult::VirusDetected,
            17 => UploadResult::LocalStorageFull,
            18 => UploadResult::OldAndroidApi,
            19 => UploadResult::SyncConflict,
            20 => UploadResult::CannotCreateFile,
            21 => UploadResult::LocalStorageNotCopied,
            22 => UploadResult::QuotaExceeded,
            23 => UploadResult::SameFileConflict,
            _ => UploadResult::Unknown,
        }
    }

    pub fn is_delayed(self) -> bool {
        matches!(
            self,
            UploadResult::DelayedForWifi
                | UploadResult::DelayedForCharging
                | UploadResult::DelayedInPowerSaveMode
        )
    }
}

#[derive(Debug, Clone)]
pub struct UploadInput {
    pub local_path: String,
    pub remote_path: String,
    pub account: String,
    pub file_size: i64,
    pub behaviour: LocalBehaviour,
    pub policy: NameCollisionPolicy,
    pub create_remote_folder: bool,
    pub created_by: CreatedBy,
    pub wifi_only: bool,
    pub charging_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub id: i64,
    pub local_path: String,
    pub remote_path: String,
    pub account: String,
    pub file_size: i64,
    pub status: UploadStatus,
    pub behaviour: LocalBehaviour,
    pub policy: NameCollisionPolicy,
    pub create_remote_folder: bool,
    pub last_result: UploadResult,
    pub created_by: CreatedBy,
    pub wifi_only: bool,
    pub charging_only: bool,
    /// Milliseconds since the epoch; unset while in progress.
    pub end_timestamp: Option<i64>,
}

#[derive(Clone)]
pub struct UploadStore {
    pool: SqlitePool,
}

impl UploadStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists a new upload as in progress. A pending or failed record for
    /// the same account and remote path is reused instead of duplicated.
    pub async fn store_upload(&self, input: &UploadInput) -> Result<i64, StoreError> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM uploads WHERE account_name = ?1 AND remote_path = ?2 AND status IN (?3, ?4) ORDER BY id DESC LIMIT 1",
        )
        .bind(&input.account)
        .bind(&input.remote_path)
        .bind(UploadStatus::InProgress.value())
        .bind(UploadStatus::Failed.value())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = existing {
            sqlx::query(
                "\n                UPDATE uploads SET\n                    local_path = ?1,\n                    file_size = ?2,\n                    status = ?3,\n                    local_behaviour = ?4,\n                    name_collision_policy = ?5,\n                    create_remote_folder = ?6,\n                    last_result = ?7,\n                    created_by = ?8,\n                    wifi_only = ?9,\n                    charging_only = ?10,\n                    upload_end_timestamp = NULL\n                WHERE id = ?11\n                ",
            )
            .bind(&input.local_path)
            .bind(input.file_size)
            .bind(UploadStatus::InProgress.value())
            .bind(input.behaviour.value())
            .bind(input.policy.ordinal())
            .bind(input.create_remote_folder)
            .bind(UploadResult::Unknown.value())
            .bind(input.created_by.value())
            .bind(input.wifi_only)
            .bind(input.charging_only)
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(id);
        }

        let result = sqlx::query(
            "\n            INSERT INTO uploads (\n                local_path,\n                remote_path,\n                account_name,\n                file_size,\n                status,\n                local_behaviour,\n                name_collision_policy,\n                create_remote_folder,\n                last_result,\n                created_by,\n                wifi_only,\n                charging_only\n            )\n            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)\n            ",
        )
        .bind(&input.local_path)
        .bind(&input.remote_path)
        .bind(&input.account)
        .bind(input.file_size)
        .bind(UploadStatus::InProgress.value())
        .bind(input.behaviour.value())
        .bind(input.policy.ordinal())
        .bind(input.create_remote_folder)
        .bind(UploadResult::Unknown.value())
        .bind(input.created_by.value())
        .bind(input.wifi_only)
        .bind(input.charging_only)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<UploadRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn mark_started(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE uploads SET status = ?1, last_result = ?2, upload_end_timestamp = NULL WHERE id = ?3",
        )
        .bind(UploadStatus::InProgress.value())
        .bind(UploadResult::Unknown.value())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records an outcome. `remote_path` and `local_path` overwrite the stored
    /// paths when the upload was renamed or its source was moved.
    pub async fn update_result(
        &self,
        id: i64,
        status: UploadStatus,
        result: UploadResult,
        remote_path: Option<&str>,
        local_path: Option<&str>,
    ) -> Result<(), StoreError> {
        let end_timestamp = (status != UploadStatus::InProgress).then(now_millis);
        sqlx::query(
            "\n            UPDATE uploads SET\n                status = ?1,\n                last_result = ?2,\n                remote_path = COALESCE(?3, remote_path),\n                local_path = COALESCE(?4, local_path),\n                upload_end_timestamp = ?5\n            WHERE id = ?6\n            ",
        )
        .bind(status.value())
        .bind(result.value())
        .bind(remote_path)
        .bind(local_path)
        .bind(end_timestamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_account(&self, account: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM uploads WHERE account_name = ?1")
            .bind(account)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Crash recovery: nothing can be running when the service starts.
    pub async fn fail_in_progress(&self, result: UploadResult) -> Result<u64, StoreError> {
        let outcome = sqlx::query(
            "UPDATE uploads SET status = ?1, last_result = ?2, upload_end_timestamp = ?3 WHERE status = ?4",
        )
        .bind(UploadStatus::Failed.value())
        .bind(result.value())
        .bind(now_millis())
        .bind(UploadStatus::InProgress.value())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected())
    }

    /// True when an in-progress record exists for the path or anything below it.
    pub async fn has_in_progress(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<bool, StoreError> {
        let folder = format!("{}/", remote_path.trim_end_matches('/'));
        let found: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM uploads WHERE account_name = ?1 AND status = ?2 AND (remote_path = ?3 OR substr(remote_path, 1, length(?4)) = ?4))",
        )
        .bind(account)
        .bind(UploadStatus::InProgress.value())
        .bind(remote_path)
        .bind(folder)
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    /// Failed uploads that may be attempted again.
    pub async fn failed_uploads(&self) -> Result<Vec<UploadRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE status = ?1 AND last_result != ?2 ORDER BY id"
        ))
        .bind(UploadStatus::Failed.value())
        .bind(UploadResult::VirusDetected.value())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<UploadRecord>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {UPLOAD_COLUMNS} FROM uploads ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn count_with_status(&self, status: UploadStatus) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploads WHERE status = ?1")
            .bind(status.value())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Keeps only the `limit` most recently finished successful uploads.
    pub async fn trim_succeeded(&self, limit: usize) -> Result<u64, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "\n            DELETE FROM uploads\n            WHERE status = ?1\n              AND id NOT IN (\n                  SELECT id FROM uploads\n                  WHERE status = ?1\n                  ORDER BY upload_end_timestamp DESC, id DESC\n                  LIMIT ?2\n              )\n            ",
        )
        .bind(UploadStatus::Succeeded.value())
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<UploadRecord, StoreError> {
    let status: i64 = row.try_get("status")?;
    Ok(UploadRecord {
        id: row.try_get("id")?,
        local_path: row.try_get("local_path")?,
        remote_path: row.try_get("remote_path")?,
        account: row.try_get("account_name")?,
        file_size: row.try_get("file_size")?,
        status: UploadStatus::parse(status)?,
        behaviour: LocalBehaviour::from_value(row.try_get("local_behaviour")?),
        policy: NameCollisionPolicy::from_ordinal(row.try_get("name_collision_policy")?),
        create_remote_folder: row.try_get("create_remote_folder")?,
        last_result: UploadResult::from_value(row.try_get("last_result")?),
        created_by: CreatedBy::from_value(row.try_get("created_by")?),
        wifi_only: row.try_get("wifi_only")?,
        charging_only: row.try_get("charging_only")?,
        end_timestamp: row.try_get("upload_end_timestamp")?,
    })
}

#[cfg(test)]
#[path = "uploads_tests.rs"]
mod tests;
