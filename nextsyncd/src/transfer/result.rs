use nextsync_core::{DavError, ErrorClass, NameCollisionPolicy, RemoteFile};
use serde::Serialize;

use crate::storage::UploadResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Cancelled,
    Unauthorized,
    Forbidden,
    FileNotFound,
    SyncConflict,
    LocalFileNotFound,
    LocalStorageFull,
    LocalStorageNotMoved,
    CannotCreateFile,
    NetworkError,
    ServiceUnavailable,
    ServerError,
    QuotaExceeded,
    Locked,
    IntegrityError,
    DelayedForWifi,
    DelayedForCharging,
    DelayedInPowerSaveMode,
    AccountNotFound,
    ServiceInterrupted,
    UnhandledError,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::Cancelled => "cancelled",
            ResultCode::Unauthorized => "unauthorized",
            ResultCode::Forbidden => "forbidden",
            ResultCode::FileNotFound => "file_not_found",
            ResultCode::SyncConflict => "sync_conflict",
            ResultCode::LocalFileNotFound => "local_file_not_found",
            ResultCode::LocalStorageFull => "local_storage_full",
            ResultCode::LocalStorageNotMoved => "local_storage_not_moved",
            ResultCode::CannotCreateFile => "cannot_create_file",
            ResultCode::NetworkError => "network_error",
            ResultCode::ServiceUnavailable => "service_unavailable",
            ResultCode::ServerError => "server_error",
            ResultCode::QuotaExceeded => "quota_exceeded",
            ResultCode::Locked => "locked",
            ResultCode::IntegrityError => "integrity_error",
            ResultCode::DelayedForWifi => "delayed_for_wifi",
            ResultCode::DelayedForCharging => "delayed_for_charging",
            ResultCode::DelayedInPowerSaveMode => "delayed_in_power_save_mode",
            ResultCode::AccountNotFound => "account_not_found",
            ResultCode::ServiceInterrupted => "service_interrupted",
            ResultCode::UnhandledError => "unhandled_error",
        }
    }

    /// Maps a transport failure. `Skip` turns an existing remote file into a
    /// silent cancellation instead of a conflict.
    pub fn from_dav_error(err: &DavError, policy: NameCollisionPolicy) -> Self {
        match err.classification() {
            ErrorClass::Auth => ResultCode::Unauthorized,
            ErrorClass::Forbidden => ResultCode::Forbidden,
            ErrorClass::NotFound => ResultCode::FileNotFound,
            ErrorClass::Conflict if policy == NameCollisionPolicy::Skip => ResultCode::Cancelled,
            ErrorClass::Conflict => ResultCode::SyncConflict,
            ErrorClass::Locked => ResultCode::Locked,
            ErrorClass::QuotaExceeded => ResultCode::QuotaExceeded,
            ErrorClass::Maintenance => ResultCode::ServiceUnavailable,
            ErrorClass::Server => ResultCode::ServerError,
            ErrorClass::Network => ResultCode::NetworkError,
            ErrorClass::LocalFileMissing => ResultCode::LocalFileNotFound,
            ErrorClass::LocalStorageFull => ResultCode::LocalStorageFull,
            ErrorClass::LocalWrite => ResultCode::CannotCreateFile,
            ErrorClass::Integrity => ResultCode::IntegrityError,
            ErrorClass::Cancelled => ResultCode::Cancelled,
            ErrorClass::Other => ResultCode::UnhandledError,
        }
    }

    pub fn is_delayed(self) -> bool {
        matches!(
            self,
            ResultCode::DelayedForWifi
                | ResultCode::DelayedForCharging
                | ResultCode::DelayedInPowerSaveMode
        )
    }
}

impl From<ResultCode> for UploadResult {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Ok => UploadResult::Uploaded,
            ResultCode::Cancelled => UploadResult::Cancelled,
            ResultCode::Unauthorized => UploadResult::CredentialError,
            ResultCode::Forbidden => UploadResult::PrivilegesError,
            ResultCode::FileNotFound => UploadResult::FolderError,
            ResultCode::SyncConflict => UploadResult::SyncConflict,
            ResultCode::LocalFileNotFound => UploadResult::FileNotFound,
            ResultCode::LocalStorageFull => UploadResult::LocalStorageFull,
            ResultCode::LocalStorageNotMoved => UploadResult::LocalStorageNotCopied,
            ResultCode::CannotCreateFile => UploadResult::CannotCreateFile,
            ResultCode::NetworkError => UploadResult::NetworkConnection,
            ResultCode::ServiceUnavailable => UploadResult::MaintenanceMode,
            ResultCode::QuotaExceeded => UploadResult::QuotaExceeded,
            ResultCode::Locked => UploadResult::LockFailed,
            ResultCode::DelayedForWifi => UploadResult::DelayedForWifi,
            ResultCode::DelayedForCharging => UploadResult::DelayedForCharging,
            ResultCode::DelayedInPowerSaveMode => UploadResult::DelayedInPowerSaveMode,
            ResultCode::ServiceInterrupted => UploadResult::ServiceInterrupted,
            ResultCode::IntegrityError => UploadResult::FileError,
            ResultCode::ServerError | ResultCode::AccountNotFound | ResultCode::UnhandledError => {
                UploadResult::Unknown
            }
        }
    }
}

/// Outcome of one executed operation. Every failure inside the worker ends
/// up here; nothing crosses the queue as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub code: ResultCode,
    pub remote: Option<RemoteFile>,
    pub message: Option<String>,
}

impl TransferResult {
    pub fn success(remote: RemoteFile) -> Self {
        Self {
            code: ResultCode::Ok,
            remote: Some(remote),
            message: None,
        }
    }

    pub fn failure(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            remote: None,
            message: Some(message.into()),
        }
    }

    pub fn with_code(code: ResultCode) -> Self {
        Self {
            code,
            remote: None,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Ok
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ResultCode::Cancelled
    }
}
