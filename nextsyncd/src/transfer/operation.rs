use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use nextsync_core::{
    CancellationToken, DavError, NameCollisionPolicy, ProgressListener, RemoteTransfer, UploadSpec,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::forest::TransferKey;
use super::paths::PathError;
use super::result::{ResultCode, TransferResult};
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// What happens to the local source once an upload succeeds.
/// Stored as an integer; discriminants are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalBehaviour {
    Copy = 0,
    Move = 1,
    #[default]
    Forget = 2,
    Delete = 3,
}

impl LocalBehaviour {
    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            0 => LocalBehaviour::Copy,
            1 => LocalBehaviour::Move,
            3 => LocalBehaviour::Delete,
            _ => LocalBehaviour::Forget,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "copy" => Some(LocalBehaviour::Copy),
            "move" => Some(LocalBehaviour::Move),
            "forget" => Some(LocalBehaviour::Forget),
            "delete" => Some(LocalBehaviour::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    #[default]
    User = 0,
    InstantPicture = 1,
    InstantVideo = 2,
}

impl CreatedBy {
    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            1 => CreatedBy::InstantPicture,
            2 => CreatedBy::InstantVideo,
            _ => CreatedBy::User,
        }
    }

    /// Uploads started by the camera watcher rather than by a person.
    pub fn is_automatic(self) -> bool {
        !matches!(self, CreatedBy::User)
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transfer request has no account")]
    MissingAccount,
    #[error("remote path must be an absolute file path: {0:?}")]
    InvalidRemotePath(String),
    #[error("local path must be absolute: {0}")]
    InvalidLocalPath(PathBuf),
    #[error("remote path cannot be stored locally: {0}")]
    Path(#[from] PathError),
    #[error("transfer record error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub account: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub behaviour: LocalBehaviour,
    pub policy: NameCollisionPolicy,
    pub created_by: CreatedBy,
    pub create_remote_folder: bool,
    pub wifi_only: bool,
    pub charging_only: bool,
}

impl UploadRequest {
    pub fn new(
        account: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            behaviour: LocalBehaviour::default(),
            policy: NameCollisionPolicy::default(),
            created_by: CreatedBy::default(),
            create_remote_folder: false,
            wifi_only: false,
            charging_only: false,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        validate_account(&self.account)?;
        validate_remote_file(&self.remote_path)?;
        if !self.local_path.is_absolute() {
            return Err(RequestError::InvalidLocalPath(self.local_path.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub account: String,
    pub remote_path: String,
    /// Explicit destination; defaults to the file's known storage path or
    /// its place under the storage root.
    pub target: Option<PathBuf>,
    /// Upload record to drop once the download resolves its conflict.
    pub conflict_upload_id: Option<i64>,
}

impl DownloadRequest {
    pub fn new(account: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            remote_path: remote_path.into(),
            target: None,
            conflict_upload_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        validate_account(&self.account)?;
        validate_remote_file(&self.remote_path)?;
        match &self.target {
            Some(target) if !target.is_absolute() => {
                Err(RequestError::InvalidLocalPath(target.clone()))
            }
            _ => Ok(()),
        }
    }
}

fn validate_account(account: &str) -> Result<(), RequestError> {
    if account.trim().is_empty() {
        return Err(RequestError::MissingAccount);
    }
    Ok(())
}

fn validate_remote_file(remote_path: &str) -> Result<(), RequestError> {
    if !remote_path.starts_with('/') || remote_path.ends_with('/') {
        return Err(RequestError::InvalidRemotePath(remote_path.to_string()));
    }
    Ok(())
}

/// One file's transfer intent. Built on intake, shared between the queue
/// and the worker, executed at most once.
#[derive(Debug)]
pub struct TransferOperation {
    id: u64,
    key: TransferKey,
    direction: Direction,
    local_path: PathBuf,
    behaviour: LocalBehaviour,
    policy: NameCollisionPolicy,
    created_by: CreatedBy,
    create_remote_folder: bool,
    wifi_only: bool,
    charging_only: bool,
    conflict_upload_id: Option<i64>,
    upload_id: OnceLock<i64>,
    staged_source: OnceLock<PathBuf>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<ResultCode>>,
    released: AtomicBool,
}

impl TransferOperation {
    pub fn upload(id: u64, request: UploadRequest) -> Self {
        Self {
            id,
            key: TransferKey::new(request.account, request.remote_path),
            direction: Direction::Upload,
            local_path: request.local_path,
            behaviour: request.behaviour,
            policy: request.policy,
            created_by: request.created_by,
            create_remote_folder: request.create_remote_folder,
            wifi_only: request.wifi_only,
            charging_only: request.charging_only,
            conflict_upload_id: None,
            upload_id: OnceLock::new(),
            staged_source: OnceLock::new(),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn download(id: u64, request: DownloadRequest, target: PathBuf) -> Self {
        Self {
            id,
            key: TransferKey::new(request.account, request.remote_path),
            direction: Direction::Download,
            local_path: target,
            behaviour: LocalBehaviour::Forget,
            policy: NameCollisionPolicy::Overwrite,
            created_by: CreatedBy::User,
            create_remote_folder: false,
            wifi_only: false,
            charging_only: false,
            conflict_upload_id: request.conflict_upload_id,
            upload_id: OnceLock::new(),
            staged_source: OnceLock::new(),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn account(&self) -> &str {
        &self.key.account
    }

    pub fn remote_path(&self) -> &str {
        &self.key.remote_path
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Upload source or download target as requested.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// The file actually read by an upload: the staged copy when one was made.
    pub fn source_path(&self) -> &Path {
        self.staged_source
            .get()
            .map(PathBuf::as_path)
            .unwrap_or(&self.local_path)
    }

    pub fn behaviour(&self) -> LocalBehaviour {
        self.behaviour
    }

    pub fn policy(&self) -> NameCollisionPolicy {
        self.policy
    }

    pub fn created_by(&self) -> CreatedBy {
        self.created_by
    }

    pub fn create_remote_folder(&self) -> bool {
        self.create_remote_folder
    }

    pub fn wifi_only(&self) -> bool {
        self.wifi_only
    }

    pub fn charging_only(&self) -> bool {
        self.charging_only
    }

    pub fn conflict_upload_id(&self) -> Option<i64> {
        self.conflict_upload_id
    }

    pub fn upload_id(&self) -> Option<i64> {
        self.upload_id.get().copied()
    }

    pub(crate) fn set_upload_id(&self, id: i64) {
        let _ = self.upload_id.set(id);
    }

    pub(crate) fn set_staged_source(&self, path: PathBuf) {
        let _ = self.staged_source.set(path);
    }

    pub fn staged_source(&self) -> Option<&Path> {
        self.staged_source.get().map(PathBuf::as_path)
    }

    /// Requests cooperative cancellation. The first reason given wins.
    pub fn cancel(&self, reason: ResultCode) {
        if let Ok(mut slot) = self.cancel_reason.lock() {
            slot.get_or_insert(reason);
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<ResultCode> {
        self.cancel_reason.lock().ok().and_then(|slot| *slot)
    }

    /// Marks that the queue gave up this operation's key while it ran. Its
    /// record was settled at that point and must not be touched again.
    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs the transfer through `client`. Failures come back as results.
    pub async fn execute(
        &self,
        client: &dyn RemoteTransfer,
        progress: &dyn ProgressListener,
    ) -> TransferResult {
        if self.is_cancelled() {
            return self.cancelled_result();
        }
        let outcome = match self.direction {
            Direction::Upload => {
                let spec = UploadSpec {
                    local_path: self.source_path(),
                    remote_path: self.remote_path(),
                    policy: self.policy,
                    create_parents: self.create_remote_folder,
                };
                client.upload(spec, progress, &self.cancel).await
            }
            Direction::Download => {
                client
                    .download(self.remote_path(), &self.local_path, progress, &self.cancel)
                    .await
            }
        };
        match outcome {
            Ok(remote) => TransferResult::success(remote),
            Err(DavError::Cancelled) => self.cancelled_result(),
            Err(_) if self.is_cancelled() => self.cancelled_result(),
            Err(err) => {
                TransferResult::failure(ResultCode::from_dav_error(&err, self.policy), err.to_string())
            }
        }
    }

    fn cancelled_result(&self) -> TransferResult {
        TransferResult::with_code(self.cancel_reason().unwrap_or(ResultCode::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_ordinals_are_stable() {
        assert_eq!(LocalBehaviour::Copy.value(), 0);
        assert_eq!(LocalBehaviour::Move.value(), 1);
        assert_eq!(LocalBehaviour::Forget.value(), 2);
        assert_eq!(LocalBehaviour::Delete.value(), 3);
        assert_eq!(LocalBehaviour::from_value(42), LocalBehaviour::Forget);
        assert_eq!(CreatedBy::from_value(2), CreatedBy::InstantVideo);
        assert_eq!(CreatedBy::from_value(-1), CreatedBy::User);
        assert!(CreatedBy::InstantPicture.is_automatic());
    }

    #[test]
    fn requests_without_account_are_rejected() {
        let request = UploadRequest::new("  ", "/tmp/a.txt", "/a.txt");
        assert!(matches!(
            request.validate(),
            Err(RequestError::MissingAccount)
        ));
    }

    #[test]
    fn requests_need_absolute_paths() {
        let relative_remote = UploadRequest::new("alice", "/tmp/a.txt", "a.txt");
        assert!(matches!(
            relative_remote.validate(),
            Err(RequestError::InvalidRemotePath(_))
        ));
        let folder = DownloadRequest::new("alice", "/Docs/");
        assert!(matches!(
            folder.validate(),
            Err(RequestError::InvalidRemotePath(_))
        ));
        let relative_local = UploadRequest::new("alice", "a.txt", "/a.txt");
        assert!(matches!(
            relative_local.validate(),
            Err(RequestError::InvalidLocalPath(_))
        ));
        assert!(UploadRequest::new("alice", "/tmp/a.txt", "/a.txt")
            .validate()
            .is_ok());
    }

    #[test]
    fn first_cancel_reason_wins() {
        let op = TransferOperation::upload(1, UploadRequest::new("alice", "/tmp/a", "/a"));
        assert!(!op.is_cancelled());
        op.cancel(ResultCode::DelayedForWifi);
        op.cancel(ResultCode::Cancelled);
        assert!(op.is_cancelled());
        assert_eq!(op.cancel_reason(), Some(ResultCode::DelayedForWifi));
        assert_eq!(
            op.cancelled_result().code,
            ResultCode::DelayedForWifi
        );
    }
}
