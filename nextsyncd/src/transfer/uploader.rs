use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::forest::TransferKey;
use super::operation::{Direction, LocalBehaviour, RequestError, TransferOperation, UploadRequest};
use super::paths::storage_path_for;
use super::result::{ResultCode, TransferResult};
use super::service::{Acceptance, ServiceContext, TransferHandler, TransferService};
use crate::conditions::{DeviceConditions, UploadConstraints};
use crate::notify::{Subscription, TransferEvent};
use crate::storage::{
    Database, FileStore, StoreError, UploadInput, UploadRecord, UploadResult, UploadStatus,
    UploadStore, now_millis,
};

pub const SUCCEEDED_RETENTION: usize = 30;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Root of the per-account storage area used by `Copy` and `Move`.
    pub storage_root: PathBuf,
    /// How many succeeded upload records survive a trim.
    pub retention: usize,
}

impl UploadSettings {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            retention: SUCCEEDED_RETENTION,
        }
    }
}

/// What one sweep over the failed uploads did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub requeued: usize,
    pub missing: usize,
    pub deferred: usize,
    pub skipped: usize,
}

pub(crate) struct UploadHandler {
    uploads: UploadStore,
    files: FileStore,
    conditions: Arc<dyn DeviceConditions>,
    settings: UploadSettings,
}

impl UploadHandler {
    fn constraints(op: &TransferOperation) -> UploadConstraints {
        UploadConstraints {
            wifi_only: op.wifi_only(),
            charging_only: op.charging_only(),
        }
    }

    async fn stage_copy(&self, op: &TransferOperation) -> Result<(), ResultCode> {
        let staged = storage_path_for(&self.settings.storage_root, op.account(), op.remote_path())
            .map_err(|_| ResultCode::LocalStorageNotMoved)?;
        if staged == op.local_path() {
            return Ok(());
        }
        if let Err(err) = copy_file(op.local_path(), &staged).await {
            warn!(
                account = op.account(),
                local_path = %op.local_path().display(),
                error = %err,
                "failed to stage upload copy"
            );
            return Err(local_io_code(&err));
        }
        op.set_staged_source(staged);
        Ok(())
    }

    /// Applies the local behaviour after a successful upload. Returns the
    /// local path the record should point at from now on.
    async fn apply_behaviour(
        &self,
        op: &TransferOperation,
        remote_path: &str,
    ) -> Result<Option<PathBuf>, ResultCode> {
        match op.behaviour() {
            LocalBehaviour::Forget => Ok(None),
            LocalBehaviour::Copy => Ok(op.staged_source().map(Path::to_path_buf)),
            LocalBehaviour::Move => {
                let target = storage_path_for(&self.settings.storage_root, op.account(), remote_path)
                    .map_err(|_| ResultCode::LocalStorageNotMoved)?;
                if target != op.local_path()
                    && let Err(err) = move_file(op.local_path(), &target).await
                {
                    warn!(
                        account = op.account(),
                        local_path = %op.local_path().display(),
                        error = %err,
                        "failed to move uploaded file into storage"
                    );
                    return Err(ResultCode::LocalStorageNotMoved);
                }
                Ok(Some(target))
            }
            LocalBehaviour::Delete => {
                match tokio::fs::remove_file(op.local_path()).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => warn!(
                        account = op.account(),
                        local_path = %op.local_path().display(),
                        error = %err,
                        "failed to delete uploaded file"
                    ),
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TransferHandler for UploadHandler {
    fn direction(&self) -> Direction {
        Direction::Upload
    }

    async fn prepare(&self, op: &TransferOperation) -> Option<TransferResult> {
        if let Some(id) = op.upload_id().filter(|_| !op.is_cancelled())
            && let Err(err) = self.uploads.mark_started(id).await
        {
            warn!(upload_id = id, error = %err, "failed to mark upload started");
        }
        if let Some(code) = Self::constraints(op).violation(self.conditions.as_ref()) {
            debug!(
                account = op.account(),
                remote_path = op.remote_path(),
                code = code.as_str(),
                "upload deferred before start"
            );
            return Some(TransferResult::with_code(code));
        }
        if !tokio::fs::try_exists(op.local_path()).await.unwrap_or(false) {
            return Some(TransferResult::failure(
                ResultCode::LocalFileNotFound,
                op.local_path().display().to_string(),
            ));
        }
        if op.behaviour() == LocalBehaviour::Copy
            && let Err(code) = self.stage_copy(op).await
        {
            return Some(TransferResult::with_code(code));
        }
        None
    }

    fn check_progress(&self, op: &TransferOperation) -> Option<ResultCode> {
        Self::constraints(op).violation(self.conditions.as_ref())
    }

    async fn finish(&self, op: &TransferOperation, result: TransferResult) -> TransferResult {
        let mut result = result;
        let mut local_path = None;
        if let Some(remote) = result.remote.clone() {
            match self.apply_behaviour(op, &remote.remote_path).await {
                Ok(path) => local_path = path,
                Err(code) => {
                    result = TransferResult {
                        code,
                        message: Some("uploaded, but the local file was not moved".to_string()),
                        ..result
                    };
                }
            }
            let storage_path = local_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned());
            if let Err(err) = self
                .files
                .merge_remote(op.account(), &remote, storage_path.as_deref(), now_millis())
                .await
            {
                warn!(account = op.account(), error = %err, "failed to save uploaded file metadata");
            }
        }
        if result.code == ResultCode::SyncConflict
            && let Err(err) = self
                .files
                .set_conflict(op.account(), op.remote_path(), true)
                .await
        {
            warn!(account = op.account(), error = %err, "failed to mark file in conflict");
        }

        let Some(id) = op.upload_id().filter(|_| !op.is_released()) else {
            return result;
        };
        let remote_path = result.remote.as_ref().map(|remote| remote.remote_path.as_str());
        let local_path = local_path.as_ref().map(|path| path.to_string_lossy());
        let recorded = match result.code {
            ResultCode::Ok => self
                .uploads
                .update_result(
                    id,
                    UploadStatus::Succeeded,
                    UploadResult::Uploaded,
                    remote_path,
                    local_path.as_deref(),
                )
                .await,
            ResultCode::Cancelled => self.uploads.remove(id).await.map(|_| ()),
            code => self
                .uploads
                .update_result(id, UploadStatus::Failed, code.into(), remote_path, None)
                .await,
        };
        if let Err(err) = recorded {
            warn!(upload_id = id, error = %err, "failed to record upload result");
        }
        if result.is_success() {
            match self.uploads.trim_succeeded(self.settings.retention).await {
                Ok(0) => {}
                Ok(trimmed) => debug!(trimmed, "trimmed succeeded upload records"),
                Err(err) => warn!(error = %err, "failed to trim upload records"),
            }
        }
        result
    }

    async fn dequeued(&self, op: &TransferOperation, reason: Option<ResultCode>) {
        let Some(id) = op.upload_id() else {
            return;
        };
        let outcome = match reason {
            Some(code) => {
                self.uploads
                    .update_result(id, UploadStatus::Failed, code.into(), None, None)
                    .await
            }
            None => self.uploads.remove(id).await.map(|_| ()),
        };
        if let Err(err) = outcome {
            warn!(upload_id = id, error = %err, "failed to update cancelled upload");
        }
    }

    async fn purge_account(&self, account: &str) {
        match self.uploads.remove_account(account).await {
            Ok(removed) => debug!(account, removed, "removed upload records of account"),
            Err(err) => warn!(account, error = %err, "failed to remove upload records"),
        }
    }
}

/// Upload queue: one worker, durable records, retry sweep.
pub struct Uploader {
    service: TransferService<UploadHandler>,
}

impl Uploader {
    /// Marks uploads left in progress by a previous run as interrupted and
    /// starts the worker.
    pub async fn start(
        db: &Database,
        conditions: Arc<dyn DeviceConditions>,
        context: ServiceContext,
        settings: UploadSettings,
    ) -> Result<Self, StoreError> {
        let uploads = db.uploads();
        let interrupted = uploads
            .fail_in_progress(UploadResult::ServiceInterrupted)
            .await?;
        if interrupted > 0 {
            info!(interrupted, "marked interrupted uploads as failed");
        }
        let handler = UploadHandler {
            uploads,
            files: db.files(),
            conditions,
            settings,
        };
        Ok(Self {
            service: TransferService::start(handler, context),
        })
    }

    pub async fn request(&self, request: UploadRequest) -> Result<Acceptance, RequestError> {
        request.validate()?;
        let file_size = tokio::fs::metadata(&request.local_path)
            .await
            .ok()
            .and_then(|meta| i64::try_from(meta.len()).ok())
            .unwrap_or(-1);
        let input = UploadInput {
            local_path: request.local_path.to_string_lossy().into_owned(),
            remote_path: request.remote_path.clone(),
            account: request.account.clone(),
            file_size,
            behaviour: request.behaviour,
            policy: request.policy,
            create_remote_folder: request.create_remote_folder,
            created_by: request.created_by,
            wifi_only: request.wifi_only,
            charging_only: request.charging_only,
        };

        let op = Arc::new(TransferOperation::upload(
            self.service.next_operation_id(),
            request,
        ));
        let Some((key, linked_to)) = self.service.insert(&op) else {
            debug!(account = op.account(), remote_path = op.remote_path(), "upload already queued");
            return Ok(Acceptance::AlreadyQueued);
        };

        let uploads = &self.service.handler().uploads;
        match uploads.store_upload(&input).await {
            Ok(id) => op.set_upload_id(id),
            Err(err) => {
                self.service.withdraw(&op);
                return Err(err.into());
            }
        }
        if op.is_cancelled() {
            if let Some(id) = op.upload_id()
                && let Err(err) = uploads.remove(id).await
            {
                warn!(upload_id = id, error = %err, "failed to drop cancelled upload");
            }
            return Ok(Acceptance::Queued { key, linked_to });
        }

        self.service.schedule(&op, linked_to.clone());
        Ok(Acceptance::Queued { key, linked_to })
    }

    /// Re-enqueues a stored upload with its original settings.
    pub async fn retry(&self, record: &UploadRecord) -> Result<Acceptance, RequestError> {
        let request = UploadRequest {
            account: record.account.clone(),
            local_path: PathBuf::from(&record.local_path),
            remote_path: record.remote_path.clone(),
            behaviour: record.behaviour,
            policy: record.policy,
            created_by: record.created_by,
            create_remote_folder: record.create_remote_folder,
            wifi_only: record.wifi_only,
            charging_only: record.charging_only,
        };
        self.request(request).await
    }

    /// Re-enqueues failed uploads that can succeed now. Sources that vanished
    /// are marked `FileNotFound`; uploads whose conditions still do not hold
    /// stay failed for the next sweep.
    pub async fn retry_failed_uploads(&self) -> Result<RetrySummary, StoreError> {
        let handler = self.service.handler();
        let failed = handler.uploads.failed_uploads().await?;
        let mut summary = RetrySummary::default();
        if handler.conditions.is_power_saving() {
            summary.deferred = failed.len();
            debug!(deferred = summary.deferred, "power save mode, retry skipped");
            return Ok(summary);
        }

        for record in failed {
            if !is_retryable(record.last_result) || !self.service.accounts().exists(&record.account)
            {
                summary.skipped += 1;
                continue;
            }
            if !tokio::fs::try_exists(&record.local_path).await.unwrap_or(false) {
                handler
                    .uploads
                    .update_result(
                        record.id,
                        UploadStatus::Failed,
                        UploadResult::FileNotFound,
                        None,
                        None,
                    )
                    .await?;
                summary.missing += 1;
                continue;
            }
            let constraints = UploadConstraints {
                wifi_only: record.wifi_only,
                charging_only: record.charging_only,
            };
            if constraints.violation(handler.conditions.as_ref()).is_some() {
                summary.deferred += 1;
                continue;
            }
            match self.retry(&record).await {
                Ok(Acceptance::Queued { .. }) => summary.requeued += 1,
                Ok(Acceptance::AlreadyQueued) => summary.skipped += 1,
                Err(RequestError::Store(err)) => return Err(err),
                Err(err) => {
                    warn!(upload_id = record.id, error = %err, "stored upload cannot be retried");
                    summary.skipped += 1;
                }
            }
        }
        if summary.requeued > 0 || summary.missing > 0 {
            info!(
                requeued = summary.requeued,
                missing = summary.missing,
                deferred = summary.deferred,
                "retried failed uploads"
            );
        }
        Ok(summary)
    }

    pub async fn cancel(&self, account: &str, remote_path: &str) -> usize {
        self.service.cancel(account, remote_path, None).await
    }

    pub async fn cancel_account(&self, account: &str) -> usize {
        self.service.cancel_account(account).await
    }

    /// Queued or running here, or recorded as in progress at or below the path.
    pub async fn is_transferring(&self, account: &str, remote_path: &str) -> bool {
        if self.service.is_pending(account, remote_path) {
            return true;
        }
        match self
            .service
            .handler()
            .uploads
            .has_in_progress(account, remote_path)
            .await
        {
            Ok(found) => found,
            Err(err) => {
                warn!(account, error = %err, "failed to look up in-progress uploads");
                false
            }
        }
    }

    /// Whether `record` describes the upload the worker is running right now.
    pub fn is_uploading_now(&self, record: &UploadRecord) -> bool {
        self.service.current().is_some_and(|op| {
            op.upload_id() == Some(record.id)
                || (op.account() == record.account && op.remote_path() == record.remote_path)
        })
    }

    pub async fn records(&self) -> Result<Vec<UploadRecord>, StoreError> {
        self.service.handler().uploads.list_all().await
    }

    pub fn pending_len(&self) -> usize {
        self.service.pending_len()
    }

    pub fn events(&self) -> broadcast::Receiver<TransferEvent> {
        self.service.events()
    }

    pub fn subscribe_progress(&self, key: TransferKey) -> Subscription {
        self.service.subscribe_progress(key)
    }

    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }
}

fn is_retryable(result: UploadResult) -> bool {
    result.is_delayed()
        || matches!(
            result,
            UploadResult::NetworkConnection
                | UploadResult::ServiceInterrupted
                | UploadResult::MaintenanceMode
        )
}

fn local_io_code(err: &io::Error) -> ResultCode {
    match err.kind() {
        io::ErrorKind::StorageFull => ResultCode::LocalStorageFull,
        io::ErrorKind::NotFound => ResultCode::LocalFileNotFound,
        _ => ResultCode::LocalStorageNotMoved,
    }
}

async fn copy_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, target).await?;
    Ok(())
}

async fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        // Different filesystems: fall back to copy and delete.
        Err(_) => {
            tokio::fs::copy(source, target).await?;
            tokio::fs::remove_file(source).await
        }
    }
}
