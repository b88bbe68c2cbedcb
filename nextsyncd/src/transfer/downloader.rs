use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::forest::TransferKey;
use super::operation::{Direction, DownloadRequest, RequestError, TransferOperation};
use super::paths::storage_path_for;
use super::result::{ResultCode, TransferResult};
use super::service::{Acceptance, ServiceContext, TransferHandler, TransferService};
use crate::notify::{Subscription, TransferEvent};
use crate::storage::{Database, FileStore, UploadStore, now_millis};

pub(crate) struct DownloadHandler {
    files: FileStore,
    uploads: UploadStore,
}

#[async_trait]
impl TransferHandler for DownloadHandler {
    fn direction(&self) -> Direction {
        Direction::Download
    }

    async fn prepare(&self, _op: &TransferOperation) -> Option<TransferResult> {
        None
    }

    async fn finish(&self, op: &TransferOperation, result: TransferResult) -> TransferResult {
        let Some(remote) = result.remote.as_ref().filter(|_| result.is_success()) else {
            return result;
        };
        let storage_path = op.local_path().to_string_lossy();
        if let Err(err) = self
            .files
            .merge_remote(op.account(), remote, Some(storage_path.as_ref()), now_millis())
            .await
        {
            warn!(
                account = op.account(),
                remote_path = op.remote_path(),
                error = %err,
                "failed to save downloaded file metadata"
            );
        }
        // The server copy won the conflict; the upload that lost it is moot.
        if let Some(upload_id) = op.conflict_upload_id()
            && let Err(err) = self.uploads.remove(upload_id).await
        {
            warn!(upload_id, error = %err, "failed to drop conflicting upload record");
        }
        result
    }

    async fn dequeued(&self, op: &TransferOperation, _reason: Option<ResultCode>) {
        debug!(
            account = op.account(),
            remote_path = op.remote_path(),
            "download cancelled"
        );
    }

    async fn purge_account(&self, _account: &str) {}
}

/// Download queue: one worker, results merged into the file store.
pub struct Downloader {
    service: TransferService<DownloadHandler>,
    storage_root: PathBuf,
}

impl Downloader {
    pub fn start(db: &Database, context: ServiceContext, storage_root: impl Into<PathBuf>) -> Self {
        let handler = DownloadHandler {
            files: db.files(),
            uploads: db.uploads(),
        };
        Self {
            service: TransferService::start(handler, context),
            storage_root: storage_root.into(),
        }
    }

    /// Queues a download. Without an explicit target the file goes where it
    /// was stored before, or to its place in the account's storage area.
    pub async fn request(&self, request: DownloadRequest) -> Result<Acceptance, RequestError> {
        request.validate()?;
        let target = match request.target.clone() {
            Some(target) => target,
            None => self.default_target(&request.account, &request.remote_path).await?,
        };
        let op = Arc::new(TransferOperation::download(
            self.service.next_operation_id(),
            request,
            target,
        ));
        let Some((key, linked_to)) = self.service.insert(&op) else {
            debug!(account = op.account(), remote_path = op.remote_path(), "download already queued");
            return Ok(Acceptance::AlreadyQueued);
        };
        self.service.schedule(&op, linked_to.clone());
        Ok(Acceptance::Queued { key, linked_to })
    }

    async fn default_target(&self, account: &str, remote_path: &str) -> Result<PathBuf, RequestError> {
        let known = self.service.handler().files.get(account, remote_path).await?;
        match known.and_then(|file| file.storage_path) {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(storage_path_for(&self.storage_root, account, remote_path)?),
        }
    }

    pub async fn cancel(&self, account: &str, remote_path: &str) -> usize {
        self.service.cancel(account, remote_path, None).await
    }

    pub async fn cancel_account(&self, account: &str) -> usize {
        self.service.cancel_account(account).await
    }

    pub fn is_transferring(&self, account: &str, remote_path: &str) -> bool {
        self.service.is_pending(account, remote_path)
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
