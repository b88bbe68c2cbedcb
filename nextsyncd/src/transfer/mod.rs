mod backoff;
mod downloader;
mod forest;
mod operation;
mod paths;
mod result;
mod service;
mod uploader;

pub use backoff::Backoff;
pub use downloader::Downloader;
pub use forest::{PendingForest, Removed, TransferKey, is_same_or_below, parent_path};
pub use operation::{
    CreatedBy, Direction, DownloadRequest, LocalBehaviour, RequestError, TransferOperation,
    UploadRequest,
};
pub use paths::{PathError, storage_path_for};
pub use result::{ResultCode, TransferResult};
pub use service::{
    Acceptance, DEFAULT_IDLE_GRACE, ServiceContext, TransferHandler, TransferService,
};
pub use uploader::{RetrySummary, UploadSettings, Uploader};
