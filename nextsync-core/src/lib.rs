mod client;
mod collision;
mod progress;

pub use client::{DavClient, DavError, ErrorClass, RemoteFile, RemoteTransfer, UploadSpec};
pub use collision::{NameCollisionPolicy, renamed_candidate};
pub use progress::{NoProgress, ProgressListener, ProgressUpdate};
pub use tokio_util::sync::CancellationToken;
