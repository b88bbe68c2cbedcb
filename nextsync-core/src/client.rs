use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use futures_util::StreamExt;
use md5::Context;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use reqwest::{Body, Client, Method, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::collision::{NameCollisionPolicy, renamed_candidate};
use crate::progress::{ProgressListener, ProgressUpdate};

const MAX_RENAME_ATTEMPTS: u32 = 9999;
const OC_FILE_ID: &str = "oc-fileid";
const OC_CHECKSUM: &str = "oc-checksum";
const OC_MTIME: &str = "x-oc-mtime";

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status} for {path}")]
    Status { status: StatusCode, path: String },
    #[error("remote file already exists: {0}")]
    Exists(String),
    #[error("no free remote name left for {0}")]
    NoFreeName(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    Forbidden,
    NotFound,
    Conflict,
    Locked,
    QuotaExceeded,
    Maintenance,
    Server,
    Network,
    LocalFileMissing,
    LocalStorageFull,
    LocalWrite,
    Integrity,
    Cancelled,
    Other,
}

/// Metadata the server reported for a transferred file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Final remote path; differs from the requested one after a rename.
    pub remote_path: String,
    pub etag: Option<String>,
    /// Unix seconds.
    pub modified: Option<i64>,
    pub size: Option<u64>,
    pub remote_id: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadSpec<'a> {
    pub local_path: &'a Path,
    pub remote_path: &'a str,
    pub policy: NameCollisionPolicy,
    pub create_parents: bool,
}

/// Executes single-file transfers against a remote server.
///
/// Implementations poll `cancel` at least once per transferred chunk and
/// return [`DavError::Cancelled`] once it fires.
#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    async fn upload(
        &self,
        spec: UploadSpec<'_>,
        progress: &dyn ProgressListener,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, DavError>;

    async fn download(
        &self,
        remote_path: &str,
        target: &Path,
        progress: &dyn ProgressListener,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, DavError>;
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    user: String,
    password: String,
}

impl DavClient {
    pub fn new(
        server_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        Self::with_http(Client::new(), server_url, user, password)
    }

    pub fn with_http(
        http: Client,
        server_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        Ok(Self {
            http,
            base_url: Url::parse(server_url)?,
            user: user.into(),
            password: password.into(),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub async fn exists(&self, remote_path: &str) -> Result<bool, DavError> {
        let url = self.file_url(remote_path)?;
        let response = self
            .http
            .head(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(DavError::Status {
                status,
                path: remote_path.to_string(),
            }),
        }
    }

    /// Creates one remote collection. An already existing one is not an error.
    pub async fn create_folder(&self, remote_path: &str) -> Result<(), DavError> {
        let folder = if remote_path.ends_with('/') {
            remote_path.to_string()
        } else {
            format!("{remote_path}/")
        };
        let url = self.file_url(&folder)?;
        let mkcol =
            Method::from_bytes(b"MKCOL").map_err(|err| DavError::Protocol(err.to_string()))?;
        let response = self
            .http
            .request(mkcol, url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(DavError::Status {
                status,
                path: folder,
            }),
        }
    }

    pub async fn upload_file(
        &self,
        spec: UploadSpec<'_>,
        progress: &dyn ProgressListener,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, DavError> {
        if cancel.is_cancelled() {
            return Err(DavError::Cancelled);
        }
        let metadata = tokio::fs::metadata(spec.local_path).await?;
        if spec.create_parents {
            for folder in ancestor_folders(spec.remote_path) {
                self.create_folder(&folder).await?;
            }
        }
        let remote_path = self
            .resolve_collision(spec.remote_path, spec.policy)
            .await?;
        if cancel.is_cancelled() {
            return Err(DavError::Cancelled);
        }

        let total = metadata.len();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs() as i64);
        let name = file_name(&remote_path).to_string();

        let file = tokio::fs::File::open(spec.local_path).await?;
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<u64>();
        let token = cancel.clone();
        let stream = ReaderStream::new(file).map(move |chunk| {
            if token.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "upload cancelled"));
            }
            if let Ok(bytes) = &chunk {
                let _ = chunk_tx.send(bytes.len() as u64);
            }
            chunk
        });

        let mut request = self
            .http
            .put(self.file_url(&remote_path)?)
            .basic_auth(&self.user, Some(&self.password))
            .header(CONTENT_LENGTH, total);
        if let Some(mtime) = mtime {
            request = request.header(OC_MTIME, mtime);
        }
        let send = request.body(Body::wrap_stream(stream)).send();
        tokio::pin!(send);

        let mut transferred = 0u64;
        let report = |rate: u64, transferred: u64| {
            progress.on_progress(&ProgressUpdate {
                rate,
                transferred,
                total: Some(total),
                name: name.clone(),
            });
        };
        let outcome = loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                _ = cancel.cancelled() => return Err(DavError::Cancelled),
                Some(rate) = chunk_rx.recv() => {
                    transferred += rate;
                    report(rate, transferred);
                }
            }
        };
        while let Ok(rate) = chunk_rx.try_recv() {
            transferred += rate;
            report(rate, transferred);
        }

        if cancel.is_cancelled() {
            return Err(DavError::Cancelled);
        }
        let response = outcome?;
        let status = response.status();
        if !status.is_success() {
            return Err(DavError::Status {
                status,
                path: remote_path,
            });
        }

        let headers = response.headers();
        Ok(RemoteFile {
            etag: header_string(headers, ETAG.as_str()).map(|value| normalize_etag(&value)),
            remote_id: header_string(headers, OC_FILE_ID),
            modified: mtime,
            size: Some(total),
            mime_type: None,
            remote_path,
        })
    }

    /// Streams a remote file into `target` through a sibling `.partial` file.
    pub async fn download_file(
        &self,
        remote_path: &str,
        target: &Path,
        progress: &dyn ProgressListener,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, DavError> {
        if cancel.is_cancelled() {
            return Err(DavError::Cancelled);
        }
        let url = self.file_url(remote_path)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DavError::Status {
                status,
                path: remote_path.to_string(),
            });
        }

        let headers = response.headers();
        let total = response.content_length();
        let etag = header_string(headers, ETAG.as_str()).map(|value| normalize_etag(&value));
        let modified = header_string(headers, LAST_MODIFIED.as_str())
            .and_then(|value| httpdate::parse_http_date(&value).ok())
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs() as i64);
        let remote_id = header_string(headers, OC_FILE_ID);
        let mime_type = header_string(headers, CONTENT_TYPE.as_str());
        let expected_md5 =
            header_string(headers, OC_CHECKSUM).and_then(|value| md5_from_checksum(&value));

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let name = file_name(remote_path).to_string();
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut stream = response.bytes_stream();
            let mut md5 = Context::new();
            let mut transferred = 0u64;
            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    return Err(DavError::Cancelled);
                }
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                md5.consume(&chunk);
                transferred += chunk.len() as u64;
                progress.on_progress(&ProgressUpdate {
                    rate: chunk.len() as u64,
                    transferred,
                    total,
                    name: name.clone(),
                });
            }
            if cancel.is_cancelled() {
                return Err(DavError::Cancelled);
            }
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            if let Some(expected_md5) = expected_md5 {
                let actual_md5 = format!("{:x}", md5.compute());
                if actual_md5 != expected_md5 {
                    return Err(DavError::IntegrityMismatch {
                        expected_md5,
                        actual_md5,
                    });
                }
            }
            tokio::fs::rename(&partial, target).await?;
            Ok::<_, DavError>(transferred)
        }
        .await;
        let transferred = match written {
            Ok(transferred) => transferred,
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await
                    && remove_err.kind() != io::ErrorKind::NotFound
                {
                    warn!(path = %partial.display(), error = %remove_err, "failed to remove partial download");
                }
                return Err(err);
            }
        };

        Ok(RemoteFile {
            remote_path: remote_path.to_string(),
            etag,
            modified,
            size: Some(transferred),
            remote_id,
            mime_type,
        })
    }

    async fn resolve_collision(
        &self,
        remote_path: &str,
        policy: NameCollisionPolicy,
    ) -> Result<String, DavError> {
        match policy {
            NameCollisionPolicy::Overwrite => Ok(remote_path.to_string()),
            NameCollisionPolicy::Skip | NameCollisionPolicy::AskUser => {
                if self.exists(remote_path).await? {
                    Err(DavError::Exists(remote_path.to_string()))
                } else {
                    Ok(remote_path.to_string())
                }
            }
            NameCollisionPolicy::Rename => {
                if !self.exists(remote_path).await? {
                    return Ok(remote_path.to_string());
                }
                for count in 2..=MAX_RENAME_ATTEMPTS {
                    let candidate = renamed_candidate(remote_path, count);
                    if !self.exists(&candidate).await? {
                        debug!(from = remote_path, to = %candidate, "remote name taken, renaming upload");
                        return Ok(candidate);
                    }
                }
                Err(DavError::NoFreeName(remote_path.to_string()))
            }
        }
    }

    fn file_url(&self, remote_path: &str) -> Result<Url, DavError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            segments.pop_if_empty();
            segments.extend(["remote.php", "dav", "files", self.user.as_str()]);
            segments.extend(remote_path.split('/').filter(|part| !part.is_empty()));
            if remote_path.ends_with('/') {
                segments.push("");
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RemoteTransfer for DavClient {
    async fn upload(
        &self,
        spec: UploadSpec<'_>,
        progress: &dyn ProgressListener,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, DavError> {
        self.upload_file(spec, progress, cancel).await
    }

    async fn download(
        &self,
        remote_path: &str,
        target: &Path,
        progress: &dyn ProgressListener,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, DavError> {
        self.download_file(remote_path, target, progress, cancel).await
    }
}

impl DavError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            DavError::Status { status, .. } => classify_status(*status),
            DavError::Request(err) => {
                if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
                    ErrorClass::Network
                } else if err.is_decode() {
                    ErrorClass::Server
                } else {
                    ErrorClass::Other
                }
            }
            DavError::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => ErrorClass::LocalFileMissing,
                io::ErrorKind::StorageFull => ErrorClass::LocalStorageFull,
                io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                    ErrorClass::LocalWrite
                }
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::TimedOut
                | io::ErrorKind::BrokenPipe => ErrorClass::Network,
                _ => ErrorClass::Other,
            },
            DavError::Exists(_) | DavError::NoFreeName(_) => ErrorClass::Conflict,
            DavError::IntegrityMismatch { .. } => ErrorClass::Integrity,
            DavError::Cancelled => ErrorClass::Cancelled,
            DavError::Url(_) | DavError::Protocol(_) => ErrorClass::Other,
        }
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    match status {
        StatusCode::UNAUTHORIZED => ErrorClass::Auth,
        StatusCode::FORBIDDEN => ErrorClass::Forbidden,
        // A PUT into a missing collection answers 409.
        StatusCode::NOT_FOUND | StatusCode::CONFLICT => ErrorClass::NotFound,
        StatusCode::PRECONDITION_FAILED => ErrorClass::Conflict,
        StatusCode::LOCKED => ErrorClass::Locked,
        StatusCode::INSUFFICIENT_STORAGE => ErrorClass::QuotaExceeded,
        StatusCode::SERVICE_UNAVAILABLE => ErrorClass::Maintenance,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorClass::Network,
        status if status.is_server_error() => ErrorClass::Server,
        _ => ErrorClass::Other,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn normalize_etag(value: &str) -> String {
    value
        .trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

/// Picks the MD5 digest out of an `OC-Checksum` header such as
/// `SHA1:abc MD5:def ADLER32:123`.
fn md5_from_checksum(value: &str) -> Option<String> {
    value.split_whitespace().find_map(|part| {
        let (algorithm, digest) = part.split_once(':')?;
        algorithm
            .eq_ignore_ascii_case("md5")
            .then(|| digest.to_ascii_lowercase())
    })
}

/// `/a/b/c.txt` yields `/a/` and `/a/b/`.
fn ancestor_folders(remote_path: &str) -> Vec<String> {
    let trimmed = remote_path.trim_end_matches('/');
    let mut folders = Vec::new();
    for (idx, ch) in trimmed.char_indices() {
        if ch == '/' && idx > 0 {
            folders.push(trimmed[..=idx].to_string());
        }
    }
    folders
}

fn file_name(remote_path: &str) -> &str {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote_path)
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorClass::Auth);
        assert_eq!(classify_status(StatusCode::LOCKED), ErrorClass::Locked);
        assert_eq!(
            classify_status(StatusCode::INSUFFICIENT_STORAGE),
            ErrorClass::QuotaExceeded
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorClass::Maintenance
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            ErrorClass::Server
        );
        assert_eq!(classify_status(StatusCode::CONFLICT), ErrorClass::NotFound);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ErrorClass::Other);
    }

    #[test]
    fn io_errors_map_to_local_classes() {
        let missing = DavError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(missing.classification(), ErrorClass::LocalFileMissing);
        let full = DavError::Io(io::Error::from(io::ErrorKind::StorageFull));
        assert_eq!(full.classification(), ErrorClass::LocalStorageFull);
    }

    #[test]
    fn extracts_md5_from_checksum_header() {
        assert_eq!(
            md5_from_checksum("SHA1:aa MD5:5D41402ABC4B2A76B9719D911017C592"),
            Some("5d41402abc4b2a76b9719d911017c592".to_string())
        );
        assert_eq!(md5_from_checksum("SHA1:aa"), None);
    }

    #[test]
    fn lists_ancestor_folders() {
        assert_eq!(ancestor_folders("/a/b/c.txt"), vec!["/a/", "/a/b/"]);
        assert!(ancestor_folders("/c.txt").is_empty());
    }

    #[test]
    fn builds_dav_urls_under_user_root() {
        let client = DavClient::new("https://cloud.example.com/nc/", "alice", "pw").unwrap();
        let url = client.file_url("/Docs/Hello World.txt").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cloud.example.com/nc/remote.php/dav/files/alice/Docs/Hello%20World.txt"
        );
        let folder = client.file_url("/Docs/").unwrap();
        assert_eq!(
            folder.as_str(),
            "https://cloud.example.com/nc/remote.php/dav/files/alice/Docs/"
        );
    }

    #[test]
    fn partial_path_keeps_extension() {
        assert_eq!(
            partial_path(Path::new("/tmp/a.txt")),
            PathBuf::from("/tmp/a.txt.partial")
        );
        assert_eq!(
            partial_path(Path::new("/tmp/README")),
            PathBuf::from("/tmp/README.partial")
        );
    }
}
