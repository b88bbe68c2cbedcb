use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("account name cannot be used as a folder: {0:?}")]
    InvalidAccount(String),
}

/// Local place of a remote file: `<root>/<account>/<remote path>`.
pub fn storage_path_for(
    storage_root: &Path,
    account: &str,
    remote_path: &str,
) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }
    if account.is_empty() || account.contains(['/', '\\']) || account == "." || account == ".." {
        return Err(PathError::InvalidAccount(account.to_string()));
    }

    let mut out = storage_root.join(account);
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}
