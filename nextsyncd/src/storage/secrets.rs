use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "org.nextsync.client";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("no password stored for {0}")]
    NotFound(String),
}

/// Account passwords in the system keyring, one entry per account name.
#[derive(Debug, Clone)]
pub struct CredentialStorage {
    service: String,
}

impl Default for CredentialStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStorage {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn load_password(&self, account: &str) -> Result<String, SecretError> {
        let entry = Entry::new(&self.service, account)?;
        entry
            .get_password()
            .map_err(|err| not_found_or(err, account))
    }

    pub fn save_password(&self, account: &str, password: &str) -> Result<(), SecretError> {
        Entry::new(&self.service, account)?.set_password(password)?;
        Ok(())
    }

    pub fn delete_password(&self, account: &str) -> Result<(), SecretError> {
        match Entry::new(&self.service, account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(SecretError::KeyringError(err)),
        }
    }
}

fn not_found_or(err: keyring::Error, account: &str) -> SecretError {
    match err {
        keyring::Error::NoEntry => SecretError::NotFound(account.to_string()),
        other => SecretError::KeyringError(other),
    }
}
