use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nextsync_core::{DavClient, DavError, RemoteTransfer};
use thiserror::Error;
use url::Url;

use crate::storage::{CredentialStorage, SecretError};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found: {0}")]
    NotFound(String),
    #[error("credentials unavailable for {account}: {source}")]
    Credentials {
        account: String,
        #[source]
        source: SecretError,
    },
    #[error("invalid server url: {0}")]
    InvalidServer(#[from] url::ParseError),
    #[error("client setup failed: {0}")]
    Client(#[from] DavError),
}

/// Source of accounts and of the clients that act on their behalf.
#[async_trait]
pub trait AccountStore: Send + Sync {
    fn exists(&self, account: &str) -> bool;

    /// Builds a client with the account's current credentials. Never cached,
    /// so a password change applies to the next transfer.
    async fn client_for(&self, account: &str) -> Result<Arc<dyn RemoteTransfer>, AccountError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub server_url: String,
    pub user: String,
}

impl Account {
    /// Account names take the `user@host` form.
    pub fn new(server_url: &str, user: &str) -> Result<Self, AccountError> {
        let url = Url::parse(server_url)?;
        let host = url.host_str().unwrap_or("localhost");
        let name = match url.port() {
            Some(port) => format!("{user}@{host}:{port}"),
            None => format!("{user}@{host}"),
        };
        Ok(Self {
            name,
            server_url: server_url.to_string(),
            user: user.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
enum Secret {
    Inline(String),
    Keyring,
}

struct Entry {
    account: Account,
    secret: Secret,
}

/// In-process account list; passwords are held inline or looked up in the
/// keyring on every client build.
pub struct AccountRegistry {
    accounts: RwLock<HashMap<String, Entry>>,
    secrets: CredentialStorage,
}

impl AccountRegistry {
    pub fn new(secrets: CredentialStorage) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            secrets,
        }
    }

    pub fn add_with_password(&self, account: Account, password: impl Into<String>) {
        self.insert(account, Secret::Inline(password.into()));
    }

    pub fn add_with_keyring(&self, account: Account) {
        self.insert(account, Secret::Keyring);
    }

    pub fn remove(&self, name: &str) -> bool {
        match self.accounts.write() {
            Ok(mut accounts) => accounts.remove(name).is_some(),
            Err(_) => false,
        }
    }

    fn insert(&self, account: Account, secret: Secret) {
        if let Ok(mut accounts) = self.accounts.write() {
            accounts.insert(account.name.clone(), Entry { account, secret });
        }
    }

    fn lookup(&self, name: &str) -> Option<(Account, Secret)> {
        let accounts = self.accounts.read().ok()?;
        accounts
            .get(name)
            .map(|entry| (entry.account.clone(), entry.secret.clone()))
    }
}

#[async_trait]
impl AccountStore for AccountRegistry {
    fn exists(&self, account: &str) -> bool {
        self.accounts
            .read()
            .map(|accounts| accounts.contains_key(account))
            .unwrap_or(false)
    }

    async fn client_for(&self, name: &str) -> Result<Arc<dyn RemoteTransfer>, AccountError> {
        let (account, secret) = self
            .lookup(name)
            .ok_or_else(|| AccountError::NotFound(name.to_string()))?;
        let password = match secret {
            Secret::Inline(password) => password,
            Secret::Keyring => self.secrets.load_password(&account.name).map_err(|source| {
                AccountError::Credentials {
                    account: account.name.clone(),
                    source,
                }
            })?,
        };
        let client = DavClient::new(&account.server_url, &account.user, password)?;
        Ok(Arc::new(client))
    }
}
