use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nextsync_core::NameCollisionPolicy;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountRegistry};
use crate::conditions::ConditionFlags;
use crate::config::DaemonConfig;
use crate::notify::{LogNotifications, ProgressRegistry, TransferEvent};
use crate::storage::{CredentialStorage, Database};
use crate::transfer::{
    Acceptance, Backoff, DownloadRequest, Downloader, LocalBehaviour, ResultCode,
    ServiceContext, TransferKey, UploadRequest, UploadSettings, Uploader,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCommand {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub policy: NameCollisionPolicy,
    pub behaviour: LocalBehaviour,
}

/// How a transfer started from the command line ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub code: ResultCode,
    pub final_path: Option<String>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    account: Option<Account>,
    accounts: Arc<AccountRegistry>,
    uploader: Uploader,
    downloader: Downloader,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_root)
            .await
            .with_context(|| format!("failed to create storage root at {:?}", config.storage_root))?;
        let db = Database::open(&config.database_path())
            .await
            .context("failed to open transfer database")?;

        let secrets = CredentialStorage::new();
        let accounts = Arc::new(AccountRegistry::new(secrets.clone()));
        let account = register_account(&config, &accounts, &secrets)?;
        let flags = Arc::new(ConditionFlags::new(
            config.unmetered,
            config.charging,
            config.power_saving,
        ));
        let context = ServiceContext {
            accounts: accounts.clone(),
            sink: Arc::new(LogNotifications),
            progress: ProgressRegistry::new(),
            idle_grace: config.idle_grace,
        };
        let uploader = Uploader::start(
            &db,
            flags,
            context.clone(),
            UploadSettings {
                storage_root: config.storage_root.clone(),
                retention: config.success_retention,
            },
        )
        .await
        .context("failed to start uploader")?;
        let downloader = Downloader::start(&db, context, config.storage_root.clone());

        Ok(Self {
            config,
            account,
            accounts,
            uploader,
            downloader,
        })
    }

    fn account_name(&self) -> anyhow::Result<&str> {
        self.account
            .as_ref()
            .map(|account| account.name.as_str())
            .context("no account configured; set NEXTSYNC_SERVER_URL and NEXTSYNC_USER")
    }

    pub async fn upload(&self, command: UploadCommand) -> anyhow::Result<Outcome> {
        let account = self.account_name()?;
        let local_path = std::path::absolute(&command.local_path)
            .with_context(|| format!("invalid local path {:?}", command.local_path))?;
        let mut request = UploadRequest::new(account, local_path, command.remote_path);
        request.policy = command.policy;
        request.behaviour = command.behaviour;
        request.create_remote_folder = true;

        let mut events = self.uploader.events();
        match self.uploader.request(request).await? {
            Acceptance::Queued { key, .. } => wait_for_finish(&mut events, &key).await,
            Acceptance::AlreadyQueued => anyhow::bail!("an upload to that path is already queued"),
        }
    }

    pub async fn download(&self, remote_path: String) -> anyhow::Result<Outcome> {
        let account = self.account_name()?;
        let mut events = self.downloader.events();
        match self
            .downloader
            .request(DownloadRequest::new(account, remote_path))
            .await?
        {
            Acceptance::Queued { key, .. } => wait_for_finish(&mut events, &key).await,
            Acceptance::AlreadyQueued => anyhow::bail!("that file is already being downloaded"),
        }
    }

    /// Re-queues failed uploads once and waits for the queue to drain.
    pub async fn retry(&self) -> anyhow::Result<usize> {
        let mut events = self.uploader.events();
        let summary = self
            .uploader
            .retry_failed_uploads()
            .await
            .context("failed to retry uploads")?;
        if summary.requeued > 0 {
            wait_for_drain(&mut events).await?;
        }
        Ok(summary.requeued)
    }

    /// Stored upload records, one JSON object per line.
    pub async fn upload_lines(&self) -> anyhow::Result<Vec<String>> {
        let records = self
            .uploader
            .records()
            .await
            .context("failed to list uploads")?;
        records
            .iter()
            .map(|record| serde_json::to_string(record).context("failed to encode upload"))
            .collect()
    }

    /// Drops an account: its running transfers stop, queued ones and its
    /// upload records go. Returns how many queued transfers were dropped.
    pub async fn remove_account(&self, name: &str) -> usize {
        let known = self.accounts.remove(name);
        let uploads = self.uploader.cancel_account(name).await;
        let downloads = self.downloader.cancel_account(name).await;
        info!(account = name, known, uploads, downloads, "account removed");
        uploads + downloads
    }

    /// Removes the configured account and forgets its saved password.
    pub async fn logout(&self) -> anyhow::Result<()> {
        let account = self.account_name()?.to_string();
        self.remove_account(&account).await;
        CredentialStorage::new()
            .delete_password(&account)
            .context("failed to remove saved password")?;
        info!(account = %account, "saved password removed");
        Ok(())
    }

    /// Sweeps failed uploads on a backoff schedule until interrupted.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            account = self.account.as_ref().map(|account| account.name.as_str()),
            data_dir = %self.config.data_dir.display(),
            storage_root = %self.config.storage_root.display(),
            "nextsyncd started"
        );
        let backoff = Backoff::new(self.config.retry_base, self.config.retry_max, true);
        let mut attempt = 0u32;
        loop {
            let delay = backoff.delay(attempt);
            debug!(delay_ms = delay.as_millis() as u64, "next retry sweep scheduled");
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            match self.uploader.retry_failed_uploads().await {
                Ok(summary) if summary.requeued > 0 || summary.deferred > 0 => {
                    attempt = attempt.saturating_add(1);
                }
                Ok(_) => attempt = 0,
                Err(err) => {
                    warn!(error = %err, "retry sweep failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        self.uploader.shutdown().await;
        self.downloader.shutdown().await;
        Ok(())
    }
}

fn register_account(
    config: &DaemonConfig,
    registry: &AccountRegistry,
    secrets: &CredentialStorage,
) -> anyhow::Result<Option<Account>> {
    let (Some(server_url), Some(user)) = (&config.server_url, &config.user) else {
        return Ok(None);
    };
    let account = Account::new(server_url, user).context("invalid NEXTSYNC_SERVER_URL")?;
    match &config.password {
        Some(password) => {
            if config.remember_password {
                secrets
                    .save_password(&account.name, password)
                    .context("failed to save password to keyring")?;
            }
            registry.add_with_password(account.clone(), password.clone());
        }
        None => registry.add_with_keyring(account.clone()),
    }
    Ok(Some(account))
}

async fn wait_for_finish(
    events: &mut broadcast::Receiver<TransferEvent>,
    key: &TransferKey,
) -> anyhow::Result<Outcome> {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Finished {
                account,
                remote_path,
                code,
                final_path,
                ..
            }) if account == key.account && remote_path == key.remote_path => {
                return Ok(Outcome { code, final_path });
            }
            Ok(TransferEvent::AccountPurged { account, .. }) if account == key.account => {
                return Ok(Outcome {
                    code: ResultCode::AccountNotFound,
                    final_path: None,
                });
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed transfer events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("transfer service stopped before {key} finished")
            }
        }
    }
}

async fn wait_for_drain(events: &mut broadcast::Receiver<TransferEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Drained { .. }) => return Ok(()),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("upload service stopped before the queue drained")
            }
        }
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
