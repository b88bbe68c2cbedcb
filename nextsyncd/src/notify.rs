use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use nextsync_core::ProgressUpdate;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transfer::{Direction, ResultCode, TransferKey, TransferOperation, TransferResult};

/// Broadcast to every interested party as the queues move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Added {
        direction: Direction,
        account: String,
        remote_path: String,
        linked_to: String,
    },
    Started {
        direction: Direction,
        account: String,
        remote_path: String,
    },
    Finished {
        direction: Direction,
        account: String,
        remote_path: String,
        code: ResultCode,
        /// Where the file ended up remotely; differs after a rename.
        final_path: Option<String>,
        unlinked_from: Option<String>,
    },
    AccountPurged {
        direction: Direction,
        account: String,
        removed: usize,
    },
    Drained {
        direction: Direction,
    },
}

/// User-facing notification surface.
pub trait NotificationSink: Send + Sync {
    fn transfer_started(&self, op: &TransferOperation);
    fn transfer_progress(&self, op: &TransferOperation, percent: u8, file_name: &str);
    fn transfer_finished(&self, op: &TransferOperation, result: &TransferResult);
    fn queue_drained(&self, direction: Direction);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureNotice {
    UpdateCredentials,
    ResolveConflict,
    Failed,
}

/// Which failure notice, if any, a finished transfer deserves. Successes,
/// cancellations, deferrals and vanished sources stay quiet.
pub fn failure_notice(result: &TransferResult) -> Option<FailureNotice> {
    match result.code {
        ResultCode::Ok
        | ResultCode::Cancelled
        | ResultCode::LocalFileNotFound
        | ResultCode::Locked
        | ResultCode::DelayedForWifi
        | ResultCode::DelayedForCharging
        | ResultCode::DelayedInPowerSaveMode => None,
        ResultCode::Unauthorized => Some(FailureNotice::UpdateCredentials),
        ResultCode::SyncConflict => Some(FailureNotice::ResolveConflict),
        _ => Some(FailureNotice::Failed),
    }
}

/// Renders notifications as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifications;

impl NotificationSink for LogNotifications {
    fn transfer_started(&self, op: &TransferOperation) {
        info!(
            direction = op.direction().as_str(),
            account = op.account(),
            remote_path = op.remote_path(),
            "transfer started"
        );
    }

    fn transfer_progress(&self, op: &TransferOperation, percent: u8, file_name: &str) {
        debug!(
            direction = op.direction().as_str(),
            account = op.account(),
            percent,
            file_name,
            "transfer progress"
        );
    }

    fn transfer_finished(&self, op: &TransferOperation, result: &TransferResult) {
        let direction = op.direction().as_str();
        let message = result.message.as_deref().unwrap_or_default();
        match failure_notice(result) {
            None => info!(
                direction,
                account = op.account(),
                remote_path = op.remote_path(),
                code = result.code.as_str(),
                "transfer finished"
            ),
            Some(FailureNotice::UpdateCredentials) => warn!(
                direction,
                account = op.account(),
                "credentials rejected; update the account password"
            ),
            Some(FailureNotice::ResolveConflict) => warn!(
                direction,
                account = op.account(),
                remote_path = op.remote_path(),
                "remote file already exists; resolve the conflict"
            ),
            Some(FailureNotice::Failed) => warn!(
                direction,
                account = op.account(),
                remote_path = op.remote_path(),
                code = result.code.as_str(),
                message,
                "transfer failed"
            ),
        }
    }

    fn queue_drained(&self, direction: Direction) {
        debug!(direction = direction.as_str(), "transfer queue drained");
    }
}

/// Reports a percent only when it differs from the previous one.
#[derive(Debug, Default)]
pub struct PercentTracker {
    last: AtomicU8,
}

impl PercentTracker {
    pub fn changed(&self, percent: u8) -> bool {
        self.last.swap(percent, Ordering::SeqCst) != percent
    }
}

type Listeners = HashMap<TransferKey, Vec<(u64, mpsc::UnboundedSender<ProgressUpdate>)>>;

/// Per-key progress subscriptions.
#[derive(Default)]
pub struct ProgressRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Listeners>,
}

impl ProgressRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, key: TransferKey) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.entry(key.clone()).or_default().push((id, tx));
        }
        Subscription {
            registry: Arc::downgrade(self),
            key,
            id,
            rx,
        }
    }

    pub fn publish(&self, key: &TransferKey, update: &ProgressUpdate) {
        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        if let Some(senders) = listeners.get_mut(key) {
            senders.retain(|(_, tx)| tx.send(update.clone()).is_ok());
            if senders.is_empty() {
                listeners.remove(key);
            }
        }
    }

    pub fn listener_count(&self, key: &TransferKey) -> usize {
        self.listeners
            .lock()
            .map(|listeners| listeners.get(key).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn unsubscribe(&self, key: &TransferKey, id: u64) {
        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        if let Some(senders) = listeners.get_mut(key) {
            senders.retain(|(sub_id, _)| *sub_id != id);
            if senders.is_empty() {
                listeners.remove(key);
            }
        }
    }
}

/// Receives progress for one key until dropped.
pub struct Subscription {
    registry: Weak<ProgressRegistry>,
    key: TransferKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressUpdate>,
}

impl Subscription {
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(transferred: u64) -> ProgressUpdate {
        ProgressUpdate {
            rate: 1,
            transferred,
            total: Some(10),
            name: "a.txt".into(),
        }
    }

    #[test]
    fn percent_tracker_reports_changes_only() {
        let tracker = PercentTracker::default();
        assert!(!tracker.changed(0));
        assert!(tracker.changed(10));
        assert!(!tracker.changed(10));
        assert!(tracker.changed(11));
    }

    #[test]
    fn subscriptions_receive_their_key_only() {
        let registry = ProgressRegistry::new();
        let key = TransferKey::new("alice", "/a.txt");
        let mut sub = registry.subscribe(key.clone());

        registry.publish(&TransferKey::new("alice", "/b.txt"), &update(1));
        registry.publish(&key, &update(5));

        assert_eq!(sub.try_recv().map(|u| u.transferred), Some(5));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let registry = ProgressRegistry::new();
        let key = TransferKey::new("alice", "/a.txt");
        let first = registry.subscribe(key.clone());
        let second = registry.subscribe(key.clone());
        assert_eq!(registry.listener_count(&key), 2);

        drop(first);
        assert_eq!(registry.listener_count(&key), 1);
        drop(second);
        assert_eq!(registry.listener_count(&key), 0);
    }

    #[test]
    fn failure_notices_follow_result_codes() {
        let quiet = TransferResult::with_code(ResultCode::DelayedForWifi);
        assert_eq!(failure_notice(&quiet), None);
        let auth = TransferResult::with_code(ResultCode::Unauthorized);
        assert_eq!(
            failure_notice(&auth),
            Some(FailureNotice::UpdateCredentials)
        );
        let conflict = TransferResult::with_code(ResultCode::SyncConflict);
        assert_eq!(
            failure_notice(&conflict),
            Some(FailureNotice::ResolveConflict)
        );
        let network = TransferResult::with_code(ResultCode::NetworkError);
        assert_eq!(failure_notice(&network), Some(FailureNotice::Failed));
    }
}
