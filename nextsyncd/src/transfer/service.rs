use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use nextsync_core::{ProgressListener, ProgressUpdate};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::forest::{PendingForest, TransferKey, is_same_or_below};
use super::operation::{Direction, TransferOperation};
use super::result::{ResultCode, TransferResult};
use crate::accounts::{AccountError, AccountStore};
use crate::notify::{
    NotificationSink, PercentTracker, ProgressRegistry, Subscription, TransferEvent,
};

pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_millis(2000);
const EVENT_CAPACITY: usize = 256;

/// Direction-specific behaviour plugged into the shared queue worker.
#[async_trait]
pub trait TransferHandler: Send + Sync + 'static {
    fn direction(&self) -> Direction;

    /// Runs on the worker before any network call. A returned result
    /// finishes the operation without contacting the server.
    async fn prepare(&self, op: &TransferOperation) -> Option<TransferResult>;

    /// Consulted on every progress report of the running operation. A code
    /// cancels it cooperatively with that code.
    fn check_progress(&self, _op: &TransferOperation) -> Option<ResultCode> {
        None
    }

    /// Records the outcome. Local follow-up work may still fail after a
    /// successful transfer, so the returned result is the one reported.
    async fn finish(&self, op: &TransferOperation, result: TransferResult) -> TransferResult;

    /// A cancelled operation left the queue. For the running one this
    /// happens before it stops, and the operation is already released.
    async fn dequeued(&self, op: &TransferOperation, reason: Option<ResultCode>);

    async fn purge_account(&self, account: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Queued { key: TransferKey, linked_to: String },
    AlreadyQueued,
}

impl Acceptance {
    pub fn is_queued(&self) -> bool {
        matches!(self, Acceptance::Queued { .. })
    }
}

/// Collaborators shared by both services.
#[derive(Clone)]
pub struct ServiceContext {
    pub accounts: Arc<dyn AccountStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub progress: Arc<ProgressRegistry>,
    pub idle_grace: Duration,
}

struct QueueState {
    forest: PendingForest<Arc<TransferOperation>>,
    work: VecDeque<(TransferKey, u64)>,
    current: Option<Arc<TransferOperation>>,
}

struct Shared<H> {
    state: Mutex<QueueState>,
    wakeup: Notify,
    handler: H,
    accounts: Arc<dyn AccountStore>,
    sink: Arc<dyn NotificationSink>,
    progress: Arc<ProgressRegistry>,
    events: broadcast::Sender<TransferEvent>,
    next_id: AtomicU64,
    idle_grace: Duration,
    shutdown: CancellationToken,
}

/// A FIFO transfer queue drained by exactly one background worker.
pub struct TransferService<H: TransferHandler> {
    shared: Arc<Shared<H>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: TransferHandler> TransferService<H> {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(handler: H, context: ServiceContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                forest: PendingForest::new(),
                work: VecDeque::new(),
                current: None,
            }),
            wakeup: Notify::new(),
            handler,
            accounts: context.accounts,
            sink: context.sink,
            progress: context.progress,
            events,
            next_id: AtomicU64::new(1),
            idle_grace: context.idle_grace,
            shutdown: CancellationToken::new(),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn next_operation_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims the operation's key. `None` when the key is already pending.
    pub fn insert(&self, op: &Arc<TransferOperation>) -> Option<(TransferKey, String)> {
        self.shared
            .lock()
            .forest
            .put_if_absent(op.account(), op.remote_path(), Arc::clone(op))
    }

    /// Releases a key claimed by [`insert`](Self::insert) that never got scheduled.
    pub fn withdraw(&self, op: &TransferOperation) {
        let mut state = self.shared.lock();
        if state
            .forest
            .get(op.key())
            .is_some_and(|pending| pending.id() == op.id())
        {
            state.forest.remove(op.account(), op.remote_path());
        }
    }

    /// Hands an inserted operation to the worker.
    pub fn schedule(&self, op: &TransferOperation, linked_to: String) {
        self.shared.emit(TransferEvent::Added {
            direction: self.shared.handler.direction(),
            account: op.account().to_string(),
            remote_path: op.remote_path().to_string(),
            linked_to,
        });
        self.shared
            .lock()
            .work
            .push_back((op.key().clone(), op.id()));
        self.shared.wakeup.notify_one();
    }

    /// Cancels everything pending at or below `remote_path`, plus the running
    /// operation when its path matches. Queued entries never reach the
    /// network. Returns how many operations were cancelled.
    pub async fn cancel(
        &self,
        account: &str,
        remote_path: &str,
        reason: Option<ResultCode>,
    ) -> usize {
        let (removed, current) = {
            let mut state = self.shared.lock();
            let removed = state.forest.remove(account, remote_path);
            (removed, state.current.clone())
        };
        let code = reason.unwrap_or(ResultCode::Cancelled);
        let unlinked_from = removed.unlinked_from.clone();

        let mut cancelled = 0;
        let running = current
            .filter(|op| op.account() == account && is_same_or_below(op.remote_path(), remote_path));
        if let Some(op) = &running {
            debug!(account, remote_path = op.remote_path(), "cancelling running transfer");
            op.cancel(code);
            op.release();
            self.shared.handler.dequeued(op, reason).await;
            cancelled += 1;
        }
        let running = running.map(|op| op.id());

        for op in removed.into_operations() {
            if Some(op.id()) == running {
                continue;
            }
            op.cancel(code);
            self.shared.handler.dequeued(&op, reason).await;
            self.shared.emit(TransferEvent::Finished {
                direction: self.shared.handler.direction(),
                account: op.account().to_string(),
                remote_path: op.remote_path().to_string(),
                code,
                final_path: None,
                unlinked_from: unlinked_from.clone(),
            });
            cancelled += 1;
        }
        cancelled
    }

    /// Cancels the running operation if it belongs to `account` and drops
    /// every queued one. Returns the number of queued operations removed.
    pub async fn cancel_account(&self, account: &str) -> usize {
        self.shared.cancel_account(account).await
    }

    /// True while the file, or anything below the folder, is queued or running.
    pub fn is_pending(&self, account: &str, remote_path: &str) -> bool {
        self.shared.lock().forest.contains(account, remote_path)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().forest.len()
    }

    pub fn current(&self) -> Option<Arc<TransferOperation>> {
        self.shared.lock().current.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_progress(&self, key: TransferKey) -> Subscription {
        self.shared.progress.subscribe(key)
    }

    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.shared.accounts
    }

    /// Interrupts the operation in flight and stops the worker once it has
    /// recorded the outcome.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let current = self.shared.lock().current.clone();
        if let Some(op) = current {
            op.cancel(ResultCode::ServiceInterrupted);
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && let Err(err) = worker.await
        {
            warn!(error = %err, "transfer worker ended abnormally");
        }
    }
}

impl<H: TransferHandler> Drop for TransferService<H> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Some(op) = self.shared.lock().current.clone() {
            op.cancel(ResultCode::ServiceInterrupted);
        }
    }
}

impl<H: TransferHandler> Shared<H> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    async fn cancel_account(&self, account: &str) -> usize {
        let (removed, current) = {
            let mut state = self.lock();
            let current = state
                .current
                .clone()
                .filter(|op| op.account() == account);
            (state.forest.remove_account(account), current)
        };
        let running = current.map(|op| {
            op.cancel(ResultCode::Cancelled);
            op.release();
            op.id()
        });
        let mut queued = 0;
        for op in &removed {
            if Some(op.id()) != running {
                op.cancel(ResultCode::Cancelled);
                queued += 1;
            }
        }
        self.handler.purge_account(account).await;
        info!(
            direction = self.handler.direction().as_str(),
            account,
            queued,
            running = running.is_some(),
            "dropped transfers of account"
        );
        self.emit(TransferEvent::AccountPurged {
            direction: self.handler.direction(),
            account: account.to_string(),
            removed: queued + usize::from(running.is_some()),
        });
        queued
    }

    async fn process(&self, key: TransferKey, id: u64) {
        let op = {
            let mut state = self.lock();
            let Some(op) = state
                .forest
                .get(&key)
                .filter(|op| op.id() == id)
                .cloned()
            else {
                debug!(account = %key.account, remote_path = %key.remote_path, "skipping withdrawn transfer");
                return;
            };
            state.current = Some(Arc::clone(&op));
            op
        };

        if !self.accounts.exists(op.account()) {
            warn!(
                account = op.account(),
                remote_path = op.remote_path(),
                "account no longer exists, dropping its transfers"
            );
            self.lock().current = None;
            self.cancel_account(op.account()).await;
            return;
        }

        let direction = self.handler.direction();
        self.emit(TransferEvent::Started {
            direction,
            account: op.account().to_string(),
            remote_path: op.remote_path().to_string(),
        });
        if !op.created_by().is_automatic() {
            self.sink.transfer_started(&op);
        }

        let result = match AssertUnwindSafe(self.run(&op)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    account = op.account(),
                    remote_path = op.remote_path(),
                    message = %message,
                    "transfer panicked"
                );
                TransferResult::failure(ResultCode::UnhandledError, message)
            }
        };

        let unlinked_from = {
            let mut state = self.lock();
            state.current = None;
            if state
                .forest
                .get(&key)
                .is_some_and(|pending| pending.id() == op.id())
            {
                state
                    .forest
                    .remove_payload(&key.account, &key.remote_path)
                    .unlinked_from
            } else {
                None
            }
        };

        let result = match AssertUnwindSafe(self.handler.finish(&op, result.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    account = op.account(),
                    remote_path = op.remote_path(),
                    "recording transfer result panicked"
                );
                result
            }
        };
        self.sink.transfer_finished(&op, &result);
        self.emit(TransferEvent::Finished {
            direction,
            account: op.account().to_string(),
            remote_path: op.remote_path().to_string(),
            code: result.code,
            final_path: result
                .remote
                .as_ref()
                .map(|remote| remote.remote_path.clone()),
            unlinked_from,
        });
    }

    async fn run(&self, op: &TransferOperation) -> TransferResult {
        if let Some(result) = self.handler.prepare(op).await {
            return result;
        }
        let client = match self.accounts.client_for(op.account()).await {
            Ok(client) => client,
            Err(err) => {
                let code = match &err {
                    AccountError::NotFound(_) => ResultCode::AccountNotFound,
                    AccountError::Credentials { .. } => ResultCode::Unauthorized,
                    AccountError::InvalidServer(_) | AccountError::Client(_) => {
                        ResultCode::UnhandledError
                    }
                };
                return TransferResult::failure(code, err.to_string());
            }
        };
        let listener = OperationProgress {
            shared: self,
            op,
            percent: PercentTracker::default(),
            announced: AtomicBool::new(false),
        };
        op.execute(client.as_ref(), &listener).await
    }

    fn drained(&self) {
        let direction = self.handler.direction();
        self.sink.queue_drained(direction);
        self.emit(TransferEvent::Drained { direction });
    }
}

async fn run_worker<H: TransferHandler>(shared: Arc<Shared<H>>) {
    let mut busy = false;
    loop {
        if shared.shutdown.is_cancelled() {
            return;
        }
        let next = shared.lock().work.pop_front();
        if let Some((key, id)) = next {
            busy = true;
            shared.process(key, id).await;
            continue;
        }
        if busy {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = shared.wakeup.notified() => {}
                _ = tokio::time::sleep(shared.idle_grace) => {
                    busy = false;
                    shared.drained();
                }
            }
        } else {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = shared.wakeup.notified() => {}
            }
        }
    }
}

struct OperationProgress<'a, H> {
    shared: &'a Shared<H>,
    op: &'a TransferOperation,
    percent: PercentTracker,
    announced: AtomicBool,
}

impl<H: TransferHandler> ProgressListener for OperationProgress<'_, H> {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.shared.progress.publish(self.op.key(), update);
        if !self.op.is_cancelled()
            && let Some(code) = self.shared.handler.check_progress(self.op)
        {
            info!(
                account = self.op.account(),
                remote_path = self.op.remote_path(),
                code = code.as_str(),
                "deferring running transfer"
            );
            self.op.cancel(code);
            return;
        }
        let percent = update.percent().unwrap_or(0);
        if self.percent.changed(percent) {
            if self.op.created_by().is_automatic() && !self.announced.swap(true, Ordering::SeqCst)
            {
                self.shared.sink.transfer_started(self.op);
            }
            self.shared
                .sink
                .transfer_progress(self.op, percent, &update.name);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "transfer panicked".to_string()
    }
}
