//! Write transactions and the transaction store.
//!
//! Every accepted write is tracked by a [`Transaction`]: created PENDING
//! when the write is enqueued, WRITING when the scheduler dequeues it, then
//! terminally DONE or ERROR once the handler returns. Any other transition
//! is a programming error and is rejected. Status transitions are
//! linearizable per transaction id -- all mutations go through the store's
//! lock.
//!
//! Records are retained for a configurable TTL measured from creation; a
//! reaper sweeps at `ttl/2` granularity and only evicts records that have
//! reached a terminal status. Evicted transactions look up as "not found".

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::{PluginError, PluginResult};
use crate::output::rfc3339_now;
use crate::stop::StopSignal;

/// Status of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteStatus {
    Pending,
    Writing,
    Done,
    Error,
}

impl WriteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteStatus::Done | WriteStatus::Error)
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteStatus::Pending => "PENDING",
            WriteStatus::Writing => "WRITING",
            WriteStatus::Done => "DONE",
            WriteStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

struct TxnState {
    status: WriteStatus,
    updated: String,
    message: String,
}

/// A single asynchronous write, tracked from submission to terminal status.
pub struct Transaction {
    id: String,
    created: String,
    timeout: Duration,
    payload: String,
    state: Mutex<TxnState>,
    done: watch::Sender<bool>,
}

impl Transaction {
    fn new(timeout: Duration, payload: String) -> Self {
        let now = rfc3339_now();
        let (done, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().simple().to_string(),
            created: now.clone(),
            timeout,
            payload,
            state: Mutex::new(TxnState {
                status: WriteStatus::Pending,
                updated: now,
                message: String::new(),
            }),
            done,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> &str {
        &self.created
    }

    /// Deadline for the write itself, and for sync waiters.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Free-form tag describing the write payload (typically the action).
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn status(&self) -> WriteStatus {
        self.state.lock().status
    }

    pub fn message(&self) -> String {
        self.state.lock().message.clone()
    }

    pub fn updated(&self) -> String {
        self.state.lock().updated.clone()
    }

    /// Wait until the transaction reaches a terminal status, bounded by the
    /// given deadline. Returns false on deadline expiry.
    pub async fn wait(&self, deadline: Duration) -> bool {
        let mut rx = self.done.subscribe();
        let signalled = async move {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, signalled).await.is_ok()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

struct TxnEntry {
    seq: u64,
    created_at: Instant,
    txn: Arc<Transaction>,
}

/// TTL-bounded store of write transactions.
pub struct TransactionStore {
    ttl: Duration,
    next_seq: AtomicU64,
    entries: Mutex<HashMap<String, TxnEntry>>,
}

impl TransactionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_seq: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new PENDING transaction and insert it into the store.
    pub fn create(&self, timeout: Duration, payload_tag: impl Into<String>) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(timeout, payload_tag.into()));
        trace!(id = %txn.id(), "new write transaction");
        self.entries.lock().insert(
            txn.id().to_string(),
            TxnEntry {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                created_at: Instant::now(),
                txn: txn.clone(),
            },
        );
        txn
    }

    pub fn get(&self, id: &str) -> PluginResult<Arc<Transaction>> {
        self.entries
            .lock()
            .get(id)
            .map(|e| e.txn.clone())
            .ok_or_else(|| PluginError::TransactionNotFound(id.to_string()))
    }

    /// All live transactions, oldest first.
    pub fn list(&self) -> Vec<Arc<Transaction>> {
        let entries = self.entries.lock();
        let mut txns: Vec<_> = entries.values().map(|e| (e.seq, e.txn.clone())).collect();
        txns.sort_by_key(|(seq, _)| *seq);
        txns.into_iter().map(|(_, t)| t).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Advance a transaction's status.
    ///
    /// Legal transitions are PENDING -> WRITING -> {DONE, ERROR}; anything
    /// else is rejected. Terminal transitions fire the done signal exactly
    /// once (re-signalling is a no-op at the channel level).
    pub fn mark(
        &self,
        id: &str,
        status: WriteStatus,
        message: Option<&str>,
    ) -> PluginResult<()> {
        let entries = self.entries.lock();
        let entry = entries
            .get(id)
            .ok_or_else(|| PluginError::TransactionNotFound(id.to_string()))?;

        let mut state = entry.txn.state.lock();
        let legal = matches!(
            (state.status, status),
            (WriteStatus::Pending, WriteStatus::Writing)
                | (WriteStatus::Writing, WriteStatus::Done)
                | (WriteStatus::Writing, WriteStatus::Error)
        );
        if !legal {
            return Err(PluginError::InvalidTransition {
                from: state.status.to_string(),
                to: status.to_string(),
            });
        }

        trace!(id, %status, "transaction status updated");
        state.status = status;
        state.updated = rfc3339_now();
        if let Some(message) = message {
            state.message = message.to_string();
        }
        if status.is_terminal() {
            entry.txn.done.send_replace(true);
        }
        Ok(())
    }

    /// Evict terminal transactions older than the TTL. Returns the number
    /// evicted. Records still in flight are left alone regardless of age.
    pub fn reap(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.txn.status().is_terminal() && e.created_at.elapsed() >= self.ttl)
        });
        before - entries.len()
    }

    /// Run the reaper at `ttl/2` granularity until stopped.
    pub fn spawn_reaper(self: &Arc<Self>, stop: StopSignal) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let period = store.ttl / 2;
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => {
                        let evicted = store.reap();
                        if evicted > 0 {
                            debug!(evicted, "reaped expired transactions");
                        }
                    }
                }
            }
        })
    }
}
