//! Rolling-window aggregates over the per-user transaction log
//!
//! Aggregates are never kept as mutable counters. Every evaluated
//! transaction appends one [`TransactionEvent`] to the user's log, and
//! window statistics are recomputed from that log by pure functions on
//! [`UserHistory`]. The log holds one entry per transaction id, so a
//! re-evaluation replaces the earlier attempt instead of adding to it.
//! Appends for one user are serialized through [`UserLocks`]; different
//! users never share a lock or a log shard.

use crate::{Decision, Error, Result, Transaction};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Transaction record in the append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Transaction ID
    pub transaction_id: Uuid,

    /// Amount
    pub amount: Decimal,

    /// Currency
    pub currency: String,

    /// Counterparty
    pub counterparty_id: String,

    /// Origin country
    pub origin_country: String,

    /// Device used
    pub device_id: String,

    /// Decision the engine returned
    pub decision: Decision,

    /// Transaction timestamp
    pub timestamp: DateTime<Utc>,
}

impl TransactionEvent {
    /// Build the log entry for an evaluated transaction
    pub fn from_transaction(tx: &Transaction, decision: Decision) -> Self {
        Self {
            transaction_id: tx.id,
            amount: tx.amount,
            currency: tx.currency.clone(),
            counterparty_id: tx.counterparty_id.clone(),
            origin_country: tx.origin_country.clone(),
            device_id: tx.device_id.clone(),
            decision,
            timestamp: tx.timestamp,
        }
    }

    /// Blocked attempts stay in the log but never count towards aggregates
    fn counts(&self) -> bool {
        self.decision != Decision::Block
    }
}

/// Count and volume inside a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Transactions in the window
    pub count: u32,

    /// Total amount in the window
    pub total_amount: Decimal,

    /// Exclusive window start
    pub window_start: DateTime<Utc>,

    /// Inclusive window end
    pub window_end: DateTime<Utc>,
}

/// Snapshot of one user's log, read under the user's lock
#[derive(Debug, Clone, Default)]
pub struct UserHistory {
    events: Vec<TransactionEvent>,
}

impl UserHistory {
    /// Wrap log entries, ordering them by timestamp
    pub fn new(mut events: Vec<TransactionEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp);
        Self { events }
    }

    /// Number of entries, blocked attempts included
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log slice is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Entries in timestamp order
    pub fn events(&self) -> &[TransactionEvent] {
        &self.events
    }

    /// Drop earlier attempts of the transaction being evaluated so it is counted once
    pub fn excluding(mut self, transaction_id: Uuid) -> Self {
        self.events.retain(|e| e.transaction_id != transaction_id);
        self
    }

    /// Count and total of counted entries in `(as_of - window, as_of]`
    pub fn window_stats(&self, as_of: DateTime<Utc>, window: Duration) -> WindowStats {
        let window_start = as_of - window;
        let (count, total_amount) = self
            .events
            .iter()
            .filter(|e| e.counts() && e.timestamp > window_start && e.timestamp <= as_of)
            .fold((0u32, Decimal::ZERO), |(count, total), e| {
                (count + 1, total + e.amount)
            });

        WindowStats {
            count,
            total_amount,
            window_start,
            window_end: as_of,
        }
    }

    /// Average counted amount over the lookback, with the sample size
    pub fn average_amount(&self, as_of: DateTime<Utc>, lookback: Duration) -> Option<(Decimal, u32)> {
        let stats = self.window_stats(as_of, lookback);
        if stats.count == 0 {
            return None;
        }
        Some((stats.total_amount / Decimal::from(stats.count), stats.count))
    }

    /// Earliest counted transaction, i.e. when the user's baseline starts
    pub fn first_activity(&self) -> Option<DateTime<Utc>> {
        self.events.iter().find(|e| e.counts()).map(|e| e.timestamp)
    }

    /// Earliest counted transaction from `country`
    pub fn country_first_seen(&self, country: &str) -> Option<DateTime<Utc>> {
        self.events
            .iter()
            .find(|e| e.counts() && e.origin_country == country)
            .map(|e| e.timestamp)
    }
}

/// Append-only transaction log collaborator
pub trait TransactionLog: Send + Sync {
    /// Append one entry to the user's log
    fn append(&self, user_id: &str, event: TransactionEvent) -> Result<()>;

    /// Entries for the user with `timestamp >= since`
    fn history(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<TransactionEvent>>;
}

/// In-memory log sharded per user
pub struct InMemoryTransactionLog {
    retention: Duration,
    // Map: user_id -> entries in timestamp order
    users: DashMap<String, Vec<TransactionEvent>>,
}

impl InMemoryTransactionLog {
    /// Create log keeping entries for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            users: DashMap::new(),
        }
    }

    /// Drop a user's log (e.g., for testing or account closure)
    pub fn reset_user(&self, user_id: &str) {
        self.users.remove(user_id);
    }

    /// Number of users with a log
    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn append(&self, user_id: &str, event: TransactionEvent) -> Result<()> {
        let mut entry = self.users.entry(user_id.to_string()).or_default();
        let events = entry.value_mut();

        // A re-evaluated transaction keeps one entry, carrying the latest decision
        events.retain(|e| e.transaction_id != event.transaction_id);

        let position = events.partition_point(|e| e.timestamp <= event.timestamp);
        events.insert(position, event);

        // Clean up entries outside retention
        if let Some(latest) = events.last().map(|e| e.timestamp) {
            let horizon = latest - self.retention;
            events.retain(|e| e.timestamp >= horizon);
        }

        Ok(())
    }

    fn history(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<TransactionEvent>> {
        Ok(self
            .users
            .get(user_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// One logical writer per user id
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    /// Create empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for the user; hold its guard across read-evaluate-append
    pub fn for_user(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` holding the user's lock, then drop the entry if nobody else waits on it
    pub fn with_user<T>(&self, user_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.for_user(user_id);
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.locks.remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Users with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock entry is live
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Read path from the log to [`UserHistory`] and [`WindowStats`]
pub struct AggregateAccessor {
    log: Arc<dyn TransactionLog>,
    lookback: Duration,
}

impl AggregateAccessor {
    /// Create accessor reading `lookback` worth of history
    pub fn new(log: Arc<dyn TransactionLog>, lookback: Duration) -> Self {
        Self { log, lookback }
    }

    /// Load the user's history slice; a failing store maps to `DependencyUnavailable`
    pub fn load(&self, user_id: &str, as_of: DateTime<Utc>) -> Result<UserHistory> {
        self.log
            .history(user_id, as_of - self.lookback)
            .map(UserHistory::new)
            .map_err(|e| match e {
                Error::DependencyUnavailable(msg) => Error::DependencyUnavailable(msg),
                other => Error::DependencyUnavailable(format!("transaction log: {}", other)),
            })
    }

    /// `windowStats(userId, window)` as of `as_of`
    pub fn window_stats(&self, user_id: &str, window: Duration, as_of: DateTime<Utc>) -> Result<WindowStats> {
        Ok(self.load(user_id, as_of)?.window_stats(as_of, window))
    }

    /// Append the evaluated transaction to the user's log
    pub fn record(&self, user_id: &str, event: TransactionEvent) -> Result<()> {
        self.log.append(user_id, event)
    }
}
