//! The queue engine over FoundationDB.
//!
//! This module contains the core `QueueStore` type and its implementation,
//! split across multiple submodules for organization:
//!
//! - `push`: job enqueue and queue listing
//! - `claim`: the pop protocol (candidate discovery, versionstamp claims,
//!   arbitration, pop commit)
//! - `remove`: completion, claim release, and crawl cancellation
//! - `active`: the active-job tracker for teams and crawls
//! - `counters`: atomic counters, reconciliation, and stale-counter sweeps
//! - `cleanup`: the janitor's TTL, active-expiry, and orphan-claim sweeps
//!
//! Every mutating operation is a single FoundationDB transaction (or a
//! bounded sequence of them), retried through the store's native
//! `on_error` loop so transient conflicts never reach callers.

mod active;
mod claim;
mod cleanup;
mod counters;
mod push;
mod remove;

pub use claim::ClaimedJob;
pub use push::NewJob;

use std::time::{SystemTime, UNIX_EPOCH};

use foundationdb::future::FdbValues;
use foundationdb::options::StreamingMode;
use foundationdb::{Database, FdbError, RangeOption, Transaction, TransactionCommitError};
use thiserror::Error;

use crate::codec::{health_key, CodecError};

/// Batch size for janitor sweeps and crawl cancellation. Keeps each
/// transaction well inside the store's size and five-second limits.
pub(crate) const SWEEP_BATCH_SIZE: usize = 100;

/// Upper bound on batches a single sweep invocation processes, so one
/// janitor tick does bounded work.
pub(crate) const MAX_SWEEP_BATCHES: usize = 10;

/// Handle to the queue's FoundationDB cluster. Cheap to share behind an
/// `Arc`; all state lives in the store.
pub struct QueueStore {
    pub(crate) db: Database,
}

#[derive(Debug, Error)]
pub enum QueueStoreError {
    #[error("fdb error: {0}")]
    Fdb(#[from] FdbError),
    #[error("fdb commit error: {0}")]
    Commit(#[from] TransactionCommitError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("value serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid queue key handle: {0}")]
    InvalidHandle(String),
}

impl QueueStore {
    /// Open the queue against a cluster file, or the platform default
    /// cluster file when `None`. `foundationdb::boot()` must already have
    /// been called by the process entrypoint.
    pub fn open(cluster_file: Option<&str>) -> Result<Self, QueueStoreError> {
        let db = Database::new(cluster_file)?;
        Ok(Self { db })
    }

    /// Probe the store with a single read.
    pub async fn health_check(&self) -> Result<bool, QueueStoreError> {
        let trx = self.db.create_trx()?;
        trx.get(&health_key(), false).await?;
        Ok(true)
    }
}

/// Get current epoch time in milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Range read with an explicit limit. `WantAll` fetches the whole batch in
/// one round trip; `snapshot` controls whether the read creates a conflict
/// range.
pub(crate) async fn read_range(
    trx: &Transaction,
    begin: &[u8],
    end: &[u8],
    limit: usize,
    snapshot: bool,
) -> Result<FdbValues, FdbError> {
    let mut opt = RangeOption::from((begin, end));
    opt.limit = Some(limit);
    opt.mode = StreamingMode::WantAll;
    trx.get_range(&opt, 1, snapshot).await
}
