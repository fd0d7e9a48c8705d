//! Tenant concurrency semaphore: an at-most-N-concurrent-holders primitive
//! gating pops per team.
//!
//! Each team owns an ordered set of `(holder_id) → expires_at` leases in a
//! dedicated subspace. A single serializable transaction reaps expired
//! leases, checks cardinality, and inserts the new holder — the
//! check-and-insert is indivisible, so the cap can never be exceeded by a
//! race. Holders keep their lease alive with heartbeats; a crashed holder's
//! slot becomes acquirable as soon as its lease expires.
//!
//! The semaphore accepts its own cluster file so deployments can point it
//! at a separate FoundationDB cluster from the queue; by default it shares
//! the queue's.

use std::future::Future;
use std::time::Duration;

use foundationdb::{Database, FdbError, TransactionCommitError};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff;
use crate::codec::{self, decode_i64_be, encode_i64_be};
use crate::queue_store::{now_epoch_ms, read_range};

/// Cap on holders scanned per acquire; far above any sane team limit.
const LEASE_SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("fdb error: {0}")]
    Fdb(#[from] FdbError),
    #[error("fdb commit error: {0}")]
    Commit(#[from] TransactionCommitError),
    #[error("semaphore lease lost for holder {holder_id} of team {team_id}")]
    LeaseLost { team_id: String, holder_id: String },
    #[error("deadline exceeded acquiring semaphore slot for team {0}")]
    DeadlineExceeded(String),
    #[error("cancelled while holding or acquiring semaphore slot for team {0}")]
    Cancelled(String),
}

/// Result of a single acquire attempt.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOutcome {
    pub granted: bool,
    /// Live holders after this attempt (including us when granted).
    pub holders: i64,
    /// Expired leases reclaimed during this attempt.
    pub removed: i64,
}

/// Result of a blocking acquire.
#[derive(Debug, Clone, Copy)]
pub struct BlockingOutcome {
    /// True when at least one attempt came back rejected before the grant.
    pub limited: bool,
    /// Expired leases reclaimed across all attempts.
    pub removed: i64,
}

/// Tuning for `acquire_blocking` and `with_semaphore`.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub ttl: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overall budget before the acquire fails with `DeadlineExceeded`.
    pub deadline: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            deadline: Duration::from_secs(30),
        }
    }
}

pub struct TenantSemaphore {
    db: Database,
    /// Single-tenant deployments skip the semaphore entirely for limits of
    /// one: there is nobody to contend with.
    self_hosted: bool,
}

impl TenantSemaphore {
    pub fn open(cluster_file: Option<&str>, self_hosted: bool) -> Result<Self, SemaphoreError> {
        let db = Database::new(cluster_file)?;
        Ok(Self { db, self_hosted })
    }

    fn bypass(&self, limit: u32) -> bool {
        self.self_hosted && limit <= 1
    }

    /// One atomic attempt: reap expired leases, then insert the holder if
    /// the live count is under `limit`. Re-acquiring an existing live
    /// lease refreshes its expiry and grants without consuming a slot.
    pub async fn acquire(
        &self,
        team_id: &str,
        holder_id: &str,
        limit: u32,
        ttl: Duration,
    ) -> Result<AcquireOutcome, SemaphoreError> {
        if self.bypass(limit) {
            return Ok(AcquireOutcome {
                granted: true,
                holders: 1,
                removed: 0,
            });
        }

        let key = codec::semaphore_key(team_id, holder_id);
        let begin = codec::semaphore_prefix(team_id);
        let end = codec::range_end(&begin);

        let mut trx = self.db.create_trx()?;
        loop {
            let now = now_epoch_ms();
            let expires_at = now + ttl.as_millis() as i64;

            let leases = read_range(&trx, &begin, &end, LEASE_SCAN_LIMIT, false).await?;
            let mut live = 0i64;
            let mut removed = 0i64;
            let mut already_held = false;
            for kv in leases.iter() {
                if decode_i64_be(kv.value()) <= now {
                    trx.clear(kv.key());
                    removed += 1;
                    continue;
                }
                if kv.key() == key.as_slice() {
                    already_held = true;
                }
                live += 1;
            }

            let granted = if already_held {
                trx.set(&key, &encode_i64_be(expires_at));
                true
            } else if live < limit as i64 {
                trx.set(&key, &encode_i64_be(expires_at));
                live += 1;
                true
            } else {
                false
            };

            match trx.commit().await {
                Ok(_) => {
                    return Ok(AcquireOutcome {
                        granted,
                        holders: live,
                        removed,
                    })
                }
                Err(err) => trx = err.on_error().await?,
            }
        }
    }

    /// Retry `acquire` with exponential backoff and jitter until granted,
    /// the deadline passes, or `cancel` fires.
    pub async fn acquire_blocking(
        &self,
        team_id: &str,
        holder_id: &str,
        limit: u32,
        opts: &AcquireOptions,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutcome, SemaphoreError> {
        let deadline = Instant::now() + opts.deadline;
        let mut limited = false;
        let mut removed = 0i64;
        let mut attempt = 0u32;

        loop {
            let outcome = self.acquire(team_id, holder_id, limit, opts.ttl).await?;
            removed += outcome.removed;
            if outcome.granted {
                if limited {
                    debug!(team_id, holder_id, "semaphore slot granted after waiting");
                }
                return Ok(BlockingOutcome { limited, removed });
            }
            limited = true;

            let delay = backoff::delay(attempt, opts.base_delay, opts.max_delay);
            if Instant::now() + delay >= deadline {
                return Err(SemaphoreError::DeadlineExceeded(team_id.to_string()));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SemaphoreError::Cancelled(team_id.to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Extend a lease to `now + ttl` iff the holder is still a live
    /// member. Returns `false` when the lease is gone or already expired —
    /// in that case the slot is forfeit and may be held by someone else.
    pub async fn heartbeat(
        &self,
        team_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, SemaphoreError> {
        let key = codec::semaphore_key(team_id, holder_id);

        let mut trx = self.db.create_trx()?;
        loop {
            let now = now_epoch_ms();
            let renewed = match trx.get(&key, false).await? {
                None => false,
                Some(value) if decode_i64_be(&value) <= now => {
                    trx.clear(&key);
                    false
                }
                Some(_) => {
                    trx.set(&key, &encode_i64_be(now + ttl.as_millis() as i64));
                    true
                }
            };
            match trx.commit().await {
                Ok(_) => return Ok(renewed),
                Err(err) => trx = err.on_error().await?,
            }
        }
    }

    /// Remove a holder's lease.
    pub async fn release(&self, team_id: &str, holder_id: &str) -> Result<(), SemaphoreError> {
        let key = codec::semaphore_key(team_id, holder_id);
        let mut trx = self.db.create_trx()?;
        loop {
            trx.clear(&key);
            match trx.commit().await {
                Ok(_) => return Ok(()),
                Err(err) => trx = err.on_error().await?,
            }
        }
    }

    /// Acquire a slot, run `body` under a heartbeat loop at `ttl / 2`, and
    /// release on every exit path. Losing the lease mid-flight aborts the
    /// body with `LeaseLost`; cancellation aborts it with `Cancelled`.
    pub async fn with_semaphore<T, F, Fut>(
        &self,
        team_id: &str,
        holder_id: &str,
        limit: u32,
        opts: &AcquireOptions,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T, SemaphoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.bypass(limit) {
            return Ok(body().await);
        }

        self.acquire_blocking(team_id, holder_id, limit, opts, cancel)
            .await?;

        let result = {
            let heartbeat = self.heartbeat_loop(team_id, holder_id, opts.ttl);
            tokio::pin!(heartbeat);
            let body_fut = body();
            tokio::pin!(body_fut);
            tokio::select! {
                out = &mut body_fut => Ok(out),
                err = &mut heartbeat => Err(err),
                _ = cancel.cancelled() => Err(SemaphoreError::Cancelled(team_id.to_string())),
            }
        };

        if let Err(release_err) = self.release(team_id, holder_id).await {
            warn!(team_id, holder_id, error = %release_err, "failed to release semaphore slot");
        }
        result
    }

    /// Renews the lease every `ttl / 2` and resolves only on failure.
    async fn heartbeat_loop(
        &self,
        team_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> SemaphoreError {
        let period = (ttl / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; the lease was
        // just acquired, so skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.heartbeat(team_id, holder_id, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    return SemaphoreError::LeaseLost {
                        team_id: team_id.to_string(),
                        holder_id: holder_id.to_string(),
                    }
                }
                Err(err) => return err,
            }
        }
    }
}
