//! Active-job tracking for teams and crawls.
//!
//! Records currently-executing jobs with an expiry so that crashed workers
//! cannot pin a slot forever. The counter is an approximation the janitor
//! reconciles against non-expired entries.

use crate::codec::{self, decode_i64_be, encode_i64_be, ActiveScope};
use crate::queue_store::counters::add_counter;
use crate::queue_store::{now_epoch_ms, read_range, QueueStore, QueueStoreError};

/// Cap on active-job listings per scope id.
const ACTIVE_SCAN_LIMIT: usize = 10_000;

impl QueueStore {
    /// Record a job as executing under the given scope id, expiring after
    /// `ttl_ms`. Bumps the matching active counter in the same transaction.
    pub async fn push_active(
        &self,
        scope: ActiveScope,
        id: &str,
        job_id: &str,
        ttl_ms: i64,
    ) -> Result<(), QueueStoreError> {
        let key = codec::active_key(scope, id, job_id);

        let mut trx = self.db.create_trx()?;
        loop {
            let expires_at = now_epoch_ms() + ttl_ms;
            trx.set(&key, &encode_i64_be(expires_at));
            add_counter(&trx, scope.counter_kind(), id, 1);
            match trx.commit().await {
                Ok(_) => break,
                Err(err) => trx = err.on_error().await?,
            }
        }
        Ok(())
    }

    /// Drop an active record if it exists, decrementing the counter only
    /// when something was actually removed.
    pub async fn remove_active(
        &self,
        scope: ActiveScope,
        id: &str,
        job_id: &str,
    ) -> Result<(), QueueStoreError> {
        let key = codec::active_key(scope, id, job_id);

        let mut trx = self.db.create_trx()?;
        loop {
            let existing = trx.get(&key, false).await?;
            if existing.is_none() {
                break;
            }
            trx.clear(&key);
            add_counter(&trx, scope.counter_kind(), id, -1);
            match trx.commit().await {
                Ok(_) => break,
                Err(err) => trx = err.on_error().await?,
            }
        }
        Ok(())
    }

    /// Non-expired active job ids for a scope id.
    pub async fn active_jobs(
        &self,
        scope: ActiveScope,
        id: &str,
    ) -> Result<Vec<String>, QueueStoreError> {
        let now = now_epoch_ms();
        let begin = codec::active_prefix(scope, id);
        let end = codec::range_end(&begin);

        let trx = self.db.create_trx()?;
        let entries = read_range(&trx, &begin, &end, ACTIVE_SCAN_LIMIT, true).await?;

        let mut job_ids = Vec::new();
        for kv in entries.iter() {
            if decode_i64_be(kv.value()) > now {
                job_ids.push(codec::decode_active_key(scope, kv.key())?.job_id);
            }
        }
        Ok(job_ids)
    }

    /// The active counter for a scope id, clamped at zero.
    pub async fn active_count(
        &self,
        scope: ActiveScope,
        id: &str,
    ) -> Result<i64, QueueStoreError> {
        self.counter(scope.counter_kind(), id).await
    }
}
