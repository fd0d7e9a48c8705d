//! Janitor sweeps: TTL expiry, active-record expiry, and orphaned claims.
//!
//! Each sweep does bounded work per invocation (at most
//! `MAX_SWEEP_BATCHES` batches of `SWEEP_BATCH_SIZE`), is idempotent, and
//! is safe to run concurrently across replicas — every batch is its own
//! independently serialized transaction.

use tracing::info;

use crate::codec::{self, decode_i64_be, ActiveScope, ClaimRecord, CounterKind, TtlIndexEntry};
use crate::queue_store::counters::add_counter;
use crate::queue_store::{
    now_epoch_ms, read_range, QueueStore, QueueStoreError, MAX_SWEEP_BATCHES, SWEEP_BATCH_SIZE,
};

impl QueueStore {
    /// Sweep the TTL index from its minimum up to `now`, removing each
    /// expired job's queue entry, counters, and index entries. Returns the
    /// number of jobs removed.
    pub async fn clean_expired_jobs(&self) -> Result<i64, QueueStoreError> {
        let mut cleaned = 0i64;

        for _ in 0..MAX_SWEEP_BATCHES {
            let (begin, end) = codec::ttl_index_range_until(now_epoch_ms());

            let mut trx = self.db.create_trx()?;
            let batch_len = loop {
                let entries = read_range(&trx, &begin, &end, SWEEP_BATCH_SIZE, false).await?;
                if entries.is_empty() {
                    break 0;
                }
                for kv in entries.iter() {
                    let ttl_key = codec::decode_ttl_index_key(kv.key())?;
                    let entry: TtlIndexEntry = serde_json::from_slice(kv.value())?;

                    trx.clear(&codec::queue_key(
                        &ttl_key.team_id,
                        entry.priority,
                        entry.created_at,
                        &ttl_key.job_id,
                    ));
                    add_counter(&trx, CounterKind::TeamQueue, &ttl_key.team_id, -1);
                    if let Some(cid) = &entry.crawl_id {
                        trx.clear(&codec::crawl_index_key(cid, &ttl_key.job_id));
                        add_counter(&trx, CounterKind::CrawlQueue, cid, -1);
                    }
                    trx.clear(kv.key());
                }
                let n = entries.len();
                match trx.commit().await {
                    Ok(_) => break n,
                    Err(err) => trx = err.on_error().await?,
                }
            };

            cleaned += batch_len as i64;
            if batch_len < SWEEP_BATCH_SIZE {
                break;
            }
        }

        if cleaned > 0 {
            info!(cleaned, "cleaned expired jobs");
        }
        Ok(cleaned)
    }

    /// Delete expired active records for both scopes, decrementing the
    /// matching counters. Returns the number of records removed.
    pub async fn clean_expired_active_jobs(&self) -> Result<i64, QueueStoreError> {
        let mut cleaned = 0i64;
        for scope in [ActiveScope::Team, ActiveScope::Crawl] {
            cleaned += self.sweep_expired_active_scope(scope).await?;
        }
        if cleaned > 0 {
            info!(cleaned, "cleaned expired active jobs");
        }
        Ok(cleaned)
    }

    /// Walk one active subspace with a cursor — live records stay put, so
    /// restarting at the subspace head would re-read them forever.
    async fn sweep_expired_active_scope(
        &self,
        scope: ActiveScope,
    ) -> Result<i64, QueueStoreError> {
        let subspace = codec::active_subspace(scope);
        let end = codec::range_end(&subspace);
        let mut cursor = subspace;
        let mut cleaned = 0i64;

        for _ in 0..MAX_SWEEP_BATCHES {
            let now = now_epoch_ms();

            let mut trx = self.db.create_trx()?;
            let (batch_len, expired, last_key) = loop {
                let entries = read_range(&trx, &cursor, &end, SWEEP_BATCH_SIZE, false).await?;
                if entries.is_empty() {
                    break (0, 0i64, None);
                }
                let mut expired = 0i64;
                for kv in entries.iter() {
                    if decode_i64_be(kv.value()) < now {
                        let active_key = codec::decode_active_key(scope, kv.key())?;
                        trx.clear(kv.key());
                        add_counter(&trx, scope.counter_kind(), &active_key.id, -1);
                        expired += 1;
                    }
                }
                let n = entries.len();
                let last = entries.iter().last().map(|kv| kv.key().to_vec());
                match trx.commit().await {
                    Ok(_) => break (n, expired, last),
                    Err(err) => trx = err.on_error().await?,
                }
            };

            cleaned += expired;
            if batch_len < SWEEP_BATCH_SIZE {
                break;
            }
            match last_key {
                Some(key) => cursor = codec::next_key(&key),
                None => break,
            }
        }
        Ok(cleaned)
    }

    /// Remove claim records whose queue entry no longer exists (completed,
    /// TTL-expired, or cancelled) or that are older than `orphan_age_ms`.
    /// Returns the number of claims removed.
    pub async fn clean_orphaned_claims(
        &self,
        orphan_age_ms: i64,
    ) -> Result<i64, QueueStoreError> {
        let (subspace_begin, end) = codec::claims_subspace_range();
        let mut cursor = subspace_begin;
        let mut cleaned = 0i64;

        for _ in 0..MAX_SWEEP_BATCHES {
            let now = now_epoch_ms();

            let trx = self.db.create_trx()?;
            let entries = read_range(&trx, &cursor, &end, SWEEP_BATCH_SIZE, true).await?;
            if entries.is_empty() {
                break;
            }

            let mut orphans: Vec<Vec<u8>> = Vec::new();
            for kv in entries.iter() {
                let orphaned = match serde_json::from_slice::<ClaimRecord>(kv.value()) {
                    Ok(record) => {
                        record.claimed_at + orphan_age_ms < now
                            || trx.get(&record.queue_key, true).await?.is_none()
                    }
                    // A claim whose value cannot be decoded can never be
                    // matched to an entry again.
                    Err(_) => true,
                };
                if orphaned {
                    orphans.push(kv.key().to_vec());
                }
            }

            let batch_len = entries.len();
            let last_key = entries.iter().last().map(|kv| kv.key().to_vec());
            drop(trx);

            if !orphans.is_empty() {
                let mut del_trx = self.db.create_trx()?;
                loop {
                    for key in &orphans {
                        del_trx.clear(key);
                    }
                    match del_trx.commit().await {
                        Ok(_) => break,
                        Err(err) => del_trx = err.on_error().await?,
                    }
                }
                cleaned += orphans.len() as i64;
            }

            if batch_len < SWEEP_BATCH_SIZE {
                break;
            }
            match last_key {
                Some(key) => cursor = codec::next_key(&key),
                None => break,
            }
        }

        if cleaned > 0 {
            info!(cleaned, "cleaned orphaned claims");
        }
        Ok(cleaned)
    }
}
