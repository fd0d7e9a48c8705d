//! Completion, claim release, and crawl cancellation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use foundationdb::Transaction;
use tracing::{debug, info};

use crate::codec::{self, CounterKind, CrawlIndexEntry, QueueJob};
use crate::queue_store::counters::add_counter;
use crate::queue_store::{read_range, QueueStore, QueueStoreError, SWEEP_BATCH_SIZE};

/// Stage the deletes and counter decrements that retire one queue entry:
/// the entry itself, the team queue counter, and the TTL and crawl index
/// entries when present. Shared by pop commit, completion, cancellation,
/// and the TTL sweep so the index invariants stay in one place.
pub(crate) fn remove_entry_writes(trx: &Transaction, queue_key: &[u8], job: &QueueJob) {
    trx.clear(queue_key);
    add_counter(trx, CounterKind::TeamQueue, &job.team_id, -1);
    if let Some(expires_at) = job.times_out_at {
        trx.clear(&codec::ttl_index_key(expires_at, &job.team_id, &job.id));
    }
    if let Some(cid) = &job.crawl_id {
        trx.clear(&codec::crawl_index_key(cid, &job.id));
        add_counter(trx, CounterKind::CrawlQueue, cid, -1);
    }
}

impl QueueStore {
    /// Acknowledge a claimed job as done: drop its claim records, and if
    /// its queue entry somehow still exists (a claim that never committed
    /// its pop), retire the entry too.
    ///
    /// Idempotent: completing after a TTL-expiry removal, or twice, is a
    /// no-op success, so workers can always ack. Returns whether a queue
    /// entry was still present.
    pub async fn complete(&self, queue_key_b64: &str) -> Result<bool, QueueStoreError> {
        let queue_key = BASE64
            .decode(queue_key_b64)
            .map_err(|err| QueueStoreError::InvalidHandle(err.to_string()))?;
        let decoded = codec::decode_queue_key(&queue_key)
            .map_err(|err| QueueStoreError::InvalidHandle(err.to_string()))?;

        let claims_begin = codec::claims_prefix(&decoded.job_id);
        let claims_end = codec::range_end(&claims_begin);

        let mut trx = self.db.create_trx()?;
        let removed = loop {
            let entry = trx.get(&queue_key, false).await?;
            let present = match &entry {
                Some(raw) => {
                    let job: QueueJob = serde_json::from_slice(raw)?;
                    remove_entry_writes(&trx, &queue_key, &job);
                    true
                }
                None => false,
            };
            trx.clear_range(&claims_begin, &claims_end);

            match trx.commit().await {
                Ok(_) => break present,
                Err(err) => trx = err.on_error().await?,
            }
        };
        debug!(job_id = %decoded.job_id, team_id = %decoded.team_id, "completed job");
        Ok(removed)
    }

    /// Drop any outstanding claim records for a job without touching its
    /// queue entry, so another worker can re-discover it. Used when a
    /// worker wins a claim and then finds it cannot run the job.
    pub async fn release(&self, job_id: &str) -> Result<(), QueueStoreError> {
        let claims_begin = codec::claims_prefix(job_id);
        let claims_end = codec::range_end(&claims_begin);

        let mut trx = self.db.create_trx()?;
        loop {
            trx.clear_range(&claims_begin, &claims_end);
            match trx.commit().await {
                Ok(_) => break,
                Err(err) => trx = err.on_error().await?,
            }
        }
        debug!(job_id, "released job claims");
        Ok(())
    }

    /// Remove every queued job belonging to a crawl, in bounded batches so
    /// each transaction stays inside the store's limits. Returns the number
    /// of jobs removed.
    pub async fn cancel_crawl(&self, crawl_id: &str) -> Result<i64, QueueStoreError> {
        let begin = codec::crawl_index_prefix(crawl_id);
        let end = codec::range_end(&begin);
        let mut removed = 0i64;

        loop {
            let mut trx = self.db.create_trx()?;
            let batch_len = loop {
                let entries = read_range(&trx, &begin, &end, SWEEP_BATCH_SIZE, false).await?;
                if entries.is_empty() {
                    break 0;
                }
                for kv in entries.iter() {
                    let (_, job_id) = codec::decode_crawl_index_key(kv.key())?;
                    let entry: CrawlIndexEntry = serde_json::from_slice(kv.value())?;
                    trx.clear(&codec::queue_key(
                        &entry.team_id,
                        entry.priority,
                        entry.created_at,
                        &job_id,
                    ));
                    add_counter(&trx, CounterKind::TeamQueue, &entry.team_id, -1);
                    trx.clear(kv.key());
                    add_counter(&trx, CounterKind::CrawlQueue, crawl_id, -1);
                }
                let n = entries.len();
                match trx.commit().await {
                    Ok(_) => break n,
                    Err(err) => trx = err.on_error().await?,
                }
            };

            removed += batch_len as i64;
            if batch_len < SWEEP_BATCH_SIZE {
                break;
            }
        }

        if removed > 0 {
            info!(crawl_id, removed, "cancelled crawl");
        }
        Ok(removed)
    }
}
