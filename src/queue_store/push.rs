//! Job enqueue and queue listing.

use tracing::debug;

use crate::codec::{
    self, CounterKind, CrawlIndexEntry, QueueJob, TtlIndexEntry,
};
use crate::queue_store::counters::add_counter;
use crate::queue_store::{now_epoch_ms, read_range, QueueStore, QueueStoreError};

/// Upper bound on a job's TTL. Anything larger is clamped; "no timeout" is
/// expressed by omitting the timeout entirely.
const MAX_JOB_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Cap on `queued_job_ids` listings.
const QUEUED_IDS_SCAN_LIMIT: usize = 100_000;

/// A job as submitted by a worker. The queue fills in `created_at`,
/// `times_out_at`, and the crawl association at push time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub data: Vec<u8>,
    pub priority: i32,
    pub listenable: bool,
    pub listen_channel_id: Option<String>,
}

impl QueueStore {
    /// Enqueue a job. In one transaction: write the queue entry, bump the
    /// team queue counter, and maintain the TTL and crawl indexes.
    ///
    /// Jobs belonging to a crawl never receive a TTL; the crawl controls
    /// its own lifetime and removal happens through `cancel_crawl`.
    pub async fn push(
        &self,
        team_id: &str,
        job: NewJob,
        timeout_ms: Option<i64>,
        crawl_id: Option<&str>,
    ) -> Result<(), QueueStoreError> {
        let created_at = now_epoch_ms();
        let has_timeout = crawl_id.is_none() && timeout_ms.is_some_and(|t| t > 0);
        let times_out_at =
            has_timeout.then(|| created_at + timeout_ms.unwrap_or(0).min(MAX_JOB_TTL_MS));

        let record = QueueJob {
            id: job.id,
            team_id: team_id.to_string(),
            data: job.data,
            priority: job.priority,
            listenable: job.listenable,
            listen_channel_id: job.listen_channel_id,
            crawl_id: crawl_id.map(str::to_owned),
            created_at,
            times_out_at,
        };
        let value = serde_json::to_vec(&record)?;
        let queue_key = codec::queue_key(team_id, record.priority, created_at, &record.id);

        let mut trx = self.db.create_trx()?;
        loop {
            trx.set(&queue_key, &value);
            add_counter(&trx, CounterKind::TeamQueue, team_id, 1);

            if let Some(expires_at) = times_out_at {
                let entry = TtlIndexEntry {
                    priority: record.priority,
                    created_at,
                    crawl_id: None,
                };
                trx.set(
                    &codec::ttl_index_key(expires_at, team_id, &record.id),
                    &serde_json::to_vec(&entry)?,
                );
            }

            if let Some(cid) = crawl_id {
                let entry = CrawlIndexEntry {
                    team_id: team_id.to_string(),
                    priority: record.priority,
                    created_at,
                };
                trx.set(
                    &codec::crawl_index_key(cid, &record.id),
                    &serde_json::to_vec(&entry)?,
                );
                add_counter(&trx, CounterKind::CrawlQueue, cid, 1);
            }

            match trx.commit().await {
                Ok(_) => break,
                Err(err) => trx = err.on_error().await?,
            }
        }

        debug!(
            team_id,
            job_id = %record.id,
            priority = record.priority,
            crawl_id = crawl_id.unwrap_or(""),
            "pushed job"
        );
        Ok(())
    }

    /// List queued job ids for a team, in pop order, up to `limit`.
    pub async fn queued_job_ids(
        &self,
        team_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, QueueStoreError> {
        let begin = codec::queue_prefix(team_id);
        let end = codec::range_end(&begin);
        let trx = self.db.create_trx()?;
        let entries = read_range(
            &trx,
            &begin,
            &end,
            limit.min(QUEUED_IDS_SCAN_LIMIT),
            true,
        )
        .await?;

        let mut job_ids = Vec::with_capacity(entries.len());
        for kv in entries.iter() {
            job_ids.push(codec::decode_queue_key(kv.key())?.job_id);
        }
        Ok(job_ids)
    }
}
