//! Atomic counters and their reconciliation.
//!
//! Counters are little-endian i64 values mutated exclusively through
//! FoundationDB's atomic ADD, so concurrent pushes and pops never conflict
//! on them. The price is drift when an operation's commit outcome is
//! unknown; `reconcile_counter` repairs any counter from its ground-truth
//! range, and the janitor runs that repair continuously.

use foundationdb::options::MutationType;
use foundationdb::Transaction;
use tracing::info;

use crate::codec::{
    self, decode_counter_key, decode_i64_be, decode_i64_le, encode_i64_le, ActiveScope,
    CounterKind,
};
use crate::queue_store::{
    now_epoch_ms, read_range, QueueStore, QueueStoreError, MAX_SWEEP_BATCHES, SWEEP_BATCH_SIZE,
};

/// Cap on ground-truth scans during reconciliation.
const RECONCILE_SCAN_LIMIT: usize = 100_000;

/// Enqueue an atomic ADD on a counter inside the caller's transaction.
pub(crate) fn add_counter(trx: &Transaction, kind: CounterKind, id: &str, delta: i64) {
    trx.atomic_op(
        &codec::counter_key(kind, id),
        &encode_i64_le(delta),
        MutationType::Add,
    );
}

impl QueueStore {
    /// Read a counter, clamping negatives to zero at the API boundary.
    /// Missing keys read as zero.
    pub async fn counter(&self, kind: CounterKind, id: &str) -> Result<i64, QueueStoreError> {
        let trx = self.db.create_trx()?;
        let value = trx.get(&codec::counter_key(kind, id), false).await?;
        Ok(value.map(|v| decode_i64_le(&v).max(0)).unwrap_or(0))
    }

    /// Count the entries of a counter's ground-truth range. For active
    /// counters only non-expired records count.
    async fn ground_truth_count(
        &self,
        trx: &Transaction,
        kind: CounterKind,
        id: &str,
    ) -> Result<i64, QueueStoreError> {
        let begin = match kind {
            CounterKind::TeamQueue => codec::queue_prefix(id),
            CounterKind::CrawlQueue => codec::crawl_index_prefix(id),
            CounterKind::TeamActive => codec::active_prefix(ActiveScope::Team, id),
            CounterKind::CrawlActive => codec::active_prefix(ActiveScope::Crawl, id),
        };
        let end = codec::range_end(&begin);
        let entries = read_range(trx, &begin, &end, RECONCILE_SCAN_LIMIT, true).await?;

        let count = match kind {
            CounterKind::TeamQueue | CounterKind::CrawlQueue => entries.len() as i64,
            CounterKind::TeamActive | CounterKind::CrawlActive => {
                let now = now_epoch_ms();
                entries
                    .iter()
                    .filter(|kv| decode_i64_be(kv.value()) > now)
                    .count() as i64
            }
        };
        Ok(count)
    }

    /// Recompute a counter from its ground-truth range and, when it
    /// disagrees, set the corrected value in a follow-up transaction.
    /// Returns the correction delta (zero when already exact).
    ///
    /// The scan is a snapshot read: a mutation racing the scan leaves at
    /// most single-batch drift, which the next sweep repairs.
    pub async fn reconcile_counter(
        &self,
        kind: CounterKind,
        id: &str,
    ) -> Result<i64, QueueStoreError> {
        let counter_key = codec::counter_key(kind, id);

        let trx = self.db.create_trx()?;
        let actual = self.ground_truth_count(&trx, kind, id).await?;
        let current = trx
            .get(&counter_key, true)
            .await?
            .map(|v| decode_i64_le(&v))
            .unwrap_or(0);
        drop(trx);

        if actual == current {
            return Ok(0);
        }
        let correction = actual - current;

        let mut set_trx = self.db.create_trx()?;
        loop {
            set_trx.set(&counter_key, &encode_i64_le(actual));
            match set_trx.commit().await {
                Ok(_) => break,
                Err(err) => set_trx = err.on_error().await?,
            }
        }

        info!(
            kind = ?kind,
            id,
            previous = current,
            actual,
            correction,
            "reconciled counter"
        );
        Ok(correction)
    }

    /// Page through the ids that have a counter of the given kind,
    /// starting strictly after `after` when set. The janitor drives its
    /// reconciliation pass with this cursor.
    pub async fn sample_counter_ids(
        &self,
        kind: CounterKind,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<String>, QueueStoreError> {
        let begin = match after {
            Some(id) => codec::next_key(&codec::counter_key(kind, id)),
            None => codec::counter_prefix(kind),
        };
        let end = codec::range_end(&codec::counter_prefix(kind));

        let trx = self.db.create_trx()?;
        let entries = read_range(&trx, &begin, &end, limit, true).await?;

        let mut ids = Vec::with_capacity(entries.len());
        for kv in entries.iter() {
            let (_, id) = decode_counter_key(kv.key())?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Delete counter keys whose backing range is completely empty.
    /// Bounded per invocation; returns the number of counters removed.
    pub async fn sweep_stale_counters(&self) -> Result<i64, QueueStoreError> {
        let mut swept = 0i64;
        for kind in CounterKind::ALL {
            swept += self.sweep_stale_counters_of_kind(kind).await?;
        }
        Ok(swept)
    }

    async fn sweep_stale_counters_of_kind(
        &self,
        kind: CounterKind,
    ) -> Result<i64, QueueStoreError> {
        let mut swept = 0i64;
        let mut after: Option<String> = None;

        for _ in 0..MAX_SWEEP_BATCHES {
            let ids = self
                .sample_counter_ids(kind, SWEEP_BATCH_SIZE, after.as_deref())
                .await?;
            if ids.is_empty() {
                break;
            }

            let mut stale: Vec<Vec<u8>> = Vec::new();
            let check_trx = self.db.create_trx()?;
            for id in &ids {
                let begin = match kind {
                    CounterKind::TeamQueue => codec::queue_prefix(id),
                    CounterKind::CrawlQueue => codec::crawl_index_prefix(id),
                    CounterKind::TeamActive => codec::active_prefix(ActiveScope::Team, id),
                    CounterKind::CrawlActive => codec::active_prefix(ActiveScope::Crawl, id),
                };
                let end = codec::range_end(&begin);
                let first = read_range(&check_trx, &begin, &end, 1, true).await?;
                if first.is_empty() {
                    stale.push(codec::counter_key(kind, id));
                }
            }
            drop(check_trx);

            if !stale.is_empty() {
                let mut del_trx = self.db.create_trx()?;
                loop {
                    for key in &stale {
                        del_trx.clear(key);
                    }
                    match del_trx.commit().await {
                        Ok(_) => break,
                        Err(err) => del_trx = err.on_error().await?,
                    }
                }
                swept += stale.len() as i64;
            }

            let batch_len = ids.len();
            after = ids.into_iter().next_back();
            if batch_len < SWEEP_BATCH_SIZE {
                break;
            }
        }
        Ok(swept)
    }
}
