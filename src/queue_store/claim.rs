//! The pop protocol.
//!
//! Candidate discovery is a snapshot scan that establishes no read
//! conflicts, so any number of workers can pop against the same team
//! without serializing on each other. Winner selection rides on
//! versionstamped claim keys: every contender's claim write lands on a
//! distinct pre-commit key (the worker id follows the placeholder), so
//! claim writes cannot conflict, and the store's commit order decides the
//! winner — the claim with the minimal versionstamp. The losing side simply
//! moves on to the next candidate.

use std::collections::HashSet;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use foundationdb::options::MutationType;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff;
use crate::codec::{self, ClaimRecord, QueueJob};
use crate::queue_store::remove::remove_entry_writes;
use crate::queue_store::{now_epoch_ms, read_range, QueueStore, QueueStoreError};

/// How many candidates one discovery scan pulls.
const CANDIDATE_SCAN_LIMIT: usize = 50;

/// Backoff between contended passes.
const POP_BACKOFF_BASE: Duration = Duration::from_millis(50);
const POP_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Ceiling on full discover/claim passes before reporting "none available".
/// Callers treat exhaustion as a transient condition, not an error.
const POP_ATTEMPT_LIMIT: u32 = 100;

/// Cap when enumerating one job's claim records; contenders peek before
/// writing, so real fan-out stays tiny.
const CLAIM_RANGE_LIMIT: usize = 1_000;

/// A job claimed by exactly one worker. The `queue_key` is the opaque
/// handle to hand back to `complete`.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: QueueJob,
    pub queue_key: String,
}

enum PopAttempt {
    Claimed(Box<ClaimedJob>),
    /// Discovery found nothing at all for the team.
    Empty,
    /// Candidates existed but every claim was lost, blocked, or expired.
    Contended,
}

impl QueueStore {
    /// Pop the next available job for a team, or `None` when nothing is
    /// claimable. At most one worker observes any given job as claimed.
    ///
    /// `blocked_crawl_ids` vetoes candidates whose crawl has reached its
    /// concurrency cap, as judged by the caller's external state. An
    /// optional `deadline` bounds the retry loop; crossing it reports
    /// "none available" like attempt exhaustion does.
    pub async fn pop(
        &self,
        team_id: &str,
        worker_id: &str,
        blocked_crawl_ids: &HashSet<String>,
        deadline: Option<Instant>,
    ) -> Result<Option<ClaimedJob>, QueueStoreError> {
        for attempt in 0..POP_ATTEMPT_LIMIT {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            match self
                .try_pop_once(team_id, worker_id, blocked_crawl_ids)
                .await?
            {
                PopAttempt::Claimed(claimed) => return Ok(Some(*claimed)),
                PopAttempt::Empty => return Ok(None),
                PopAttempt::Contended => {
                    tokio::time::sleep(backoff::delay(attempt, POP_BACKOFF_BASE, POP_BACKOFF_CAP))
                        .await;
                }
            }
        }
        debug!(team_id, worker_id, "pop attempt budget exhausted");
        Ok(None)
    }

    /// One discover → filter → claim → arbitrate → commit pass.
    async fn try_pop_once(
        &self,
        team_id: &str,
        worker_id: &str,
        blocked_crawl_ids: &HashSet<String>,
    ) -> Result<PopAttempt, QueueStoreError> {
        let now = now_epoch_ms();

        // Discover: snapshot scan, no read conflict ranges.
        let begin = codec::queue_prefix(team_id);
        let end = codec::range_end(&begin);
        let scan_trx = self.db.create_trx()?;
        let entries = read_range(&scan_trx, &begin, &end, CANDIDATE_SCAN_LIMIT, true).await?;
        if entries.is_empty() {
            return Ok(PopAttempt::Empty);
        }

        // Filter out of transaction: expired jobs go to opportunistic
        // cleanup, blocked crawls are skipped outright.
        let mut candidates: Vec<(Vec<u8>, QueueJob)> = Vec::new();
        let mut expired: Vec<(Vec<u8>, QueueJob)> = Vec::new();
        for kv in entries.iter() {
            let job: QueueJob = match serde_json::from_slice(kv.value()) {
                Ok(job) => job,
                Err(err) => {
                    warn!(team_id, error = %err, "skipping undecodable queue entry");
                    continue;
                }
            };
            if job.times_out_at.is_some_and(|t| t < now) {
                expired.push((kv.key().to_vec(), job));
                continue;
            }
            if job
                .crawl_id
                .as_ref()
                .is_some_and(|cid| blocked_crawl_ids.contains(cid))
            {
                continue;
            }
            candidates.push((kv.key().to_vec(), job));
        }
        drop(scan_trx);

        for (queue_key, job) in candidates {
            let claims_begin = codec::claims_prefix(&job.id);
            let claims_end = codec::range_end(&claims_begin);

            // Cheap skip: a job that already has claims is being contested;
            // losing that race later is handled anyway, but not entering it
            // saves a versionstamp write.
            let peek_trx = self.db.create_trx()?;
            let contested = !read_range(&peek_trx, &claims_begin, &claims_end, 1, true)
                .await?
                .is_empty();
            drop(peek_trx);
            if contested {
                continue;
            }

            // Claim attempt: confirm the entry still exists (read conflict
            // on that single key only), then blind-write our claim with a
            // store-assigned versionstamp.
            let claim_trx = self.db.create_trx()?;
            if claim_trx.get(&queue_key, false).await?.is_none() {
                continue;
            }
            let record = ClaimRecord {
                worker_id: worker_id.to_string(),
                queue_key: queue_key.clone(),
                claimed_at: now,
            };
            claim_trx.atomic_op(
                &codec::claim_key(&job.id, worker_id),
                &serde_json::to_vec(&record)?,
                MutationType::SetVersionstampedKey,
            );
            match claim_trx.commit().await {
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    debug!(job_id = %job.id, "claim commit conflicted, candidate lost");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            // Arbitrate: claims sort by versionstamp, so the first record
            // in the range is the winner.
            let arb_trx = self.db.create_trx()?;
            let claims = read_range(&arb_trx, &claims_begin, &claims_end, 1, true).await?;
            let Some(first) = claims.iter().next() else {
                continue;
            };
            let winner: ClaimRecord = serde_json::from_slice(first.value())?;
            drop(arb_trx);
            if winner.worker_id != worker_id {
                debug!(
                    job_id = %job.id,
                    winner = %winner.worker_id,
                    "lost claim arbitration"
                );
                continue;
            }

            // Commit the pop: re-verify the entry, remove it with its
            // counters and indexes, and drop the losers' claim records.
            // Our own claim survives as the record of who is executing the
            // job; `complete` clears it, or the orphan sweep does if we
            // crash. Expired candidates noted above ride along in the same
            // transaction to amortize cleanup.
            let mut commit_trx = self.db.create_trx()?;
            let removed = loop {
                let Some(raw) = commit_trx.get(&queue_key, false).await? else {
                    break None;
                };
                let current: QueueJob = serde_json::from_slice(&raw)?;
                remove_entry_writes(&commit_trx, &queue_key, &current);
                let claims =
                    read_range(&commit_trx, &claims_begin, &claims_end, CLAIM_RANGE_LIMIT, false)
                        .await?;
                for kv in claims.iter() {
                    if codec::decode_claim_key(kv.key())?.worker_id != worker_id {
                        commit_trx.clear(kv.key());
                    }
                }
                for (expired_key, expired_job) in &expired {
                    // Snapshot check so concurrent poppers staging the same
                    // expired entries don't stack blind decrements.
                    if commit_trx.get(expired_key, true).await?.is_some() {
                        remove_entry_writes(&commit_trx, expired_key, expired_job);
                    }
                }
                match commit_trx.commit().await {
                    Ok(_) => break Some(current),
                    Err(err) => commit_trx = err.on_error().await?,
                }
            };

            match removed {
                Some(current) => {
                    debug!(job_id = %current.id, team_id, worker_id, "claimed job");
                    return Ok(PopAttempt::Claimed(Box::new(ClaimedJob {
                        queue_key: BASE64.encode(&queue_key),
                        job: current,
                    })));
                }
                // Swept away between arbitration and commit; treat as lost.
                None => continue,
            }
        }

        // Nothing won this pass; still fold in the expired cleanup.
        self.sweep_expired_candidates(&expired).await;
        Ok(PopAttempt::Contended)
    }

    /// Best-effort removal of expired entries noticed during discovery.
    /// The TTL sweep remains the authority; failures here are ignored.
    async fn sweep_expired_candidates(&self, expired: &[(Vec<u8>, QueueJob)]) {
        if expired.is_empty() {
            return;
        }
        let Ok(trx) = self.db.create_trx() else {
            return;
        };
        for (key, job) in expired {
            match trx.get(key, true).await {
                Ok(Some(_)) => remove_entry_writes(&trx, key, job),
                Ok(None) => {}
                Err(_) => return,
            }
        }
        if let Err(err) = trx.commit().await {
            debug!(error = %err, "opportunistic expired-job cleanup failed");
        }
    }
}
