//! The janitor: periodic expiry sweeps and counter reconciliation.
//!
//! Five independently scheduled loops, each doing bounded work per tick:
//!
//! 1. TTL sweep — expired queue entries and their counters/indexes
//! 2. Active-expiry sweep — stale team and crawl active records
//! 3. Orphan-claim sweep — claims whose queue entry is gone or too old
//! 4. Counter reconciliation — paginate counters, repair from ground truth
//! 5. Stale-counter cleanup — drop counters whose backing range is empty
//!
//! Every sweep is idempotent and safe to run concurrently across replicas;
//! each batch is its own serialized transaction, so two janitors at worst
//! waste a little work on conflicts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::CounterKind;
use crate::queue_store::{QueueStore, QueueStoreError};
use crate::settings::JanitorConfig;

/// Pages of counters visited per reconciliation tick, per kind.
const RECONCILE_MAX_PAGES: usize = 10;

/// Spawn the janitor loops; they run until `cancel` fires.
pub fn spawn(
    store: Arc<QueueStore>,
    cfg: JanitorConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(store, cfg, cancel))
}

pub async fn run(store: Arc<QueueStore>, cfg: JanitorConfig, cancel: CancellationToken) {
    let expired_jobs = sweep_loop(
        "expired_jobs",
        Duration::from_millis(cfg.expired_jobs_interval_ms),
        cancel.clone(),
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move { store.clean_expired_jobs().await }
            }
        },
    );

    let expired_active = sweep_loop(
        "expired_active_jobs",
        Duration::from_millis(cfg.expired_active_interval_ms),
        cancel.clone(),
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move { store.clean_expired_active_jobs().await }
            }
        },
    );

    let orphan_claims = sweep_loop(
        "orphaned_claims",
        Duration::from_millis(cfg.orphan_claims_interval_ms),
        cancel.clone(),
        {
            let store = store.clone();
            let age = cfg.orphan_claim_age_ms;
            move || {
                let store = store.clone();
                async move { store.clean_orphaned_claims(age).await }
            }
        },
    );

    let reconcile = sweep_loop(
        "reconcile_counters",
        Duration::from_millis(cfg.reconcile_interval_ms),
        cancel.clone(),
        {
            let store = store.clone();
            let page_size = cfg.reconcile_page_size;
            move || {
                let store = store.clone();
                async move { reconcile_pass(&store, page_size).await }
            }
        },
    );

    let stale_counters = sweep_loop(
        "stale_counters",
        Duration::from_millis(cfg.stale_counters_interval_ms),
        cancel.clone(),
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move { store.sweep_stale_counters().await }
            }
        },
    );

    tokio::join!(
        expired_jobs,
        expired_active,
        orphan_claims,
        reconcile,
        stale_counters
    );
    info!("janitor stopped");
}

async fn sweep_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<i64, QueueStoreError>>,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick would race startup; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task = name, "janitor task stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        match task().await {
            Ok(0) => {}
            Ok(n) => debug!(task = name, affected = n, "janitor sweep"),
            Err(err) => warn!(task = name, error = %err, "janitor sweep failed"),
        }
    }
}

/// One reconciliation tick: page through every counter kind's ids and
/// repair each counter from its ground-truth range. Returns the number of
/// counters that needed correction.
async fn reconcile_pass(store: &QueueStore, page_size: usize) -> Result<i64, QueueStoreError> {
    let mut corrected = 0i64;
    for kind in CounterKind::ALL {
        let mut after: Option<String> = None;
        for _ in 0..RECONCILE_MAX_PAGES {
            let ids = store
                .sample_counter_ids(kind, page_size, after.as_deref())
                .await?;
            if ids.is_empty() {
                break;
            }
            for id in &ids {
                if store.reconcile_counter(kind, id).await? != 0 {
                    corrected += 1;
                }
            }
            let page_len = ids.len();
            after = ids.into_iter().next_back();
            if page_len < page_size {
                break;
            }
        }
    }
    Ok(corrected)
}
