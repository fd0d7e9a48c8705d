use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::codec::{ActiveScope, CounterKind};
use crate::janitor;
use crate::pb::quarry_server::{Quarry, QuarryServer};
use crate::pb::*;
use crate::queue_store::{NewJob, QueueStore, QueueStoreError};
use crate::semaphore::{AcquireOptions, SemaphoreError, TenantSemaphore};
use crate::settings::AppConfig;

fn map_err(e: QueueStoreError) -> Status {
    match e {
        QueueStoreError::InvalidHandle(msg) => Status::invalid_argument(msg),
        QueueStoreError::Fdb(_) | QueueStoreError::Commit(_) => {
            Status::unavailable(e.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}

fn map_sem_err(e: SemaphoreError) -> Status {
    match e {
        SemaphoreError::DeadlineExceeded(_) => Status::deadline_exceeded(e.to_string()),
        SemaphoreError::Cancelled(_) => Status::cancelled(e.to_string()),
        SemaphoreError::Fdb(_) | SemaphoreError::Commit(_) => Status::unavailable(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[allow(clippy::result_large_err)]
fn active_scope(raw: i32) -> Result<ActiveScope, Status> {
    match Scope::try_from(raw) {
        Ok(Scope::Team) => Ok(ActiveScope::Team),
        Ok(Scope::Crawl) => Ok(ActiveScope::Crawl),
        _ => Err(Status::invalid_argument("scope required")),
    }
}

#[allow(clippy::result_large_err)]
fn counter_kind(scope: i32, target: i32) -> Result<CounterKind, Status> {
    let scope = Scope::try_from(scope)
        .map_err(|_| Status::invalid_argument("scope required"))?;
    let target = CounterTarget::try_from(target)
        .map_err(|_| Status::invalid_argument("counter target required"))?;
    match (scope, target) {
        (Scope::Team, CounterTarget::Queue) => Ok(CounterKind::TeamQueue),
        (Scope::Crawl, CounterTarget::Queue) => Ok(CounterKind::CrawlQueue),
        (Scope::Team, CounterTarget::Active) => Ok(CounterKind::TeamActive),
        (Scope::Crawl, CounterTarget::Active) => Ok(CounterKind::CrawlActive),
        _ => Err(Status::invalid_argument("scope and counter target required")),
    }
}

fn ms_or(default: Duration, ms: i64) -> Duration {
    if ms > 0 {
        Duration::from_millis(ms as u64)
    } else {
        default
    }
}

/// gRPC service implementation backed by the queue store and the tenant
/// semaphore.
#[derive(Clone)]
pub struct QuarryService {
    store: Arc<QueueStore>,
    semaphore: Arc<TenantSemaphore>,
    janitor_cfg: crate::settings::JanitorConfig,
}

impl QuarryService {
    pub fn new(
        store: Arc<QueueStore>,
        semaphore: Arc<TenantSemaphore>,
        janitor_cfg: crate::settings::JanitorConfig,
    ) -> Self {
        Self {
            store,
            semaphore,
            janitor_cfg,
        }
    }
}

#[tonic::async_trait]
impl Quarry for QuarryService {
    async fn push(&self, req: Request<PushRequest>) -> Result<Response<PushResponse>, Status> {
        let r = req.into_inner();
        if r.team_id.is_empty() {
            return Err(Status::invalid_argument("team_id required"));
        }
        if r.job_id.is_empty() {
            return Err(Status::invalid_argument("job_id required"));
        }
        let job = NewJob {
            id: r.job_id,
            data: r.data,
            priority: r.priority,
            listenable: r.listenable,
            listen_channel_id: r.listen_channel_id,
        };
        let timeout_ms = (r.timeout_ms > 0).then_some(r.timeout_ms);
        self.store
            .push(&r.team_id, job, timeout_ms, r.crawl_id.as_deref())
            .await
            .map_err(map_err)?;
        Ok(Response::new(PushResponse {}))
    }

    async fn pop(&self, req: Request<PopRequest>) -> Result<Response<PopResponse>, Status> {
        let r = req.into_inner();
        if r.team_id.is_empty() {
            return Err(Status::invalid_argument("team_id required"));
        }
        if r.worker_id.is_empty() {
            return Err(Status::invalid_argument("worker_id required"));
        }
        let blocked: HashSet<String> = r.blocked_crawl_ids.into_iter().collect();
        let claimed = self
            .store
            .pop(&r.team_id, &r.worker_id, &blocked, None)
            .await
            .map_err(map_err)?;

        let job = claimed.map(|c| ClaimedJob {
            queue_key: c.queue_key,
            job_id: c.job.id,
            team_id: c.job.team_id,
            data: c.job.data,
            priority: c.job.priority,
            listenable: c.job.listenable,
            listen_channel_id: c.job.listen_channel_id,
            crawl_id: c.job.crawl_id,
            created_at: c.job.created_at,
            times_out_at: c.job.times_out_at,
        });
        Ok(Response::new(PopResponse { job }))
    }

    async fn complete(
        &self,
        req: Request<CompleteRequest>,
    ) -> Result<Response<CompleteResponse>, Status> {
        let r = req.into_inner();
        let removed = self.store.complete(&r.queue_key).await.map_err(map_err)?;
        Ok(Response::new(CompleteResponse { removed }))
    }

    async fn release(
        &self,
        req: Request<ReleaseRequest>,
    ) -> Result<Response<ReleaseResponse>, Status> {
        let r = req.into_inner();
        self.store.release(&r.job_id).await.map_err(map_err)?;
        Ok(Response::new(ReleaseResponse {}))
    }

    async fn cancel_crawl(
        &self,
        req: Request<CancelCrawlRequest>,
    ) -> Result<Response<CancelCrawlResponse>, Status> {
        let r = req.into_inner();
        let removed = self
            .store
            .cancel_crawl(&r.crawl_id)
            .await
            .map_err(map_err)?;
        Ok(Response::new(CancelCrawlResponse { removed }))
    }

    async fn queue_count(
        &self,
        req: Request<QueueCountRequest>,
    ) -> Result<Response<CountResponse>, Status> {
        let r = req.into_inner();
        let kind = match active_scope(r.scope)? {
            ActiveScope::Team => CounterKind::TeamQueue,
            ActiveScope::Crawl => CounterKind::CrawlQueue,
        };
        let count = self.store.counter(kind, &r.id).await.map_err(map_err)?;
        Ok(Response::new(CountResponse { count }))
    }

    async fn queued_job_ids(
        &self,
        req: Request<QueuedJobIdsRequest>,
    ) -> Result<Response<QueuedJobIdsResponse>, Status> {
        let r = req.into_inner();
        let job_ids = self
            .store
            .queued_job_ids(&r.team_id, r.limit as usize)
            .await
            .map_err(map_err)?;
        Ok(Response::new(QueuedJobIdsResponse { job_ids }))
    }

    async fn push_active(
        &self,
        req: Request<PushActiveRequest>,
    ) -> Result<Response<PushActiveResponse>, Status> {
        let r = req.into_inner();
        let scope = active_scope(r.scope)?;
        self.store
            .push_active(scope, &r.id, &r.job_id, r.ttl_ms)
            .await
            .map_err(map_err)?;
        Ok(Response::new(PushActiveResponse {}))
    }

    async fn remove_active(
        &self,
        req: Request<RemoveActiveRequest>,
    ) -> Result<Response<RemoveActiveResponse>, Status> {
        let r = req.into_inner();
        let scope = active_scope(r.scope)?;
        self.store
            .remove_active(scope, &r.id, &r.job_id)
            .await
            .map_err(map_err)?;
        Ok(Response::new(RemoveActiveResponse {}))
    }

    async fn active_count(
        &self,
        req: Request<ActiveCountRequest>,
    ) -> Result<Response<CountResponse>, Status> {
        let r = req.into_inner();
        let scope = active_scope(r.scope)?;
        let count = self
            .store
            .active_count(scope, &r.id)
            .await
            .map_err(map_err)?;
        Ok(Response::new(CountResponse { count }))
    }

    async fn active_jobs(
        &self,
        req: Request<ActiveJobsRequest>,
    ) -> Result<Response<ActiveJobsResponse>, Status> {
        let r = req.into_inner();
        let scope = active_scope(r.scope)?;
        let job_ids = self
            .store
            .active_jobs(scope, &r.id)
            .await
            .map_err(map_err)?;
        Ok(Response::new(ActiveJobsResponse { job_ids }))
    }

    async fn clean_expired_jobs(
        &self,
        _req: Request<CleanupRequest>,
    ) -> Result<Response<CleanupResponse>, Status> {
        let removed = self.store.clean_expired_jobs().await.map_err(map_err)?;
        Ok(Response::new(CleanupResponse { removed }))
    }

    async fn clean_expired_active(
        &self,
        _req: Request<CleanupRequest>,
    ) -> Result<Response<CleanupResponse>, Status> {
        let removed = self
            .store
            .clean_expired_active_jobs()
            .await
            .map_err(map_err)?;
        Ok(Response::new(CleanupResponse { removed }))
    }

    async fn clean_orphaned_claims(
        &self,
        _req: Request<CleanupRequest>,
    ) -> Result<Response<CleanupResponse>, Status> {
        let age = self.janitor_cfg.orphan_claim_age_ms;
        let removed = self
            .store
            .clean_orphaned_claims(age)
            .await
            .map_err(map_err)?;
        Ok(Response::new(CleanupResponse { removed }))
    }

    async fn reconcile_counter(
        &self,
        req: Request<ReconcileRequest>,
    ) -> Result<Response<ReconcileResponse>, Status> {
        let r = req.into_inner();
        let kind = counter_kind(r.scope, r.target)?;
        let correction = self
            .store
            .reconcile_counter(kind, &r.id)
            .await
            .map_err(map_err)?;
        Ok(Response::new(ReconcileResponse { correction }))
    }

    async fn acquire_slot(
        &self,
        req: Request<AcquireSlotRequest>,
    ) -> Result<Response<AcquireSlotResponse>, Status> {
        let r = req.into_inner();
        let ttl = ms_or(AcquireOptions::default().ttl, r.ttl_ms);
        let outcome = self
            .semaphore
            .acquire(&r.team_id, &r.holder_id, r.limit, ttl)
            .await
            .map_err(map_sem_err)?;
        Ok(Response::new(AcquireSlotResponse {
            granted: outcome.granted,
            holders: outcome.holders,
            removed: outcome.removed,
        }))
    }

    async fn acquire_slot_blocking(
        &self,
        req: Request<AcquireSlotBlockingRequest>,
    ) -> Result<Response<AcquireSlotBlockingResponse>, Status> {
        let r = req.into_inner();
        let defaults = AcquireOptions::default();
        let opts = AcquireOptions {
            ttl: ms_or(defaults.ttl, r.ttl_ms),
            base_delay: ms_or(defaults.base_delay, r.base_delay_ms),
            max_delay: ms_or(defaults.max_delay, r.max_delay_ms),
            deadline: ms_or(defaults.deadline, r.deadline_ms),
        };
        // Client disconnects cancel the request future, which is the only
        // cancel signal a unary RPC carries.
        let cancel = CancellationToken::new();
        let outcome = self
            .semaphore
            .acquire_blocking(&r.team_id, &r.holder_id, r.limit, &opts, &cancel)
            .await
            .map_err(map_sem_err)?;
        Ok(Response::new(AcquireSlotBlockingResponse {
            limited: outcome.limited,
            removed: outcome.removed,
        }))
    }

    async fn heartbeat_slot(
        &self,
        req: Request<HeartbeatSlotRequest>,
    ) -> Result<Response<HeartbeatSlotResponse>, Status> {
        let r = req.into_inner();
        let ttl = ms_or(AcquireOptions::default().ttl, r.ttl_ms);
        let renewed = self
            .semaphore
            .heartbeat(&r.team_id, &r.holder_id, ttl)
            .await
            .map_err(map_sem_err)?;
        Ok(Response::new(HeartbeatSlotResponse { renewed }))
    }

    async fn release_slot(
        &self,
        req: Request<ReleaseSlotRequest>,
    ) -> Result<Response<ReleaseSlotResponse>, Status> {
        let r = req.into_inner();
        self.semaphore
            .release(&r.team_id, &r.holder_id)
            .await
            .map_err(map_sem_err)?;
        Ok(Response::new(ReleaseSlotResponse {}))
    }

    async fn health(
        &self,
        _req: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let ok = self.store.health_check().await.map_err(map_err)?;
        Ok(Response::new(HealthResponse { ok }))
    }
}

/// Serve gRPC on a pre-bound listener with the janitor loops running
/// alongside, shutting both down gracefully on the shutdown signal.
pub async fn run_grpc_with_janitor(
    listener: TcpListener,
    store: Arc<QueueStore>,
    semaphore: Arc<TenantSemaphore>,
    cfg: AppConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let svc = QuarryService::new(store.clone(), semaphore, cfg.janitor.clone());
    let server = QuarryServer::new(svc);

    let janitor_cancel = CancellationToken::new();
    let janitor_handle = cfg
        .janitor
        .enabled
        .then(|| janitor::spawn(store.clone(), cfg.janitor.clone(), janitor_cancel.clone()));

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "server started and listening");

    let incoming = TcpListenerStream::new(listener);
    let cancel_on_shutdown = janitor_cancel.clone();
    let serve = tonic::transport::Server::builder()
        .add_service(server)
        .serve_with_incoming_shutdown(incoming, async move {
            let _ = shutdown.recv().await;
            info!("graceful shutdown signal received");
            cancel_on_shutdown.cancel();
        });

    serve.await?;
    info!("all connections drained, shutting down services");
    janitor_cancel.cancel();
    if let Some(handle) = janitor_handle {
        handle.await.ok();
    }
    Ok(())
}
