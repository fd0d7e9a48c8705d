//! Worker-side client for the queue service.
//!
//! Every call runs inside the fault envelope: a circuit breaker plus a
//! request timeout. Transport failures, timeouts, and server-side faults
//! count toward the breaker; while it is open, calls fail fast with
//! `ClientError::CircuitOpen` so workers back off instead of piling onto a
//! struggling store. Caller mistakes (invalid argument, not found) never
//! trip the breaker.

mod breaker;

pub use breaker::CircuitBreaker;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tonic::transport::Channel;
use tonic::{Code, Status};

use crate::pb::quarry_client::QuarryClient;
use crate::pb::*;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("queue service unavailable: circuit open")]
    CircuitOpen,
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc failed: {0}")]
    Rpc(#[from] Status),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(5),
        }
    }
}

/// Does this status indicate service trouble (counts toward the breaker)
/// rather than a caller mistake?
fn counts_toward_breaker(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Internal | Code::Unknown
    )
}

pub struct QueueClient {
    inner: QuarryClient<Channel>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl QueueClient {
    pub async fn connect(addr: String, cfg: ClientConfig) -> Result<Self, ClientError> {
        let channel = Channel::from_shared(addr)
            .map_err(|err| {
                ClientError::Rpc(Status::invalid_argument(format!("bad address: {err}")))
            })?
            .connect()
            .await?;
        Ok(Self {
            inner: QuarryClient::new(channel),
            breaker: CircuitBreaker::new(cfg.breaker_failure_threshold, cfg.breaker_cooldown),
            timeout: cfg.request_timeout,
        })
    }

    /// Run one RPC inside the fault envelope.
    async fn call<T, F, Fut>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(QuarryClient<Channel>) -> Fut,
        Fut: Future<Output = Result<tonic::Response<T>, Status>>,
    {
        self.breaker
            .preflight()
            .map_err(|_| ClientError::CircuitOpen)?;

        match tokio::time::timeout(self.timeout, f(self.inner.clone())).await {
            Ok(Ok(resp)) => {
                self.breaker.record_success();
                Ok(resp.into_inner())
            }
            Ok(Err(status)) => {
                if counts_toward_breaker(&status) {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                Err(ClientError::Rpc(status))
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }

    pub async fn push(&self, req: PushRequest) -> Result<(), ClientError> {
        self.call(|mut c| async move { c.push(req).await }).await?;
        Ok(())
    }

    pub async fn pop(
        &self,
        team_id: &str,
        worker_id: &str,
        blocked_crawl_ids: Vec<String>,
    ) -> Result<Option<ClaimedJob>, ClientError> {
        let req = PopRequest {
            team_id: team_id.to_string(),
            worker_id: worker_id.to_string(),
            blocked_crawl_ids,
        };
        let resp = self.call(|mut c| async move { c.pop(req).await }).await?;
        Ok(resp.job)
    }

    pub async fn complete(&self, queue_key: &str) -> Result<bool, ClientError> {
        let req = CompleteRequest {
            queue_key: queue_key.to_string(),
        };
        let resp = self
            .call(|mut c| async move { c.complete(req).await })
            .await?;
        Ok(resp.removed)
    }

    pub async fn release(&self, job_id: &str) -> Result<(), ClientError> {
        let req = ReleaseRequest {
            job_id: job_id.to_string(),
        };
        self.call(|mut c| async move { c.release(req).await })
            .await?;
        Ok(())
    }

    pub async fn cancel_crawl(&self, crawl_id: &str) -> Result<i64, ClientError> {
        let req = CancelCrawlRequest {
            crawl_id: crawl_id.to_string(),
        };
        let resp = self
            .call(|mut c| async move { c.cancel_crawl(req).await })
            .await?;
        Ok(resp.removed)
    }

    pub async fn queue_count(&self, scope: Scope, id: &str) -> Result<i64, ClientError> {
        let req = QueueCountRequest {
            scope: scope as i32,
            id: id.to_string(),
        };
        let resp = self
            .call(|mut c| async move { c.queue_count(req).await })
            .await?;
        Ok(resp.count)
    }

    pub async fn queued_job_ids(
        &self,
        team_id: &str,
        limit: u32,
    ) -> Result<Vec<String>, ClientError> {
        let req = QueuedJobIdsRequest {
            team_id: team_id.to_string(),
            limit,
        };
        let resp = self
            .call(|mut c| async move { c.queued_job_ids(req).await })
            .await?;
        Ok(resp.job_ids)
    }

    pub async fn push_active(
        &self,
        scope: Scope,
        id: &str,
        job_id: &str,
        ttl_ms: i64,
    ) -> Result<(), ClientError> {
        let req = PushActiveRequest {
            scope: scope as i32,
            id: id.to_string(),
            job_id: job_id.to_string(),
            ttl_ms,
        };
        self.call(|mut c| async move { c.push_active(req).await })
            .await?;
        Ok(())
    }

    pub async fn remove_active(
        &self,
        scope: Scope,
        id: &str,
        job_id: &str,
    ) -> Result<(), ClientError> {
        let req = RemoveActiveRequest {
            scope: scope as i32,
            id: id.to_string(),
            job_id: job_id.to_string(),
        };
        self.call(|mut c| async move { c.remove_active(req).await })
            .await?;
        Ok(())
    }

    pub async fn active_count(&self, scope: Scope, id: &str) -> Result<i64, ClientError> {
        let req = ActiveCountRequest {
            scope: scope as i32,
            id: id.to_string(),
        };
        let resp = self
            .call(|mut c| async move { c.active_count(req).await })
            .await?;
        Ok(resp.count)
    }

    pub async fn active_jobs(&self, scope: Scope, id: &str) -> Result<Vec<String>, ClientError> {
        let req = ActiveJobsRequest {
            scope: scope as i32,
            id: id.to_string(),
        };
        let resp = self
            .call(|mut c| async move { c.active_jobs(req).await })
            .await?;
        Ok(resp.job_ids)
    }

    pub async fn acquire_slot(
        &self,
        req: AcquireSlotRequest,
    ) -> Result<AcquireSlotResponse, ClientError> {
        self.call(|mut c| async move { c.acquire_slot(req).await })
            .await
    }

    pub async fn acquire_slot_blocking(
        &self,
        req: AcquireSlotBlockingRequest,
    ) -> Result<AcquireSlotBlockingResponse, ClientError> {
        self.call(|mut c| async move { c.acquire_slot_blocking(req).await })
            .await
    }

    pub async fn heartbeat_slot(
        &self,
        team_id: &str,
        holder_id: &str,
        ttl_ms: i64,
    ) -> Result<bool, ClientError> {
        let req = HeartbeatSlotRequest {
            team_id: team_id.to_string(),
            holder_id: holder_id.to_string(),
            ttl_ms,
        };
        let resp = self
            .call(|mut c| async move { c.heartbeat_slot(req).await })
            .await?;
        Ok(resp.renewed)
    }

    pub async fn release_slot(&self, team_id: &str, holder_id: &str) -> Result<(), ClientError> {
        let req = ReleaseSlotRequest {
            team_id: team_id.to_string(),
            holder_id: holder_id.to_string(),
        };
        self.call(|mut c| async move { c.release_slot(req).await })
            .await?;
        Ok(())
    }

    pub async fn clean_expired_jobs(&self) -> Result<i64, ClientError> {
        let resp = self
            .call(|mut c| async move { c.clean_expired_jobs(CleanupRequest {}).await })
            .await?;
        Ok(resp.removed)
    }

    pub async fn clean_expired_active(&self) -> Result<i64, ClientError> {
        let resp = self
            .call(|mut c| async move { c.clean_expired_active(CleanupRequest {}).await })
            .await?;
        Ok(resp.removed)
    }

    pub async fn clean_orphaned_claims(&self) -> Result<i64, ClientError> {
        let resp = self
            .call(|mut c| async move { c.clean_orphaned_claims(CleanupRequest {}).await })
            .await?;
        Ok(resp.removed)
    }

    pub async fn reconcile_counter(
        &self,
        scope: Scope,
        target: CounterTarget,
        id: &str,
    ) -> Result<i64, ClientError> {
        let req = ReconcileRequest {
            scope: scope as i32,
            target: target as i32,
            id: id.to_string(),
        };
        let resp = self
            .call(|mut c| async move { c.reconcile_counter(req).await })
            .await?;
        Ok(resp.correction)
    }

    pub async fn health(&self) -> Result<bool, ClientError> {
        let resp = self
            .call(|mut c| async move { c.health(HealthRequest {}).await })
            .await?;
        Ok(resp.ok)
    }
}
