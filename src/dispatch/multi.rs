use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dispatch::{
    validate_hostname, DequeueRequest, DispatchContext, DispatchQueue, HeartbeatRequest,
    HeartbeatResponse,
};
use crate::error::{DispatchError, Result};
use crate::scheduler::job::Job;
use crate::scheduler::rate_limit::DequeueRateLimiter;
use crate::scheduler::selector::QueueSelector;
use crate::store::HeartbeatOptions;

/// Executor protocol for a fleet polling several queues at once.
pub struct MultiQueueDispatcher {
    queues: BTreeMap<String, Arc<dyn DispatchQueue>>,
    ctx: DispatchContext,
    limiter: Arc<DequeueRateLimiter>,
    selector: Arc<dyn QueueSelector>,
}

impl MultiQueueDispatcher {
    pub fn new(
        queues: Vec<Arc<dyn DispatchQueue>>,
        ctx: DispatchContext,
        limiter: Arc<DequeueRateLimiter>,
        selector: Arc<dyn QueueSelector>,
    ) -> Self {
        let queues = queues
            .into_iter()
            .map(|q| (q.name().to_string(), q))
            .collect();
        Self {
            queues,
            ctx,
            limiter,
            selector,
        }
    }

    /// Configured queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    pub fn limiter(&self) -> &Arc<DequeueRateLimiter> {
        &self.limiter
    }

    fn queue(&self, name: &str) -> Result<&Arc<dyn DispatchQueue>> {
        self.queues
            .get(name)
            .ok_or_else(|| self.invalid_queue_names(&[name.to_string()]))
    }

    fn invalid_queue_names(&self, invalid: &[String]) -> DispatchError {
        DispatchError::InvalidQueueNames {
            invalid: invalid.join(", "),
            supported: self.queue_names().join(", "),
        }
    }

    /// Claim one job from one of the requested queues.
    pub async fn dequeue(&self, req: &DequeueRequest) -> Result<Option<Job>> {
        validate_hostname(&req.executor_name)?;
        let v2 = self.ctx.negotiate(&req.version)?;

        if req.queues.is_empty() {
            return Ok(None);
        }
        let invalid: Vec<String> = req
            .queues
            .iter()
            .filter(|q| !self.queues.contains_key(q.as_str()))
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(self.invalid_queue_names(&invalid));
        }

        let non_empty = self.select_non_empty_queues(&req.queues).await?;
        let selected = match non_empty.len() {
            0 => return Ok(None),
            1 => non_empty[0].clone(),
            _ => self.select_queue_for_dequeueing(&non_empty).await?,
        };

        let queue = self.queue(&selected)?;
        let Some(mut job) = queue
            .claim_job(&req.executor_name, &req.version, &req.resources)
            .await
            .map_err(|e| e.in_queue(&selected))?
        else {
            return Ok(None);
        };

        job.queue = selected.clone();
        job.negotiate_version(v2);
        job.token = self
            .ctx
            .issue_token(job.id, &selected, &job.repository_name)
            .await?;

        if let Err(e) = self.limiter.record_dequeue(&selected, &job.token).await {
            tracing::warn!(queue = %selected, job_id = job.id, error = %e, "Failed to record dequeue");
        }

        tracing::debug!(
            queue = %selected,
            job_id = job.id,
            executor = %req.executor_name,
            version = job.version,
            "Dequeued job"
        );
        Ok(Some(job))
    }

    /// Keep the queues that have queued work, in request order.
    pub async fn select_non_empty_queues(&self, names: &[String]) -> Result<Vec<String>> {
        let mut non_empty = Vec::with_capacity(names.len());
        for name in names {
            let count = self
                .queue(name)?
                .queued_count()
                .await
                .map_err(|e| e.in_queue(name))?;
            if count > 0 {
                non_empty.push(name.clone());
            }
        }
        Ok(non_empty)
    }

    /// Keep the queues under their dequeue limit; all of them when none is.
    pub async fn select_eligible_queues(&self, names: &[String]) -> Result<Vec<String>> {
        self.limiter.select_eligible_queues(names).await
    }

    /// Rate-limit then weight-select among queues that all have work.
    pub async fn select_queue_for_dequeueing(&self, candidates: &[String]) -> Result<String> {
        let eligible = self.select_eligible_queues(candidates).await?;
        let selected = match eligible.as_slice() {
            [only] => only.clone(),
            _ => self.selector.select(&eligible)?,
        };
        tracing::debug!(queue = %selected, ?candidates, ?eligible, "Selected queue for dequeue");
        Ok(selected)
    }

    /// Reconcile the executor's jobs across queues. Returned ids carry a
    /// `-<queue>` suffix since ids are only unique within one queue.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        validate_hostname(&req.executor_name)?;

        if req.queue_names.is_empty() {
            return Err(DispatchError::MissingHeartbeatQueueNames);
        }
        let unsupported: Vec<&str> = req
            .job_ids_by_queue
            .iter()
            .map(|g| g.queue_name.as_str())
            .filter(|q| !req.queue_names.iter().any(|n| n == q))
            .collect();
        if !unsupported.is_empty() {
            return Err(DispatchError::UnsupportedHeartbeatQueues {
                unsupported: unsupported.join(", "),
                configured: req.queue_names.join(", "),
            });
        }

        let mut executor = req.executor();
        executor.queue_names = req.queue_names.clone();
        self.ctx
            .observe_heartbeat(executor, &req.prometheus_metrics)
            .await;

        let options = HeartbeatOptions {
            worker_hostname: req.executor_name.clone(),
        };
        let mut response = HeartbeatResponse::default();
        for group in &req.job_ids_by_queue {
            let queue = self.queue(&group.queue_name)?;
            let reconciled = queue
                .heartbeat(&group.job_ids, &options)
                .await
                .map_err(|e| e.in_queue(&group.queue_name))?;

            let suffix = |id: String| format!("{id}-{}", group.queue_name);
            response
                .known_ids
                .extend(reconciled.known.into_iter().map(suffix));
            response
                .cancel_ids
                .extend(reconciled.cancel.into_iter().map(suffix));
        }

        if !response.cancel_ids.is_empty() {
            tracing::info!(
                executor = %req.executor_name,
                ids = ?response.cancel_ids,
                "Asking executor to cancel jobs"
            );
        }
        Ok(response)
    }
}
