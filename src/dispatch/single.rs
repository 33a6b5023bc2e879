use crate::dispatch::{
    validate_hostname, AddExecutionLogEntryRequest, DequeueRequest, DispatchContext,
    HeartbeatRequest, HeartbeatResponse, MarkCompleteRequest, MarkErroredRequest, QueueHandler,
    UpdateExecutionLogEntryRequest,
};
use crate::error::{DispatchError, Result, StoreError};
use crate::scheduler::job::{Job, Record};
use crate::store::{ExecutionLogEntryOptions, HeartbeatOptions, MarkFinalOptions};

/// Executor protocol for a single named queue.
pub struct SingleQueueDispatcher<R: Record> {
    queue: QueueHandler<R>,
    ctx: DispatchContext,
}

fn log_entry_error(context: &str, e: StoreError) -> DispatchError {
    match e {
        StoreError::LogEntryNotUpdated => DispatchError::UnknownJob,
        other => DispatchError::store(context, other),
    }
}

enum Outcome {
    Completed,
    Errored,
    Failed,
}

impl<R: Record> SingleQueueDispatcher<R> {
    pub fn new(queue: QueueHandler<R>, ctx: DispatchContext) -> Self {
        Self { queue, ctx }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn queue(&self) -> &QueueHandler<R> {
        &self.queue
    }

    /// Claim, transform and tokenize one job. `Ok(None)` when the queue has
    /// nothing to hand out.
    pub async fn dequeue(&self, req: &DequeueRequest) -> Result<Option<Job>> {
        validate_hostname(&req.executor_name)?;
        let v2 = self.ctx.negotiate(&req.version)?;

        let Some(mut job) = self
            .queue
            .claim(&req.executor_name, &req.version, &req.resources)
            .await?
        else {
            return Ok(None);
        };

        job.negotiate_version(v2);
        // A claimed record whose token cannot be issued stays claimed; the
        // store's stalled-record reset returns it to the queue.
        job.token = self
            .ctx
            .issue_token(job.id, &self.queue.name, &job.repository_name)
            .await?;

        tracing::debug!(
            queue = %self.queue.name,
            job_id = job.id,
            executor = %req.executor_name,
            version = job.version,
            "Dequeued job"
        );
        Ok(Some(job))
    }

    pub async fn add_execution_log_entry(&self, req: &AddExecutionLogEntryRequest) -> Result<i64> {
        validate_hostname(&req.executor_name)?;

        self.queue
            .store
            .add_execution_log_entry(
                req.job_id,
                req.entry.clone(),
                &ExecutionLogEntryOptions::processing(&req.executor_name),
            )
            .await
            .map_err(|e| log_entry_error("store.addExecutionLogEntry", e))
    }

    pub async fn update_execution_log_entry(
        &self,
        req: &UpdateExecutionLogEntryRequest,
    ) -> Result<()> {
        validate_hostname(&req.executor_name)?;

        self.queue
            .store
            .update_execution_log_entry(
                req.job_id,
                req.entry_id,
                req.entry.clone(),
                &ExecutionLogEntryOptions::processing(&req.executor_name),
            )
            .await
            .map_err(|e| log_entry_error("store.updateExecutionLogEntry", e))
    }

    pub async fn mark_complete(&self, req: &MarkCompleteRequest) -> Result<()> {
        self.finalize(req.job_id, &req.executor_name, Outcome::Completed, "")
            .await
    }

    pub async fn mark_errored(&self, req: &MarkErroredRequest) -> Result<()> {
        self.finalize(req.job_id, &req.executor_name, Outcome::Errored, &req.error_message)
            .await
    }

    pub async fn mark_failed(&self, req: &MarkErroredRequest) -> Result<()> {
        self.finalize(req.job_id, &req.executor_name, Outcome::Failed, &req.error_message)
            .await
    }

    /// Move an owned record to a terminal state and drop its token. A record
    /// the caller does not own is reported as unknown and its token is kept.
    async fn finalize(
        &self,
        job_id: i64,
        executor_name: &str,
        outcome: Outcome,
        error_message: &str,
    ) -> Result<()> {
        validate_hostname(executor_name)?;

        let options = MarkFinalOptions::owned_by(executor_name);
        let store = &self.queue.store;

        let (context, result) = match outcome {
            Outcome::Completed => ("store.markComplete", store.mark_complete(job_id, &options).await),
            Outcome::Errored => (
                "store.markErrored",
                store.mark_errored(job_id, error_message, &options).await,
            ),
            Outcome::Failed => (
                "store.markFailed",
                store.mark_failed(job_id, error_message, &options).await,
            ),
        };

        let found = result.map_err(|e| DispatchError::store(context, e))?;
        if !found {
            tracing::debug!(
                queue = %self.queue.name,
                job_id,
                executor = %executor_name,
                "Finalize matched no owned record"
            );
            return Err(DispatchError::UnknownJob);
        }

        self.ctx.delete_token(job_id, &self.queue.name).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        validate_hostname(&req.executor_name)?;

        let mut executor = req.executor();
        executor.queue_name = self.queue.name.clone();
        self.ctx
            .observe_heartbeat(executor, &req.prometheus_metrics)
            .await;

        let reconciled = self
            .queue
            .store
            .heartbeat(
                &req.job_ids,
                &HeartbeatOptions {
                    worker_hostname: req.executor_name.clone(),
                },
            )
            .await
            .map_err(|e| DispatchError::store("store.heartbeat", e))?;

        if !reconciled.cancel.is_empty() {
            tracing::info!(
                queue = %self.queue.name,
                executor = %req.executor_name,
                ids = ?reconciled.cancel,
                "Asking executor to cancel jobs"
            );
        }

        Ok(HeartbeatResponse {
            known_ids: reconciled.known,
            cancel_ids: reconciled.cancel,
        })
    }
}
