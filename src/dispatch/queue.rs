use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, Record, ResourceMetadata};
use crate::store::{HeartbeatOptions, MarkFinalOptions, QueueStore, Reconciled};

/// Turns a claimed record into the job payload handed to the executor.
#[async_trait]
pub trait RecordTransformer<R: Record>: Send + Sync {
    async fn transform(
        &self,
        version: &str,
        record: &R,
        resources: &ResourceMetadata,
    ) -> anyhow::Result<Job>;
}

struct FnTransformer<F>(F);

#[async_trait]
impl<R, F> RecordTransformer<R> for FnTransformer<F>
where
    R: Record,
    F: Fn(&str, &R, &ResourceMetadata) -> anyhow::Result<Job> + Send + Sync,
{
    async fn transform(
        &self,
        version: &str,
        record: &R,
        resources: &ResourceMetadata,
    ) -> anyhow::Result<Job> {
        (self.0)(version, record, resources)
    }
}

/// One named queue: its store and the transform for its record type.
pub struct QueueHandler<R: Record> {
    pub name: String,
    pub store: Arc<dyn QueueStore<R>>,
    pub transformer: Arc<dyn RecordTransformer<R>>,
}

impl<R: Record> Clone for QueueHandler<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
            transformer: self.transformer.clone(),
        }
    }
}

impl<R: Record> QueueHandler<R> {
    pub fn new<F>(name: impl Into<String>, store: Arc<dyn QueueStore<R>>, transform: F) -> Self
    where
        F: Fn(&str, &R, &ResourceMetadata) -> anyhow::Result<Job> + Send + Sync + 'static,
    {
        Self::with_transformer(name, store, Arc::new(FnTransformer(transform)))
    }

    pub fn with_transformer(
        name: impl Into<String>,
        store: Arc<dyn QueueStore<R>>,
        transformer: Arc<dyn RecordTransformer<R>>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            transformer,
        }
    }

    /// Claim one record and transform it.
    ///
    /// A record that fails to transform is marked failed on a best-effort
    /// basis so it does not stay claimed forever. Errors use single-queue
    /// context; see [`DispatchError::in_queue`].
    pub async fn claim(
        &self,
        worker_hostname: &str,
        version: &str,
        resources: &ResourceMetadata,
    ) -> Result<Option<Job>> {
        let record = self
            .store
            .dequeue(worker_hostname)
            .await
            .map_err(|e| DispatchError::store("store.dequeue", e))?;
        let Some(record) = record else {
            return Ok(None);
        };

        match self.transformer.transform(version, &record, resources).await {
            Ok(job) => Ok(Some(job)),
            Err(transform_err) => Err(self.fail_untransformable(&record, transform_err).await),
        }
    }

    async fn fail_untransformable(&self, record: &R, transform_err: anyhow::Error) -> DispatchError {
        let id = record.record_id();
        let reason = format!("failed to transform record: {transform_err}");

        let mark_err = match self
            .store
            .mark_failed(id, &reason, &MarkFinalOptions::default())
            .await
        {
            Ok(_) => None,
            Err(e) => Some(e),
        };

        let message = match mark_err {
            None => transform_err.to_string(),
            Some(mark_err) => {
                tracing::error!(
                    queue = %self.name,
                    job_id = id,
                    error = %mark_err,
                    "Failed to mark untransformable record as failed"
                );
                format!("{transform_err}; additionally failed to mark record as failed: {mark_err}")
            }
        };
        tracing::error!(queue = %self.name, job_id = id, error = %transform_err, "Failed to transform record");

        DispatchError::Transform {
            queue: None,
            message,
        }
    }
}

/// A queue the multi-queue dispatcher can claim from without knowing its
/// record type.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn queued_count(&self) -> Result<usize>;

    async fn claim_job(
        &self,
        worker_hostname: &str,
        version: &str,
        resources: &ResourceMetadata,
    ) -> Result<Option<Job>>;

    async fn heartbeat(&self, ids: &[String], options: &HeartbeatOptions) -> Result<Reconciled>;
}

#[async_trait]
impl<R: Record> DispatchQueue for QueueHandler<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn queued_count(&self) -> Result<usize> {
        self.store
            .queued_count()
            .await
            .map_err(|e| DispatchError::store("store.queuedCount", e))
    }

    async fn claim_job(
        &self,
        worker_hostname: &str,
        version: &str,
        resources: &ResourceMetadata,
    ) -> Result<Option<Job>> {
        self.claim(worker_hostname, version, resources).await
    }

    async fn heartbeat(&self, ids: &[String], options: &HeartbeatOptions) -> Result<Reconciled> {
        self.store
            .heartbeat(ids, options)
            .await
            .map_err(|e| DispatchError::store("store.heartbeat", e))
    }
}
