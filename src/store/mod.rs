//! Collaborator interfaces consumed by the dispatchers.
//!
//! The dispatch layer owns no durable state. Every record, token, liveness
//! row and rate-limit entry lives behind one of these traits:
//!
//! - [`QueueStore`]: atomic claim plus ownership-scoped mutation of records
//! - [`JobTokenStore`]: per-job credentials bound to `(job id, queue)`
//! - [`ExecutorStore`]: executor liveness rows
//! - [`MetricsStore`]: decoded executor metrics
//! - [`DequeueCache`]: hash-per-key cache backing the dequeue rate limiter
//!
//! [`memory`] provides in-process implementations of all of them.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{StoreError, TokenError};
use crate::metrics::MetricFamily;
use crate::scheduler::job::{ExecutionLogEntry, Executor, Record};

pub mod memory;

/// Only the record owned by `worker_hostname` and still in `state` may be
/// touched by a log mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLogEntryOptions {
    pub worker_hostname: String,
    pub state: String,
}

impl ExecutionLogEntryOptions {
    pub fn processing(worker_hostname: &str) -> Self {
        Self {
            worker_hostname: worker_hostname.to_string(),
            state: "processing".to_string(),
        }
    }
}

/// Scopes a finalization to the owning executor. `None` means the
/// dispatcher itself is finalizing and ownership is not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkFinalOptions {
    pub worker_hostname: Option<String>,
}

impl MarkFinalOptions {
    pub fn owned_by(worker_hostname: &str) -> Self {
        Self {
            worker_hostname: Some(worker_hostname.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOptions {
    pub worker_hostname: String,
}

/// Ids partitioned by a heartbeat reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Still owned by the caller; keep processing
    pub known: Vec<String>,
    /// Must be stopped by the caller
    pub cancel: Vec<String>,
}

#[async_trait]
pub trait QueueStore<R: Record>: Send + Sync {
    /// Number of records waiting to be claimed.
    async fn queued_count(&self) -> Result<usize, StoreError>;

    /// Atomically claim one queued record for `worker_hostname`.
    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<R>, StoreError>;

    async fn add_execution_log_entry(
        &self,
        id: i64,
        entry: ExecutionLogEntry,
        options: &ExecutionLogEntryOptions,
    ) -> Result<i64, StoreError>;

    async fn update_execution_log_entry(
        &self,
        id: i64,
        entry_id: i64,
        entry: ExecutionLogEntry,
        options: &ExecutionLogEntryOptions,
    ) -> Result<(), StoreError>;

    /// Returns `false` when no matching owned record was found.
    async fn mark_complete(&self, id: i64, options: &MarkFinalOptions) -> Result<bool, StoreError>;

    async fn mark_errored(
        &self,
        id: i64,
        failure_message: &str,
        options: &MarkFinalOptions,
    ) -> Result<bool, StoreError>;

    async fn mark_failed(
        &self,
        id: i64,
        failure_message: &str,
        options: &MarkFinalOptions,
    ) -> Result<bool, StoreError>;

    /// Refresh liveness of the reported records and partition them.
    async fn heartbeat(
        &self,
        ids: &[String],
        options: &HeartbeatOptions,
    ) -> Result<Reconciled, StoreError>;
}

#[async_trait]
pub trait JobTokenStore: Send + Sync {
    /// Fails with [`TokenError::AlreadyCreated`] when a live token exists.
    async fn create(&self, job_id: i64, queue: &str, repo: &str) -> Result<String, TokenError>;

    async fn regenerate(&self, job_id: i64, queue: &str) -> Result<String, TokenError>;

    async fn delete(&self, job_id: i64, queue: &str) -> Result<(), TokenError>;

    async fn exists(&self, job_id: i64, queue: &str) -> Result<bool, TokenError>;
}

#[async_trait]
pub trait ExecutorStore: Send + Sync {
    async fn upsert_heartbeat(&self, executor: Executor) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn ingest(&self, instance: &str, families: Vec<MetricFamily>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DequeueCache: Send + Sync {
    async fn set_hash_item(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn get_hash_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn delete_hash_item(&self, key: &str, field: &str) -> Result<(), StoreError>;
}
