//! Job dispatch: the claim, token and reconciliation protocol spoken with
//! polling executors.
//!
//! [`SingleQueueDispatcher`] serves one named queue. [`MultiQueueDispatcher`]
//! serves a shared executor fleet across several queues, choosing which one
//! to claim from on every dequeue.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::VersionGate;
use crate::error::{DispatchError, Result, TokenError};
use crate::metrics::MetricsForwarder;
use crate::scheduler::job::{ExecutionLogEntry, Executor, ResourceMetadata};
use crate::scheduler::version::check_version;
use crate::store::{ExecutorStore, JobTokenStore};

pub mod multi;
pub mod queue;
pub mod single;

pub use multi::MultiQueueDispatcher;
pub use queue::{DispatchQueue, QueueHandler, RecordTransformer};
pub use single::SingleQueueDispatcher;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    pub executor_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub resources: ResourceMetadata,
    /// Only read by the multi-queue route.
    #[serde(default)]
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddExecutionLogEntryRequest {
    pub executor_name: String,
    pub job_id: i64,
    #[serde(flatten)]
    pub entry: ExecutionLogEntry,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateExecutionLogEntryRequest {
    pub executor_name: String,
    pub job_id: i64,
    pub entry_id: i64,
    #[serde(flatten)]
    pub entry: ExecutionLogEntry,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkCompleteRequest {
    pub executor_name: String,
    pub job_id: i64,
}

/// Body of both `markErrored` and `markFailed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkErroredRequest {
    pub executor_name: String,
    pub job_id: i64,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJobIds {
    pub queue_name: String,
    #[serde(default, deserialize_with = "job_ids")]
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub executor_name: String,
    /// Protocol marker such as `V2`. Accepted for compatibility only.
    #[serde(default)]
    pub version: String,

    /// Single-queue routes
    #[serde(default, deserialize_with = "job_ids")]
    pub job_ids: Vec<String>,

    /// Multi-queue route
    #[serde(default)]
    pub queue_names: Vec<String>,
    #[serde(default, deserialize_with = "job_ids_by_queue")]
    pub job_ids_by_queue: Vec<QueueJobIds>,

    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub executor_version: String,
    #[serde(default)]
    pub git_version: String,
    #[serde(default)]
    pub ignite_version: String,
    #[serde(default)]
    pub src_cli_version: String,

    #[serde(default)]
    pub prometheus_metrics: String,
}

impl HeartbeatRequest {
    fn executor(&self) -> Executor {
        Executor {
            hostname: self.executor_name.clone(),
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            docker_version: self.docker_version.clone(),
            executor_version: self.executor_version.clone(),
            git_version: self.git_version.clone(),
            ignite_version: self.ignite_version.clone(),
            src_cli_version: self.src_cli_version.clone(),
            ..Default::default()
        }
    }
}

/// Empty lists are reported as `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(serialize_with = "null_if_empty", default, deserialize_with = "job_ids")]
    pub known_ids: Vec<String>,
    #[serde(serialize_with = "null_if_empty", default, deserialize_with = "job_ids")]
    pub cancel_ids: Vec<String>,
}

fn null_if_empty<S: Serializer>(ids: &[String], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if ids.is_empty() {
        serializer.serialize_none()
    } else {
        serializer.collect_seq(ids)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JobIdValue {
    Number(i64),
    Text(String),
}

/// Older executors report numeric ids, newer ones strings.
fn job_ids<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    let ids: Option<Vec<JobIdValue>> = Option::deserialize(deserializer)?;
    Ok(ids
        .unwrap_or_default()
        .into_iter()
        .map(|id| match id {
            JobIdValue::Number(n) => n.to_string(),
            JobIdValue::Text(s) => s,
        })
        .collect())
}

fn job_ids_by_queue<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<QueueJobIds>, D::Error> {
    Ok(Option::<Vec<QueueJobIds>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Collaborators shared by both dispatchers.
#[derive(Clone)]
pub struct DispatchContext {
    pub tokens: Arc<dyn JobTokenStore>,
    pub executors: Arc<dyn ExecutorStore>,
    pub metrics: Option<MetricsForwarder>,
    pub version_gate: VersionGate,
}

impl DispatchContext {
    pub fn new(tokens: Arc<dyn JobTokenStore>, executors: Arc<dyn ExecutorStore>) -> Self {
        Self {
            tokens,
            executors,
            metrics: None,
            version_gate: VersionGate::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsForwarder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_version_gate(mut self, gate: VersionGate) -> Self {
        self.version_gate = gate;
        self
    }

    /// Whether the executor reporting `version` gets the v2 payload. An
    /// absent version means v1.
    pub(crate) fn negotiate(&self, version: &str) -> Result<bool> {
        if version.is_empty() {
            return Ok(false);
        }
        check_version(version, &self.version_gate).map_err(|reason| DispatchError::InvalidVersion {
            version: version.to_string(),
            reason,
        })
    }

    /// Issue the job's token, regenerating it when an earlier attempt for the
    /// same job already created one.
    pub(crate) async fn issue_token(&self, job_id: i64, queue: &str, repo: &str) -> Result<String> {
        match self.tokens.create(job_id, queue, repo).await {
            Ok(token) => Ok(token),
            Err(TokenError::AlreadyCreated) => {
                tracing::debug!(job_id, queue = %queue, "Job token exists, regenerating");
                self.tokens
                    .regenerate(job_id, queue)
                    .await
                    .map_err(DispatchError::RegenerateToken)
            }
            Err(e) => Err(DispatchError::CreateToken(e)),
        }
    }

    pub(crate) async fn delete_token(&self, job_id: i64, queue: &str) -> Result<()> {
        self.tokens
            .delete(job_id, queue)
            .await
            .map_err(DispatchError::DeleteToken)
    }

    /// Liveness upsert and metrics hand-off. Neither can fail the heartbeat.
    pub(crate) async fn observe_heartbeat(&self, executor: Executor, prometheus_metrics: &str) {
        let hostname = executor.hostname.clone();
        if let Err(e) = self.executors.upsert_heartbeat(executor).await {
            tracing::warn!(executor = %hostname, error = %e, "Failed to upsert executor heartbeat");
        }

        if let Some(metrics) = &self.metrics {
            metrics.submit(&hostname, prometheus_metrics.to_string());
        }
    }
}

pub(crate) fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(DispatchError::EmptyHostname);
    }
    Ok(())
}
