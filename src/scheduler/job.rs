use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-native unit of queued work, before it is transformed into a [`Job`].
pub trait Record: Send + Sync + 'static {
    fn record_id(&self) -> i64;

    /// Identifier as reported by executors in heartbeats.
    fn record_uid(&self) -> String {
        self.record_id().to_string()
    }
}

/// Lifecycle state of a record held by a queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Queued,
    Processing,
    Completed,
    Errored,
    Failed,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Completed | RecordState::Errored | RecordState::Failed
        )
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Queued => write!(f, "queued"),
            RecordState::Processing => write!(f, "processing"),
            RecordState::Completed => write!(f, "completed"),
            RecordState::Errored => write!(f, "errored"),
            RecordState::Failed => write!(f, "failed"),
        }
    }
}

/// Resources an executor advertises when it asks for work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(rename = "numCPUs", default)]
    pub num_cpus: u32,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub disk_space: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineFile {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerStep {
    pub key: String,
    pub image: String,
    pub commands: Vec<String>,
    pub dir: String,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliStep {
    pub key: String,
    pub commands: Vec<String>,
    pub dir: String,
    pub env: Vec<String>,
}

/// Registry credentials handed to v2 executors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerAuthConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auths: BTreeMap<String, String>,
}

/// The payload handed to an executor for one claimed record.
///
/// `version` is only serialized when the executor negotiated the v2
/// protocol; `queue` only when the job was dequeued through the
/// multi-queue route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "is_v1")]
    pub version: u32,
    pub id: i64,
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue: String,
    pub repository_name: String,
    pub repository_directory: String,
    pub commit: String,
    pub fetch_tags: bool,
    pub shallow_clone: bool,
    pub sparse_checkout: Option<Vec<String>>,
    pub files: BTreeMap<String, VirtualMachineFile>,
    pub docker_steps: Option<Vec<DockerStep>>,
    pub cli_steps: Option<Vec<CliStep>>,
    pub redacted_values: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_auth_config: Option<DockerAuthConfig>,
}

fn is_v1(version: &u32) -> bool {
    *version < 2
}

impl Job {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Shape the payload for the negotiated protocol version.
    pub fn negotiate_version(&mut self, v2_supported: bool) {
        if v2_supported {
            self.version = 2;
            self.docker_auth_config.get_or_insert_with(Default::default);
        } else {
            self.version = 1;
            self.docker_auth_config = None;
        }
    }
}

/// One step of command output reported by an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub key: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub out: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

/// Liveness row describing a polling executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executor {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queue_names: Vec<String>,
    pub os: String,
    pub architecture: String,
    pub docker_version: String,
    pub executor_version: String,
    pub git_version: String,
    pub ignite_version: String,
    pub src_cli_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}
