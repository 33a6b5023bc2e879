use thiserror::Error;

/// Errors reported by a [`QueueStore`](crate::store::QueueStore).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The targeted record does not exist, is not owned by the caller, or is
    /// no longer processing.
    #[error("execution log entry not updated")]
    LogEntryNotUpdated,

    #[error("{0}")]
    Backend(String),
}

/// Errors reported by a [`JobTokenStore`](crate::store::JobTokenStore).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenError {
    #[error("job token already exists")]
    AlreadyCreated,

    #[error("job token not found")]
    NotFound,

    #[error("{0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("worker hostname cannot be empty")]
    EmptyHostname,

    #[error("failed to check version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Invalid queue name(s) '{invalid}' found. Supported queue names are '{supported}'.")]
    InvalidQueueNames { invalid: String, supported: String },

    #[error("queueNames must be set for multi-queue heartbeats")]
    MissingHeartbeatQueueNames,

    #[error(
        "unsupported queue name(s) '{unsupported}' submitted in queueJobIds, executor is configured for queues '{configured}'"
    )]
    UnsupportedHeartbeatQueues {
        unsupported: String,
        configured: String,
    },

    #[error("unknown job")]
    UnknownJob,

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    /// The record transform failed. `message` already folds in any failure
    /// to mark the record as failed afterwards.
    #[error("RecordTransformer{}: {message}", queue_suffix(.queue))]
    Transform {
        queue: Option<String>,
        message: String,
    },

    #[error("CreateToken: {0}")]
    CreateToken(#[source] TokenError),

    #[error("RegenerateToken: {0}")]
    RegenerateToken(#[source] TokenError),

    #[error("jobTokenStore.Delete: {0}")]
    DeleteToken(#[source] TokenError),

    #[error("dequeue cache: {0}")]
    Cache(String),

    #[error("failed to select a queue from candidates '{0}'")]
    NoSelectableQueue(String),
}

fn queue_suffix(queue: &Option<String>) -> String {
    queue.as_ref().map(|q| format!(" {q}")).unwrap_or_default()
}

impl DispatchError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        DispatchError::Store {
            context: context.into(),
            source,
        }
    }

    /// Attribute a per-queue error to `queue`, as reported on the shared
    /// multi-queue routes.
    pub fn in_queue(self, queue: &str) -> Self {
        match self {
            DispatchError::Store { context, source } => DispatchError::Store {
                context: format!("{context} {queue}"),
                source,
            },
            DispatchError::Transform { queue: None, message } => DispatchError::Transform {
                queue: Some(queue.to_string()),
                message,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
