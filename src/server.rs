use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::api::{multi_queue_router, queue_router, ErrorResponse, JsonBody};
use crate::config::DispatchConfig;
use crate::dispatch::{
    DispatchContext, DispatchQueue, MultiQueueDispatcher, QueueHandler, SingleQueueDispatcher,
};
use crate::metrics::MetricsForwarder;
use crate::scheduler::job::{
    CliStep, DockerStep, Job, Record, ResourceMetadata, VirtualMachineFile,
};
use crate::scheduler::rate_limit::DequeueRateLimiter;
use crate::scheduler::selector::WeightedQueueSelector;
use crate::store::memory::{
    MemoryDequeueCache, MemoryExecutorStore, MemoryJobTokenStore, MemoryMetricsStore,
    MemoryQueueStore,
};

/// Work item held by the in-memory queues the server runs with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(default)]
    pub id: i64,
    pub repository_name: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub fetch_tags: bool,
    #[serde(default)]
    pub shallow_clone: bool,
    #[serde(default)]
    pub files: BTreeMap<String, VirtualMachineFile>,
    #[serde(default)]
    pub docker_steps: Vec<DockerStep>,
    #[serde(default)]
    pub cli_steps: Vec<CliStep>,
    #[serde(default)]
    pub redacted_values: BTreeMap<String, String>,
}

impl Record for JobRecord {
    fn record_id(&self) -> i64 {
        self.id
    }
}

impl JobRecord {
    /// Build the executor payload for this record.
    pub fn to_job(&self, _version: &str, _resources: &ResourceMetadata) -> anyhow::Result<Job> {
        if self.repository_name.is_empty() {
            anyhow::bail!("record {} has no repository", self.id);
        }
        if self.docker_steps.is_empty() && self.cli_steps.is_empty() {
            anyhow::bail!("record {} has no steps", self.id);
        }

        Ok(Job {
            id: self.id,
            repository_name: self.repository_name.clone(),
            repository_directory: "repository".to_string(),
            commit: self.commit.clone(),
            fetch_tags: self.fetch_tags,
            shallow_clone: self.shallow_clone,
            files: self.files.clone(),
            docker_steps: Some(self.docker_steps.clone()).filter(|s| !s.is_empty()),
            cli_steps: Some(self.cli_steps.clone()).filter(|s| !s.is_empty()),
            redacted_values: Some(self.redacted_values.clone()).filter(|m| !m.is_empty()),
            ..Default::default()
        })
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    id: i64,
}

#[derive(Clone)]
struct EnqueueState {
    store: Arc<MemoryQueueStore<JobRecord>>,
    next_id: Arc<AtomicI64>,
}

async fn enqueue(
    State(state): State<EnqueueState>,
    JsonBody(mut record): JsonBody<JobRecord>,
) -> impl IntoResponse {
    if record.id <= 0 {
        record.id = state.next_id.fetch_add(1, Ordering::Relaxed);
    }
    let id = record.id;

    if !state.store.enqueue(record).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: format!("queue is at capacity or record {id} already exists"),
            }),
        )
            .into_response();
    }
    tracing::debug!(job_id = id, "Enqueued record");
    Json(EnqueueResponse { id }).into_response()
}

fn enqueue_router(queue: &str, store: Arc<MemoryQueueStore<JobRecord>>) -> Router {
    Router::new()
        .route(&format!("/queue/{queue}/enqueue"), post(enqueue))
        .with_state(EnqueueState {
            store,
            next_id: Arc::new(AtomicI64::new(1)),
        })
}

/// The dispatch server running on in-memory backends.
pub struct Server {
    pub config: DispatchConfig,
    pub queues: BTreeMap<String, Arc<MemoryQueueStore<JobRecord>>>,
    pub tokens: Arc<MemoryJobTokenStore>,
    pub executors: Arc<MemoryExecutorStore>,
    pub metrics: Arc<MemoryMetricsStore>,
    pub limiter: Arc<DequeueRateLimiter>,
    router: Router,
    forwarder_handle: JoinHandle<()>,
}

impl Server {
    /// Wire stores, dispatchers and routes for every configured queue.
    /// Must be called from within a tokio runtime.
    pub fn new(config: DispatchConfig) -> Self {
        let tokens = Arc::new(MemoryJobTokenStore::new());
        let executors = Arc::new(MemoryExecutorStore::new());
        let metrics = Arc::new(MemoryMetricsStore::new());
        let (forwarder, forwarder_handle) = MetricsForwarder::spawn(metrics.clone());

        let ctx = DispatchContext::new(tokens.clone(), executors.clone())
            .with_metrics(forwarder)
            .with_version_gate(config.version_gate.clone());

        let limiter = Arc::new(DequeueRateLimiter::new(
            Arc::new(MemoryDequeueCache::new()),
            config.multiqueue.limits(),
        ));

        let mut router = Router::new();
        let mut queues = BTreeMap::new();
        let mut handlers: Vec<Arc<dyn DispatchQueue>> = Vec::new();

        for name in config.queue_names() {
            let store = Arc::new(MemoryQueueStore::<JobRecord>::new());
            let handler = QueueHandler::<JobRecord>::new(
                name.clone(),
                store.clone(),
                |version: &str, record: &JobRecord, resources: &ResourceMetadata| {
                    record.to_job(version, resources)
                },
            );

            handlers.push(Arc::new(handler.clone()));
            router = router
                .merge(queue_router(Arc::new(SingleQueueDispatcher::new(
                    handler,
                    ctx.clone(),
                ))))
                .merge(enqueue_router(&name, store.clone()));
            queues.insert(name, store);
        }

        let multi = MultiQueueDispatcher::new(
            handlers,
            ctx,
            limiter.clone(),
            Arc::new(WeightedQueueSelector::new(config.multiqueue.weights())),
        );
        let router = router
            .merge(multi_queue_router(Arc::new(multi)))
            .layer(TraceLayer::new_for_http());

        Self {
            config,
            queues,
            tokens,
            executors,
            metrics,
            limiter,
            router,
            forwarder_handle,
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires, pruning the dequeue cache alongside.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let cleaner = tokio::spawn(self.limiter.clone().run_cleaner(
            self.config.multiqueue.window,
            self.config.multiqueue.cleanup_interval,
            shutdown.clone(),
        ));

        let resetter = tokio::spawn(reset_stalled_loop(
            self.queues.clone(),
            self.config.stalled_after,
            self.config.multiqueue.cleanup_interval,
            shutdown.clone(),
        ));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            addr = %addr,
            queues = ?self.queues.keys().collect::<Vec<_>>(),
            "Executor dispatch server listening"
        );

        let drain = shutdown.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .await?;

        shutdown.cancel();
        if let Err(e) = cleaner.await {
            tracing::warn!(error = %e, "Dequeue cache cleaner task failed");
        }
        if let Err(e) = resetter.await {
            tracing::warn!(error = %e, "Stalled record resetter task failed");
        }
        self.forwarder_handle.abort();
        tracing::info!("Executor dispatch server stopped");
        Ok(())
    }
}

/// Requeue records whose executor went silent and drop finished ones,
/// every `interval`.
async fn reset_stalled_loop(
    queues: BTreeMap<String, Arc<MemoryQueueStore<JobRecord>>>,
    stalled_after: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for (name, store) in &queues {
                    let reset = store.reset_stalled(stalled_after).await;
                    if !reset.is_empty() {
                        tracing::info!(queue = %name, ids = ?reset, "Requeued stalled records");
                    }
                    let removed = store.cleanup_finished().await;
                    if removed > 0 {
                        tracing::debug!(queue = %name, removed, "Removed finished records");
                    }
                }
            }
        }
    }
}
