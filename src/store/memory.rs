use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, TokenError};
use crate::metrics::MetricFamily;
use crate::scheduler::job::{ExecutionLogEntry, Executor, Record, RecordState};
use crate::store::{
    DequeueCache, ExecutionLogEntryOptions, ExecutorStore, HeartbeatOptions, JobTokenStore,
    MarkFinalOptions, MetricsStore, QueueStore, Reconciled,
};

const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Snapshot of a record's bookkeeping, for inspection.
#[derive(Debug, Clone)]
pub struct RecordStatus {
    pub state: RecordState,
    pub worker_hostname: Option<String>,
    pub failure_message: Option<String>,
    pub cancel_requested: bool,
    pub log_entries: Vec<ExecutionLogEntry>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct StoredRecord<R> {
    record: R,
    state: RecordState,
    worker_hostname: Option<String>,
    failure_message: Option<String>,
    cancel_requested: bool,
    log_entries: Vec<ExecutionLogEntry>,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl<R> StoredRecord<R> {
    fn owned_by(&self, hostname: &str) -> bool {
        self.worker_hostname.as_deref() == Some(hostname)
    }

    /// Finalization scope: still processing and, unless the dispatcher is
    /// finalizing on its own behalf, owned by the caller.
    fn finalizable_by(&self, options: &MarkFinalOptions) -> bool {
        self.state == RecordState::Processing
            && options
                .worker_hostname
                .as_deref()
                .map_or(true, |hostname| self.owned_by(hostname))
    }

    fn log_writable_by(&self, options: &ExecutionLogEntryOptions) -> bool {
        self.state.to_string() == options.state && self.owned_by(&options.worker_hostname)
    }
}

fn remove_finished<R>(records: &mut BTreeMap<i64, StoredRecord<R>>) -> usize {
    let before = records.len();
    records.retain(|_, stored| !stored.state.is_terminal());
    before - records.len()
}

/// In-process queue store. Claims happen under a single write lock, so a
/// record is handed to at most one executor per claim.
#[derive(Debug)]
pub struct MemoryQueueStore<R> {
    records: RwLock<BTreeMap<i64, StoredRecord<R>>>,
    max_records: usize,
}

impl<R: Record + Clone> Default for MemoryQueueStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record + Clone> MemoryQueueStore<R> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            max_records,
        }
    }

    /// Add a record in the queued state. Finished records are evicted to
    /// make room; returns false if the store is still at capacity or the id
    /// is already taken.
    pub async fn enqueue(&self, record: R) -> bool {
        let mut records = self.records.write().await;
        let id = record.record_id();
        if records.len() >= self.max_records {
            let removed = remove_finished(&mut records);
            if removed > 0 {
                tracing::debug!(removed, "Evicted finished records to admit new work");
            }
        }
        if records.len() >= self.max_records || records.contains_key(&id) {
            return false;
        }
        records.insert(
            id,
            StoredRecord {
                record,
                state: RecordState::Queued,
                worker_hostname: None,
                failure_message: None,
                cancel_requested: false,
                log_entries: Vec::new(),
                last_heartbeat_at: None,
            },
        );
        true
    }

    /// Flag a processing record so the owner's next heartbeat cancels it.
    pub async fn cancel(&self, id: i64) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(stored) if stored.state == RecordState::Processing => {
                stored.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self, id: i64) -> Option<RecordStatus> {
        self.records.read().await.get(&id).map(|s| RecordStatus {
            state: s.state,
            worker_hostname: s.worker_hostname.clone(),
            failure_message: s.failure_message.clone(),
            cancel_requested: s.cancel_requested,
            log_entries: s.log_entries.clone(),
            last_heartbeat_at: s.last_heartbeat_at,
        })
    }

    pub async fn get(&self, id: i64) -> Option<R> {
        self.records.read().await.get(&id).map(|s| s.record.clone())
    }

    /// Put processing records whose owner stopped heartbeating back in the
    /// queue. Returns the ids that were reset.
    pub async fn reset_stalled(&self, max_silence: Duration) -> Vec<i64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_silence).unwrap_or(chrono::Duration::zero());
        let mut records = self.records.write().await;
        let mut reset = Vec::new();
        for (id, stored) in records.iter_mut() {
            let stale = stored.state == RecordState::Processing
                && stored.last_heartbeat_at.map_or(true, |at| at <= cutoff);
            if stale {
                stored.state = RecordState::Queued;
                stored.worker_hostname = None;
                stored.cancel_requested = false;
                stored.last_heartbeat_at = None;
                reset.push(*id);
            }
        }
        reset
    }

    /// Remove completed, errored and failed records. Returns the number removed.
    pub async fn cleanup_finished(&self) -> usize {
        remove_finished(&mut *self.records.write().await)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn finalize(
        &self,
        id: i64,
        state: RecordState,
        failure_message: Option<&str>,
        options: &MarkFinalOptions,
    ) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(stored) if stored.finalizable_by(options) => {
                stored.state = state;
                stored.failure_message = failure_message.map(str::to_string);
                stored.cancel_requested = false;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl<R: Record + Clone> QueueStore<R> for MemoryQueueStore<R> {
    async fn queued_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|s| s.state == RecordState::Queued)
            .count())
    }

    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<R>, StoreError> {
        let mut records = self.records.write().await;
        let Some(stored) = records
            .values_mut()
            .find(|s| s.state == RecordState::Queued)
        else {
            return Ok(None);
        };

        stored.state = RecordState::Processing;
        stored.worker_hostname = Some(worker_hostname.to_string());
        stored.last_heartbeat_at = Some(Utc::now());
        Ok(Some(stored.record.clone()))
    }

    async fn add_execution_log_entry(
        &self,
        id: i64,
        entry: ExecutionLogEntry,
        options: &ExecutionLogEntryOptions,
    ) -> Result<i64, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(stored) if stored.log_writable_by(options) => {
                stored.log_entries.push(entry);
                Ok(stored.log_entries.len() as i64)
            }
            _ => Err(StoreError::LogEntryNotUpdated),
        }
    }

    async fn update_execution_log_entry(
        &self,
        id: i64,
        entry_id: i64,
        entry: ExecutionLogEntry,
        options: &ExecutionLogEntryOptions,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let stored = match records.get_mut(&id) {
            Some(stored) if stored.log_writable_by(options) => stored,
            _ => return Err(StoreError::LogEntryNotUpdated),
        };

        let slot = usize::try_from(entry_id)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| stored.log_entries.get_mut(i))
            .ok_or(StoreError::LogEntryNotUpdated)?;
        *slot = entry;
        Ok(())
    }

    async fn mark_complete(&self, id: i64, options: &MarkFinalOptions) -> Result<bool, StoreError> {
        Ok(self
            .finalize(id, RecordState::Completed, None, options)
            .await)
    }

    async fn mark_errored(
        &self,
        id: i64,
        failure_message: &str,
        options: &MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        Ok(self
            .finalize(id, RecordState::Errored, Some(failure_message), options)
            .await)
    }

    async fn mark_failed(
        &self,
        id: i64,
        failure_message: &str,
        options: &MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        Ok(self
            .finalize(id, RecordState::Failed, Some(failure_message), options)
            .await)
    }

    async fn heartbeat(
        &self,
        ids: &[String],
        options: &HeartbeatOptions,
    ) -> Result<Reconciled, StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let mut reconciled = Reconciled::default();

        for raw in ids {
            let owned = raw
                .parse::<i64>()
                .ok()
                .and_then(|id| records.get_mut(&id))
                .filter(|s| {
                    s.state == RecordState::Processing && s.owned_by(&options.worker_hostname)
                });

            match owned {
                Some(stored) if !stored.cancel_requested => {
                    stored.last_heartbeat_at = Some(now);
                    reconciled.known.push(raw.clone());
                }
                _ => reconciled.cancel.push(raw.clone()),
            }
        }

        Ok(reconciled)
    }
}

/// A live job token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobToken {
    pub job_id: i64,
    pub queue: String,
    pub repo: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// In-process token store keyed by `(job id, queue)`.
#[derive(Debug, Default)]
pub struct MemoryJobTokenStore {
    tokens: RwLock<HashMap<(i64, String), JobToken>>,
}

impl MemoryJobTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a presented credential back to the job it was issued for.
    pub async fn get_by_token(&self, value: &str) -> Result<JobToken, TokenError> {
        self.tokens
            .read()
            .await
            .values()
            .find(|t| t.value == value)
            .cloned()
            .ok_or(TokenError::NotFound)
    }

    pub async fn get(&self, job_id: i64, queue: &str) -> Result<JobToken, TokenError> {
        self.tokens
            .read()
            .await
            .get(&(job_id, queue.to_string()))
            .cloned()
            .ok_or(TokenError::NotFound)
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

fn new_token_value() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl JobTokenStore for MemoryJobTokenStore {
    async fn create(&self, job_id: i64, queue: &str, repo: &str) -> Result<String, TokenError> {
        let mut tokens = self.tokens.write().await;
        let key = (job_id, queue.to_string());
        if tokens.contains_key(&key) {
            return Err(TokenError::AlreadyCreated);
        }

        let value = new_token_value();
        tokens.insert(
            key,
            JobToken {
                job_id,
                queue: queue.to_string(),
                repo: repo.to_string(),
                value: value.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(value)
    }

    async fn regenerate(&self, job_id: i64, queue: &str) -> Result<String, TokenError> {
        let mut tokens = self.tokens.write().await;
        let token = tokens
            .get_mut(&(job_id, queue.to_string()))
            .ok_or(TokenError::NotFound)?;
        token.value = new_token_value();
        token.created_at = Utc::now();
        Ok(token.value.clone())
    }

    async fn delete(&self, job_id: i64, queue: &str) -> Result<(), TokenError> {
        self.tokens
            .write()
            .await
            .remove(&(job_id, queue.to_string()));
        Ok(())
    }

    async fn exists(&self, job_id: i64, queue: &str) -> Result<bool, TokenError> {
        Ok(self
            .tokens
            .read()
            .await
            .contains_key(&(job_id, queue.to_string())))
    }
}

/// In-process executor liveness table keyed by hostname.
#[derive(Debug, Default)]
pub struct MemoryExecutorStore {
    executors: RwLock<HashMap<String, Executor>>,
}

impl MemoryExecutorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, hostname: &str) -> Option<Executor> {
        self.executors.read().await.get(hostname).cloned()
    }

    /// All executors, most recently seen first.
    pub async fn list(&self) -> Vec<Executor> {
        let mut executors: Vec<Executor> = self.executors.read().await.values().cloned().collect();
        executors.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        executors
    }
}

#[async_trait]
impl ExecutorStore for MemoryExecutorStore {
    async fn upsert_heartbeat(&self, mut executor: Executor) -> Result<(), StoreError> {
        executor.last_seen_at = Some(Utc::now());
        self.executors
            .write()
            .await
            .insert(executor.hostname.clone(), executor);
        Ok(())
    }
}

/// Keeps every ingested metric family, tagged with the reporting instance.
#[derive(Debug, Default)]
pub struct MemoryMetricsStore {
    families: RwLock<Vec<(String, MetricFamily)>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn families(&self) -> Vec<(String, MetricFamily)> {
        self.families.read().await.clone()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn ingest(&self, instance: &str, families: Vec<MetricFamily>) -> Result<(), StoreError> {
        self.families
            .write()
            .await
            .extend(families.into_iter().map(|f| (instance.to_string(), f)));
        Ok(())
    }
}

/// Hash-per-key cache. Entries never expire on their own.
#[derive(Debug, Default)]
pub struct MemoryDequeueCache {
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryDequeueCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DequeueCache for MemoryDequeueCache {
    async fn set_hash_item(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.hashes
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn get_hash_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .hashes
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_hash_item(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut hashes = self.hashes.write().await;
        if let Some(hash) = hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                hashes.remove(key);
            }
        }
        Ok(())
    }
}
