use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::store::DequeueCache;

/// Per-queue sliding-window dequeue counter.
///
/// Every multi-queue dequeue appends a `<timestamp-nanos>:<token> -> token`
/// field to the hash keyed by the queue name. A queue is eligible while its entry
/// count is strictly below its limit.
pub struct DequeueRateLimiter {
    cache: Arc<dyn DequeueCache>,
    limits: BTreeMap<String, usize>,
}

impl DequeueRateLimiter {
    pub fn new(cache: Arc<dyn DequeueCache>, limits: BTreeMap<String, usize>) -> Self {
        Self { cache, limits }
    }

    pub fn limit(&self, queue: &str) -> Option<usize> {
        self.limits.get(queue).copied()
    }

    /// Number of dequeues recorded for `queue` in the current window.
    pub async fn dequeue_count(&self, queue: &str) -> Result<usize> {
        let entries = self
            .cache
            .get_hash_all(queue)
            .await
            .map_err(|e| DispatchError::Cache(format!("reading {queue}: {e}")))?;
        Ok(entries.len())
    }

    /// Keep the queues still under their limit, in input order.
    ///
    /// When every queue is at its limit all of them are returned, so a busy
    /// fleet keeps draining work instead of stalling.
    pub async fn select_eligible_queues(&self, queues: &[String]) -> Result<Vec<String>> {
        let mut eligible = Vec::with_capacity(queues.len());
        for queue in queues {
            let count = self.dequeue_count(queue).await?;
            match self.limit(queue) {
                Some(limit) if count >= limit => {
                    tracing::debug!(queue = %queue, count, limit, "Queue at dequeue limit");
                }
                _ => eligible.push(queue.clone()),
            }
        }

        if eligible.is_empty() {
            tracing::debug!(?queues, "All queues at dequeue limit, treating all as eligible");
            return Ok(queues.to_vec());
        }
        Ok(eligible)
    }

    pub async fn record_dequeue(&self, queue: &str, token: &str) -> Result<()> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.cache
            .set_hash_item(queue, &dequeue_field(now, token), token)
            .await
            .map_err(|e| DispatchError::Cache(format!("recording dequeue for {queue}: {e}")))
    }

    /// Drop entries older than `window` across all configured queues.
    /// Returns how many entries were removed.
    pub async fn prune(&self, window: Duration) -> Result<usize> {
        let window_nanos = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(window_nanos);

        let mut removed = 0;
        for queue in self.limits.keys() {
            let entries = self
                .cache
                .get_hash_all(queue)
                .await
                .map_err(|e| DispatchError::Cache(format!("reading {queue}: {e}")))?;

            for field in entries.keys() {
                let expired = field_timestamp(field).map_or(true, |ts| ts < cutoff);
                if !expired {
                    continue;
                }
                self.cache
                    .delete_hash_item(queue, field)
                    .await
                    .map_err(|e| DispatchError::Cache(format!("pruning {queue}: {e}")))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Prune every `interval` until `shutdown` fires.
    pub async fn run_cleaner(
        self: Arc<Self>,
        window: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dequeue cache cleaner shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.prune(window).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "Pruned dequeue cache entries"),
                        Err(e) => tracing::warn!(error = %e, "Failed to prune dequeue cache"),
                    }
                }
            }
        }
    }
}

/// Dequeues landing on the same nanosecond stay distinct through the token.
fn dequeue_field(at_nanos: i64, token: &str) -> String {
    format!("{at_nanos}:{token}")
}

fn field_timestamp(field: &str) -> Option<i64> {
    let ts = field.split_once(':').map_or(field, |(ts, _)| ts);
    ts.parse().ok()
}
