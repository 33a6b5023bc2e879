use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::NaiveDate;

use crate::scheduler::version::parse_lenient;

/// Minimum executor version that understands the v2 job payload.
pub const DEFAULT_MIN_VERSION: &str = "4.3.0-0";

/// Per-queue dequeue budget for the multi-queue fairness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimit {
    /// Dequeues allowed per window before the queue stops being eligible
    pub limit: usize,
    /// Relative weight when several eligible queues compete
    pub weight: u32,
}

impl Default for QueueLimit {
    fn default() -> Self {
        Self {
            limit: 100,
            weight: 1,
        }
    }
}

/// Gate deciding whether an executor is new enough for v2 jobs.
#[derive(Debug, Clone)]
pub struct VersionGate {
    /// Semantic version lower bound (prereleases of it included)
    pub min_version: String,
    /// Lower bound for date-stamped insiders builds
    pub min_insiders_date: NaiveDate,
}

impl Default for VersionGate {
    fn default() -> Self {
        Self {
            min_version: DEFAULT_MIN_VERSION.to_string(),
            // SAFETY: constant calendar date
            min_insiders_date: NaiveDate::from_ymd_opt(2022, 11, 24)
                .expect("default insiders date is valid"),
        }
    }
}

impl VersionGate {
    /// Default gate with a different semantic version bound. The bound must
    /// parse, otherwise every versioned dequeue would fail later on.
    pub fn with_min_version(min_version: String) -> Result<Self, String> {
        parse_lenient(&min_version)
            .map_err(|e| format!("invalid minimum version {min_version:?}: {e}"))?;
        Ok(Self {
            min_version,
            ..Self::default()
        })
    }
}

/// Settings for the shared multi-queue dequeue route.
#[derive(Debug, Clone)]
pub struct MultiQueueConfig {
    /// Keyed by queue name. Queues absent here are never rate limited and
    /// carry no selection weight.
    pub queues: BTreeMap<String, QueueLimit>,
    /// Width of the sliding dequeue window
    pub window: Duration,
    /// How often expired dequeue-cache entries are pruned
    pub cleanup_interval: Duration,
}

impl Default for MultiQueueConfig {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
            window: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(5),
        }
    }
}

impl MultiQueueConfig {
    pub fn limits(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(name, q)| (name.clone(), q.limit))
            .collect()
    }

    pub fn weights(&self) -> BTreeMap<String, u32> {
        self.queues
            .iter()
            .map(|(name, q)| (name.clone(), q.weight))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub listen_addr: SocketAddr,
    pub version_gate: VersionGate,
    pub multiqueue: MultiQueueConfig,
    /// Processing records without a heartbeat for this long go back to the
    /// queue
    pub stalled_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:3189"
                .parse()
                .expect("default listen address is valid"),
            version_gate: VersionGate::default(),
            multiqueue: MultiQueueConfig::default(),
            stalled_after: Duration::from_secs(60),
        }
    }
}

impl DispatchConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_queue(mut self, name: impl Into<String>, limit: usize, weight: u32) -> Self {
        self.multiqueue
            .queues
            .insert(name.into(), QueueLimit { limit, weight });
        self
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.multiqueue.queues.keys().cloned().collect()
    }
}

/// Parse a `name:limit:weight` list such as `codeintel:250:1,batches:50:4`.
///
/// `limit` and `weight` may be omitted, in which case the defaults of
/// [`QueueLimit`] apply.
pub fn parse_queue_limits(list: &str) -> Result<BTreeMap<String, QueueLimit>, String> {
    let mut queues = BTreeMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(format!("missing queue name in {entry:?}"));
        }

        let mut limit = QueueLimit::default();
        if let Some(raw) = parts.next() {
            limit.limit = raw
                .parse()
                .map_err(|e| format!("invalid limit in {entry:?}: {e}"))?;
        }
        if let Some(raw) = parts.next() {
            limit.weight = raw
                .parse()
                .map_err(|e| format!("invalid weight in {entry:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("expected name:limit:weight, got {entry:?}"));
        }

        queues.insert(name.to_string(), limit);
    }
    Ok(queues)
}
