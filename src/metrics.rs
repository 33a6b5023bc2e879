//! Executor metrics forwarding.
//!
//! Heartbeats may carry a Prometheus text exposition payload. Decoding and
//! ingestion run on a detached task fed by an unbounded channel so the
//! heartbeat response never waits on them. Delivery is at-most-once: a
//! payload that fails to decode or ingest is logged and dropped.

use std::sync::Arc;

use prometheus::proto::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricType, Quantile, Summary, Untyped,
};
use prometheus_parse::{Sample, Scrape, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::MetricsStore;

pub use prometheus::proto::MetricFamily;

/// Label added to every sample to identify the reporting executor.
pub const EXECUTOR_NAME_LABEL: &str = "executor_name";

/// Decode the Prometheus text exposition format into metric families, one
/// per metric name, in the order they first appear.
pub fn decode_text(payload: &str) -> Result<Vec<MetricFamily>, String> {
    let lines = payload
        .lines()
        .map(|line| Ok::<_, std::io::Error>(line.to_string()));
    let scrape = Scrape::parse(lines).map_err(|e| format!("failed to parse metrics: {e}"))?;

    let mut families: Vec<MetricFamily> = Vec::new();
    for sample in &scrape.samples {
        let index = match families.iter().position(|f| f.get_name() == sample.metric) {
            Some(i) => i,
            None => {
                let mut family = MetricFamily::default();
                family.set_name(sample.metric.clone());
                family.set_field_type(metric_type(&sample.value));
                if let Some(help) = scrape.docs.get(&sample.metric) {
                    family.set_help(help.clone());
                }
                families.push(family);
                families.len() - 1
            }
        };
        families[index].mut_metric().push(to_metric(sample));
    }

    Ok(families)
}

fn metric_type(value: &Value) -> MetricType {
    match value {
        Value::Counter(_) => MetricType::COUNTER,
        Value::Gauge(_) => MetricType::GAUGE,
        Value::Histogram(_) => MetricType::HISTOGRAM,
        Value::Summary(_) => MetricType::SUMMARY,
        Value::Untyped(_) => MetricType::UNTYPED,
    }
}

fn to_metric(sample: &Sample) -> Metric {
    let mut metric = Metric::default();

    let mut labels: Vec<(&String, &String)> = sample.labels.iter().collect();
    labels.sort();
    for (name, value) in labels {
        metric.mut_label().push(label_pair(name, value));
    }
    metric.set_timestamp_ms(sample.timestamp.timestamp_millis());

    match &sample.value {
        Value::Counter(v) => {
            let mut counter = Counter::default();
            counter.set_value(*v);
            metric.set_counter(counter);
        }
        Value::Gauge(v) => {
            let mut gauge = Gauge::default();
            gauge.set_value(*v);
            metric.set_gauge(gauge);
        }
        Value::Untyped(v) => {
            let mut untyped = Untyped::default();
            untyped.set_value(*v);
            metric.set_untyped(untyped);
        }
        Value::Histogram(counts) => {
            let mut histogram = Histogram::default();
            for count in counts {
                let mut bucket = Bucket::default();
                bucket.set_upper_bound(count.less_than);
                bucket.set_cumulative_count(count.count as u64);
                histogram.mut_bucket().push(bucket);
            }
            // Buckets are cumulative; the widest one holds every observation.
            let total = counts.iter().map(|c| c.count).fold(0.0, f64::max);
            histogram.set_sample_count(total as u64);
            metric.set_histogram(histogram);
        }
        Value::Summary(counts) => {
            let mut summary = Summary::default();
            for count in counts {
                let mut quantile = Quantile::default();
                quantile.set_quantile(count.quantile);
                quantile.set_value(count.count);
                summary.mut_quantile().push(quantile);
            }
            metric.set_summary(summary);
        }
    }

    metric
}

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

/// Attach the executor name to every sample.
pub fn label_with_executor(families: &mut [MetricFamily], executor_name: &str) {
    for family in families.iter_mut() {
        for metric in family.mut_metric().iter_mut() {
            let labels = metric.mut_label();
            match labels
                .iter_mut()
                .find(|pair| pair.get_name() == EXECUTOR_NAME_LABEL)
            {
                Some(pair) => pair.set_value(executor_name.to_string()),
                None => labels.push(label_pair(EXECUTOR_NAME_LABEL, executor_name)),
            }
        }
    }
}

#[derive(Debug)]
struct MetricsReport {
    executor_name: String,
    payload: String,
}

/// Handle for submitting executor metrics to the detached ingestion task.
#[derive(Debug, Clone)]
pub struct MetricsForwarder {
    tx: mpsc::UnboundedSender<MetricsReport>,
}

impl MetricsForwarder {
    /// Start the ingestion task. It exits once every forwarder is dropped.
    pub fn spawn(store: Arc<dyn MetricsStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<MetricsReport>();

        let handle = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                ingest(store.as_ref(), report).await;
            }
            tracing::debug!("Metrics forwarder stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a payload for ingestion. Never blocks.
    pub fn submit(&self, executor_name: &str, payload: String) {
        if payload.is_empty() {
            return;
        }
        let report = MetricsReport {
            executor_name: executor_name.to_string(),
            payload,
        };
        if self.tx.send(report).is_err() {
            tracing::warn!(executor = %executor_name, "Metrics forwarder closed, dropping payload");
        }
    }
}

async fn ingest(store: &dyn MetricsStore, report: MetricsReport) {
    let mut families = match decode_text(&report.payload) {
        Ok(families) => families,
        Err(e) => {
            tracing::error!(executor = %report.executor_name, error = %e, "Failed to decode executor metrics");
            return;
        }
    };
    if families.is_empty() {
        tracing::debug!(executor = %report.executor_name, "Executor metrics payload had no samples");
        return;
    }
    label_with_executor(&mut families, &report.executor_name);

    if let Err(e) = store.ingest(&report.executor_name, families).await {
        tracing::error!(executor = %report.executor_name, error = %e, "Failed to ingest executor metrics");
    }
}
