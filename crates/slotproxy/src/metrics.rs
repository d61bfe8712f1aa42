//! Proxy metrics: Prometheus collectors plus a periodic reporter.
//!
//! Each [`ProxyMetrics`] owns its own registry, so the collectors are not
//! process-global. The same numbers are exposed two ways: Prometheus text on
//! `/metrics`, and a [`MetricsSnapshot`] pushed to a [`MetricsSink`] every report period.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "slotproxy";

const TIME_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

const DEPTH_BUCKETS: &[f64] = &[
    0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Why a request was turned away without reaching the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    NoSlotAvailable,
    ShuttingDown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::NoSlotAvailable => "no_slot_available",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// How a forwarded request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

pub struct ProxyMetrics {
    registry: Registry,
    queue_wait: Histogram,
    processing: Histogram,
    pending: IntGauge,
    pending_depth: Histogram,
    rejected: IntCounterVec,
    finished: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let queue_wait = Histogram::with_opts(
            HistogramOpts::new(
                "queue_wait_seconds",
                "Time a task spent queued before a worker picked it up",
            )
            .namespace(NAMESPACE)
            .buckets(TIME_BUCKETS.to_vec()),
        )?;
        let processing = Histogram::with_opts(
            HistogramOpts::new(
                "processing_seconds",
                "Time from dequeue until the terminal event was delivered",
            )
            .namespace(NAMESPACE)
            .buckets(TIME_BUCKETS.to_vec()),
        )?;
        let pending = IntGauge::with_opts(
            Opts::new("pending_tasks", "Tasks accepted but not yet picked up by a worker")
                .namespace(NAMESPACE),
        )?;
        let pending_depth = Histogram::with_opts(
            HistogramOpts::new(
                "pending_tasks_depth",
                "Pending task count sampled on every accepted submission",
            )
            .namespace(NAMESPACE)
            .buckets(DEPTH_BUCKETS.to_vec()),
        )?;
        let rejected = IntCounterVec::new(
            Opts::new("rejected_tasks_total", "Requests rejected without reaching the backend")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let finished = IntCounterVec::new(
            Opts::new("requests_total", "Forwarded requests by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;

        registry.register(Box::new(queue_wait.clone()))?;
        registry.register(Box::new(processing.clone()))?;
        registry.register(Box::new(pending.clone()))?;
        registry.register(Box::new(pending_depth.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(finished.clone()))?;

        Ok(Self {
            registry,
            queue_wait,
            processing,
            pending,
            pending_depth,
            rejected,
            finished,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn task_accepted(&self) {
        self.pending.inc();
        self.pending_depth.observe(self.pending.get() as f64);
    }

    /// Recorded the instant a worker takes the task, before anything else.
    pub fn task_dequeued(&self, waited: Duration) {
        self.pending.dec();
        self.queue_wait.observe(waited.as_secs_f64());
    }

    /// An accepted task left the queue without being run (shutdown drain).
    pub fn task_withdrawn(&self) {
        self.pending.dec();
    }

    pub fn task_rejected(&self, reason: RejectReason) {
        self.rejected.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn request_finished(&self, outcome: Outcome, elapsed: Duration) {
        self.finished.with_label_values(&[outcome.as_str()]).inc();
        self.processing.observe(elapsed.as_secs_f64());
    }

    pub fn pending(&self) -> i64 {
        self.pending.get()
    }

    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected.with_label_values(&[reason.as_str()]).get()
    }

    pub fn finished(&self, outcome: Outcome) -> u64 {
        self.finished.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pending_tasks: self.pending.get(),
            pending_depth: HistogramSnapshot::of(&self.pending_depth),
            queue_wait: HistogramSnapshot::of(&self.queue_wait),
            processing: HistogramSnapshot::of(&self.processing),
            rejected_queue_full: self.rejected(RejectReason::QueueFull),
            rejected_no_slot: self.rejected(RejectReason::NoSlotAvailable),
            rejected_shutting_down: self.rejected(RejectReason::ShuttingDown),
            completed: self.finished(Outcome::Completed),
            cancelled: self.finished(Outcome::Cancelled),
            failed: self.finished(Outcome::Failed),
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
}

impl HistogramSnapshot {
    fn of(histogram: &Histogram) -> Self {
        let count = histogram.get_sample_count();
        let sum = histogram.get_sample_sum();
        let mean = if count == 0 { 0.0 } else { sum / count as f64 };
        Self { count, sum, mean }
    }
}

/// Point-in-time view of every proxy metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub pending_tasks: i64,
    pub pending_depth: HistogramSnapshot,
    /// Seconds.
    pub queue_wait: HistogramSnapshot,
    /// Seconds.
    pub processing: HistogramSnapshot,
    pub rejected_queue_full: u64,
    pub rejected_no_slot: u64,
    pub rejected_shutting_down: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

/// External receiver of periodic metric reports.
pub trait MetricsSink: Send + Sync {
    fn report(&self, snapshot: &MetricsSnapshot);
}

/// Reports through `tracing` under the `slotproxy::metrics` target.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn report(&self, s: &MetricsSnapshot) {
        tracing::info!(
            target: "slotproxy::metrics",
            pending_tasks = s.pending_tasks,
            pending_depth_mean = s.pending_depth.mean,
            queue_wait_count = s.queue_wait.count,
            queue_wait_mean_ms = s.queue_wait.mean * 1000.0,
            processing_count = s.processing.count,
            processing_mean_ms = s.processing.mean * 1000.0,
            rejected_queue_full = s.rejected_queue_full,
            rejected_no_slot = s.rejected_no_slot,
            completed = s.completed,
            cancelled = s.cancelled,
            failed = s.failed,
            "Metrics report"
        );
    }
}

/// Push a snapshot to `sink` every `period` until `cancel` fires.
pub fn spawn_reporter(
    metrics: Arc<ProxyMetrics>,
    sink: Arc<dyn MetricsSink>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sink.report(&metrics.snapshot()),
            }
        }
        tracing::debug!("Metrics reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn accepted_and_dequeued_move_pending_gauge() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.task_accepted();
        metrics.task_accepted();
        assert_eq!(metrics.pending(), 2);

        metrics.task_dequeued(Duration::from_millis(20));
        assert_eq!(metrics.pending(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_tasks, 1);
        assert_eq!(snapshot.queue_wait.count, 1);
        assert!((snapshot.queue_wait.sum - 0.02).abs() < 1e-9);
        // Depth sampled at 1 then 2.
        assert_eq!(snapshot.pending_depth.count, 2);
        assert!((snapshot.pending_depth.mean - 1.5).abs() < 1e-9);
    }

    #[test]
    fn rejections_counted_by_reason() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.task_rejected(RejectReason::QueueFull);
        metrics.task_rejected(RejectReason::QueueFull);
        metrics.task_rejected(RejectReason::NoSlotAvailable);

        assert_eq!(metrics.rejected(RejectReason::QueueFull), 2);
        assert_eq!(metrics.rejected(RejectReason::NoSlotAvailable), 1);
        assert_eq!(metrics.rejected(RejectReason::ShuttingDown), 0);
    }

    #[test]
    fn finished_requests_record_processing_time() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.request_finished(Outcome::Completed, Duration::from_secs(2));
        metrics.request_finished(Outcome::Cancelled, Duration::from_secs(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.processing.count, 2);
        assert!((snapshot.processing.mean - 1.5).abs() < 1e-9);
    }

    #[test]
    fn encode_exposes_namespaced_metrics() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.task_rejected(RejectReason::QueueFull);
        metrics.task_accepted();

        let text = metrics.encode().unwrap();
        assert!(text.contains("slotproxy_pending_tasks 1"));
        assert!(text.contains("slotproxy_rejected_tasks_total{reason=\"queue_full\"} 1"));
        assert!(text.contains("slotproxy_queue_wait_seconds_bucket"));
    }

    #[test]
    fn empty_snapshot_serializes() {
        let metrics = ProxyMetrics::new().unwrap();
        insta::assert_json_snapshot!(metrics.snapshot(), @r#"
        {
          "pending_tasks": 0,
          "pending_depth": {
            "count": 0,
            "sum": 0.0,
            "mean": 0.0
          },
          "queue_wait": {
            "count": 0,
            "sum": 0.0,
            "mean": 0.0
          },
          "processing": {
            "count": 0,
            "sum": 0.0,
            "mean": 0.0
          },
          "rejected_queue_full": 0,
          "rejected_no_slot": 0,
          "rejected_shutting_down": 0,
          "completed": 0,
          "cancelled": 0,
          "failed": 0
        }
        "#);
    }

    struct CountingSink(Mutex<Vec<MetricsSnapshot>>);

    impl MetricsSink for CountingSink {
        fn report(&self, snapshot: &MetricsSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn reporter_pushes_periodically_until_cancelled() {
        let metrics = Arc::new(ProxyMetrics::new().unwrap());
        let sink = Arc::new(CountingSink(Mutex::new(Vec::new())));
        let cancel = CancellationToken::new();

        metrics.task_rejected(RejectReason::QueueFull);
        let handle = spawn_reporter(
            Arc::clone(&metrics),
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
            Duration::from_millis(10),
            cancel.clone(),
        );

        crate::testing::wait_until(|| sink.0.lock().unwrap().len() >= 2).await;
        cancel.cancel();
        handle.await.unwrap();

        let reports = sink.0.lock().unwrap();
        assert_eq!(reports[0].rejected_queue_full, 1);
    }
}
