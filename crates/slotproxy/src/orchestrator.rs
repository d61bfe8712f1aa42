//! ProxyOrchestrator: admission, slot leasing and forwarding for every request.
//!
//! Request lifecycle:
//! ```text
//! Received → Enqueued → Dequeued → Forwarding → Completed | Errored
//!    │                     │
//!    └→ Rejected(QueueFull) └→ Rejected(NoSlotAvailable)
//! ```
//! Every request reaches exactly one terminal state, and that state is
//! delivered to its sink exactly once. Nothing is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;

use crate::admission::{AdmitError, AdmitterConfig, DEFAULT_QUEUE_CAPACITY, RequestAdmitter};
use crate::bridge::{CallBridge, ResponseSink, Terminal, deliver_terminal};
use crate::health::{Health, HealthSnapshot};
use crate::metrics::{Outcome, ProxyMetrics, RejectReason};
use crate::request::{InboundRequest, RequestId};
use crate::slot::SlotPool;
use crate::status::ProxyError;
use crate::version::VersionInfo;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue_capacity: usize,
    /// How long busy workers may keep forwarding once shutdown starts.
    pub shutdown_grace: Duration,
    pub version: VersionInfo,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace: Duration::from_secs(30),
            version: VersionInfo::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }
}

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Queued; the sink will see the response stream.
    Accepted(RequestId),
    /// The sink has already been sent this error.
    Rejected(RequestId, ProxyError),
}

impl Admission {
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Accepted(id) | Self::Rejected(id, _) => *id,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Counts workers between slot acquire and release.
struct ForwardingGuard(Arc<AtomicUsize>);

impl ForwardingGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ForwardingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker-side half: runs one dequeued request to its terminal event.
struct Forwarder {
    pool: Arc<SlotPool>,
    metrics: Arc<ProxyMetrics>,
    forwarding: Arc<AtomicUsize>,
}

impl Forwarder {
    async fn forward(&self, request: InboundRequest) {
        let InboundRequest {
            id,
            payload,
            mut sink,
        } = request;
        let started = Instant::now();

        let Some(lease) = self.pool.acquire() else {
            tracing::warn!(request_id = %id, "No payment channel available");
            self.metrics.task_rejected(RejectReason::NoSlotAvailable);
            deliver_terminal(sink.as_mut(), id, Err(ProxyError::NoSlotAvailable));
            return;
        };

        let forwarding = ForwardingGuard::enter(&self.forwarding);
        let channel = lease.channel();
        tracing::info!(request_id = %id, %channel, "Using payment channel");
        tracing::debug!(request_id = %id, bytes = payload.len(), "Forwarding request payload");

        let (bridge, observer) = CallBridge::new(id, channel, sink);
        lease.downstream().start(payload, observer);
        let terminal = bridge.await_terminal().await;

        drop(forwarding);
        lease.release();

        let outcome = match terminal {
            Terminal::Completed { .. } => Outcome::Completed,
            Terminal::Errored { expected: true, .. } => Outcome::Cancelled,
            Terminal::Errored { .. } | Terminal::Abandoned => Outcome::Failed,
        };
        self.metrics.request_finished(outcome, started.elapsed());
    }
}

pub struct ProxyOrchestrator {
    config: OrchestratorConfig,
    pool: Arc<SlotPool>,
    metrics: Arc<ProxyMetrics>,
    admitter: RequestAdmitter<InboundRequest>,
    forwarding: Arc<AtomicUsize>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyOrchestrator {
    /// Spawn one worker per slot. Must be called inside a tokio runtime.
    pub fn start(
        pool: Arc<SlotPool>,
        config: OrchestratorConfig,
        metrics: Arc<ProxyMetrics>,
    ) -> Arc<Self> {
        let forwarding = Arc::new(AtomicUsize::new(0));
        let forwarder = Arc::new(Forwarder {
            pool: Arc::clone(&pool),
            metrics: Arc::clone(&metrics),
            forwarding: Arc::clone(&forwarding),
        });

        let admitter = RequestAdmitter::spawn(
            AdmitterConfig::new(pool.len()).with_queue_capacity(config.queue_capacity),
            Arc::clone(&metrics),
            move |request| {
                let forwarder = Arc::clone(&forwarder);
                async move { forwarder.forward(request).await }
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            pool,
            metrics,
            admitter,
            forwarding,
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Admit or reject a request. Never blocks.
    ///
    /// A rejection is delivered to `sink` before this returns.
    pub fn submit<S: ResponseSink>(&self, payload: impl Into<Bytes>, sink: S) -> Admission {
        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let payload = payload.into();
        tracing::debug!(request_id = %id, bytes = payload.len(), "Request received");

        let request = InboundRequest {
            id,
            payload,
            sink: Box::new(sink),
        };

        let (error, request) = match self.admitter.submit(request) {
            Ok(()) => {
                tracing::debug!(request_id = %id, "Request enqueued");
                return Admission::Accepted(id);
            }
            Err(AdmitError::QueueFull(request)) => (ProxyError::QueueFull, request),
            Err(AdmitError::Closed(request)) => {
                self.metrics.task_rejected(RejectReason::ShuttingDown);
                (ProxyError::ShuttingDown, request)
            }
        };

        tracing::warn!(request_id = %id, error = %error, "Request rejected");
        let mut sink = request.sink;
        deliver_terminal(sink.as_mut(), id, Err(error.clone()));
        Admission::Rejected(id, error)
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Workers currently holding a slot.
    pub fn forwarding(&self) -> usize {
        self.forwarding.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow() || self.admitter.is_closed()
    }

    pub fn health(&self) -> HealthSnapshot {
        let available_slots = self.pool.available();
        HealthSnapshot {
            status: Health::from_counts(available_slots, self.is_shutting_down()),
            available_slots,
            total_slots: self.pool.len(),
            forwarding: self.forwarding(),
            pending_tasks: self.metrics.pending(),
            queue_capacity: self.config.queue_capacity,
            version: self.config.version.clone(),
        }
    }

    /// Ask the hosting transport to stop. The transport then calls [`shutdown`](Self::shutdown).
    pub fn trigger_shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop admitting, answer queued requests with `ShuttingDown`, let in-flight
    /// calls finish within the grace period, then close every payment channel.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        tracing::info!(
            forwarding = self.forwarding(),
            pending = self.metrics.pending(),
            "Shutting down proxy"
        );

        for request in self.admitter.shutdown(self.config.shutdown_grace).await {
            let InboundRequest { id, mut sink, .. } = request;
            self.metrics.task_rejected(RejectReason::ShuttingDown);
            deliver_terminal(sink.as_mut(), id, Err(ProxyError::ShuttingDown));
        }

        self.pool.close().await;
        tracing::info!("Proxy shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ResponseEvent;
    use crate::downstream::{Code, DownstreamError};
    use crate::slot::{ChannelId, SlotState};
    use crate::testing::{
        FailingSink, PanickingSink, RecordingSink, Script, held_pool, scripted_pool, wait_until,
    };

    fn metrics() -> Arc<ProxyMetrics> {
        Arc::new(ProxyMetrics::new().unwrap())
    }

    fn start(pool: Arc<SlotPool>, queue: usize) -> Arc<ProxyOrchestrator> {
        ProxyOrchestrator::start(
            pool,
            OrchestratorConfig::default()
                .with_queue_capacity(queue)
                .with_shutdown_grace(Duration::from_millis(200)),
            metrics(),
        )
    }

    fn complete(chunks: &[&'static [u8]]) -> Script {
        Script::Complete(chunks.iter().map(|c| Bytes::from_static(c)).collect())
    }

    #[tokio::test]
    async fn two_slots_queue_one_rejects_the_fourth() {
        let (pool, held) = held_pool(2);
        let proxy = start(pool, 1);

        let mut recorded = Vec::new();
        let admissions: Vec<Admission> = (0..4u8)
            .map(|i| {
                let (sink, events) = RecordingSink::new();
                recorded.push(events);
                proxy.submit(vec![i], sink)
            })
            .collect();

        assert!(admissions[..3].iter().all(Admission::is_accepted));
        assert_eq!(
            admissions[3],
            Admission::Rejected(RequestId::new(4), ProxyError::QueueFull)
        );
        assert_eq!(
            recorded[3].snapshot(),
            vec![ResponseEvent::Error(ProxyError::QueueFull)]
        );

        // Requests 1 and 2 hold both slots, request 3 waits for one.
        wait_until(|| held.len() == 2).await;
        assert_eq!(proxy.forwarding(), 2);
        assert_eq!(proxy.pool().busy(), 2);
        assert_eq!(proxy.metrics().pending(), 1);
        assert_eq!(proxy.metrics().rejected(RejectReason::QueueFull), 1);
        assert!(recorded[2].snapshot().is_empty());
    }

    #[tokio::test]
    async fn queued_request_takes_slot_freed_by_previous() {
        let (pool, held) = held_pool(1);
        let proxy = start(pool, 5);

        let (sink_a, events_a) = RecordingSink::new();
        let (sink_b, events_b) = RecordingSink::new();

        assert!(proxy.submit("a", sink_a).is_accepted());
        wait_until(|| held.len() == 1).await;

        // B is accepted without waiting on A.
        assert!(proxy.submit("b", sink_b).is_accepted());
        assert_eq!(proxy.metrics().pending(), 1);

        assert_eq!(held.complete_oldest(b"A"), Some(ChannelId::new(1)));
        wait_until(|| held.len() == 1).await;
        assert_eq!(proxy.metrics().pending(), 0);
        assert_eq!(held.channels(), vec![ChannelId::new(1)]);

        held.complete_oldest(b"B");
        wait_until(|| events_b.terminal_count() == 1).await;

        assert_eq!(
            events_a.snapshot(),
            vec![
                ResponseEvent::Chunk(Bytes::from_static(b"A")),
                ResponseEvent::Completed
            ]
        );
        assert_eq!(
            events_b.snapshot(),
            vec![
                ResponseEvent::Chunk(Bytes::from_static(b"B")),
                ResponseEvent::Completed
            ]
        );
        wait_until(|| proxy.forwarding() == 0).await;
        assert_eq!(proxy.pool().busy(), 0);
    }

    #[tokio::test]
    async fn up_to_slot_count_all_admitted_and_forwarded() {
        let (pool, held) = held_pool(3);
        let proxy = start(pool, 0);

        for _ in 0..3 {
            let (sink, _events) = RecordingSink::new();
            assert!(proxy.submit("x", sink).is_accepted());
        }
        wait_until(|| held.len() == 3).await;

        let mut channels = held.channels();
        channels.sort();
        assert_eq!(
            channels,
            vec![ChannelId::new(1), ChannelId::new(2), ChannelId::new(3)]
        );
        assert_eq!(proxy.forwarding(), proxy.pool().busy());
    }

    #[tokio::test]
    async fn sequential_requests_rotate_through_channels() {
        let (pool, served) = scripted_pool(3, complete(&[b"ok"]));
        let proxy = start(pool, 10);

        for i in 0..4u8 {
            let (sink, events) = RecordingSink::new();
            proxy.submit(vec![i], sink);
            wait_until(|| events.terminal_count() == 1).await;
        }

        let served: Vec<u64> = served.lock().unwrap().iter().map(ChannelId::get).collect();
        assert_eq!(served, vec![1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn chunks_relayed_verbatim_in_order() {
        let (pool, _served) = scripted_pool(1, complete(&[b"one", b"", b"three"]));
        let proxy = start(pool, 1);

        let (sink, events) = RecordingSink::new();
        proxy.submit("payload", sink);
        wait_until(|| events.terminal_count() == 1).await;

        assert_eq!(
            events.snapshot(),
            vec![
                ResponseEvent::Chunk(Bytes::from_static(b"one")),
                ResponseEvent::Chunk(Bytes::new()),
                ResponseEvent::Chunk(Bytes::from_static(b"three")),
                ResponseEvent::Completed,
            ]
        );
        wait_until(|| proxy.metrics().finished(Outcome::Completed) == 1).await;
    }

    #[tokio::test]
    async fn cancellation_and_failure_look_the_same_to_caller() {
        let cancelled = DownstreamError::cancelled("client went away");
        let failed = DownstreamError::new(Code::Internal, "backend crashed");

        for (error, outcome) in [
            (cancelled, Outcome::Cancelled),
            (failed, Outcome::Failed),
        ] {
            let (pool, _served) = scripted_pool(1, Script::Fail(vec![], error.clone()));
            let proxy = start(pool, 1);

            let (sink, events) = RecordingSink::new();
            proxy.submit("x", sink);
            wait_until(|| events.terminal_count() == 1).await;

            assert_eq!(
                events.snapshot(),
                vec![ResponseEvent::Error(ProxyError::Downstream(error))]
            );
            wait_until(|| proxy.metrics().finished(outcome) == 1).await;
            assert_eq!(proxy.pool().busy(), 0);
        }
    }

    #[tokio::test]
    async fn failing_sink_still_releases_slot_once() {
        let (pool, _served) = scripted_pool(1, complete(&[b"data"]));
        let proxy = start(pool, 2);

        let sink = FailingSink::default();
        let attempts = sink.attempts();
        proxy.submit("x", sink);
        wait_until(|| proxy.metrics().finished(Outcome::Completed) == 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.pool().state_of(ChannelId::new(1)), Some(SlotState::Free));

        // The slot is usable again.
        let (sink, events) = RecordingSink::new();
        proxy.submit("y", sink);
        wait_until(|| events.terminal_count() == 1).await;
        assert_eq!(events.terminal(), Some(ResponseEvent::Completed));
    }

    #[tokio::test]
    async fn panicking_sink_does_not_kill_worker() {
        let (pool, _served) = scripted_pool(1, complete(&[b"data"]));
        let proxy = start(pool, 2);

        proxy.submit("x", PanickingSink);
        wait_until(|| proxy.metrics().finished(Outcome::Completed) == 1).await;

        let (sink, events) = RecordingSink::new();
        proxy.submit("y", sink);
        wait_until(|| events.terminal_count() == 1).await;
        assert_eq!(proxy.pool().busy(), 0);
    }

    #[tokio::test]
    async fn disabled_pool_answers_no_slot_available() {
        let (pool, held) = held_pool(1);
        pool.disable(ChannelId::new(1));
        let proxy = start(pool, 1);

        let (sink, events) = RecordingSink::new();
        assert!(proxy.submit("x", sink).is_accepted());
        wait_until(|| events.terminal_count() == 1).await;

        assert_eq!(
            events.snapshot(),
            vec![ResponseEvent::Error(ProxyError::NoSlotAvailable)]
        );
        assert_eq!(
            proxy.metrics().rejected(RejectReason::NoSlotAvailable),
            1
        );
        assert_eq!(held.len(), 0);
        assert_eq!(proxy.health().status, Health::Busy);
    }

    #[tokio::test]
    async fn request_ids_are_sequential() {
        let (pool, _held) = held_pool(1);
        let proxy = start(pool, 5);

        let ids: Vec<u64> = (0..3)
            .map(|_| {
                let (sink, _events) = RecordingSink::new();
                proxy.submit("x", sink).request_id().get()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn health_tracks_slot_usage() {
        let (pool, held) = held_pool(1);
        let proxy = start(pool, 3);
        assert_eq!(proxy.health().status, Health::Ready);

        let (sink, _events) = RecordingSink::new();
        proxy.submit("x", sink);
        wait_until(|| held.len() == 1).await;

        let health = proxy.health();
        assert_eq!(health.status, Health::Busy);
        assert_eq!(health.available_slots, 0);
        assert_eq!(health.total_slots, 1);
        assert_eq!(health.forwarding, 1);
        assert_eq!(health.queue_capacity, 3);

        held.complete_oldest(b"done");
        wait_until(|| proxy.health().status == Health::Ready).await;
    }

    #[tokio::test]
    async fn shutdown_answers_queued_requests_and_closes_channels() {
        let (pool, held) = held_pool(1);
        let proxy = start(pool, 5);

        let (sink_a, events_a) = RecordingSink::new();
        let (sink_b, events_b) = RecordingSink::new();
        proxy.submit("a", sink_a);
        wait_until(|| held.len() == 1).await;
        proxy.submit("b", sink_b);

        // Finish A while shutdown waits out the grace period.
        let finisher = {
            let held = held.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                held.complete_oldest(b"A");
            })
        };
        proxy.shutdown().await;
        finisher.await.unwrap();

        assert_eq!(events_a.terminal(), Some(ResponseEvent::Completed));
        assert_eq!(
            events_b.snapshot(),
            vec![ResponseEvent::Error(ProxyError::ShuttingDown)]
        );
        assert_eq!(held.closed(), 1);
        assert_eq!(proxy.health().status, Health::ShuttingDown);

        let (sink_c, events_c) = RecordingSink::new();
        assert_eq!(
            proxy.submit("c", sink_c),
            Admission::Rejected(RequestId::new(3), ProxyError::ShuttingDown)
        );
        assert_eq!(events_c.terminal_count(), 1);
        assert_eq!(
            proxy.metrics().rejected(RejectReason::ShuttingDown),
            2
        );
    }

    #[tokio::test]
    async fn trigger_shutdown_notifies_watchers() {
        let (pool, _held) = held_pool(1);
        let proxy = start(pool, 1);
        let mut rx = proxy.shutdown_rx();

        proxy.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(proxy.is_shutting_down());
    }
}
