//! Test doubles shared by the unit tests: sinks and downstreams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::bridge::{CallObserver, ResponseEvent, ResponseSink, SinkError};
use crate::downstream::{ConnectError, Connector, Downstream, DownstreamError};
use crate::slot::{ChannelId, SlotPool};
use crate::status::ProxyError;

/// Events seen by a [`RecordingSink`].
#[derive(Clone, Default)]
pub struct Recorded(Arc<Mutex<Vec<ResponseEvent>>>);

impl Recorded {
    pub fn snapshot(&self) -> Vec<ResponseEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn terminal(&self) -> Option<ResponseEvent> {
        self.snapshot().into_iter().find(ResponseEvent::is_terminal)
    }

    pub fn terminal_count(&self) -> usize {
        self.snapshot().iter().filter(|e| e.is_terminal()).count()
    }
}

pub struct RecordingSink(Recorded);

impl RecordingSink {
    pub fn new() -> (Self, Recorded) {
        let recorded = Recorded::default();
        (Self(recorded.clone()), recorded)
    }

    fn push(&self, event: ResponseEvent) -> Result<(), SinkError> {
        self.0.0.lock().unwrap().push(event);
        Ok(())
    }
}

impl ResponseSink for RecordingSink {
    fn on_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.push(ResponseEvent::Chunk(chunk))
    }

    fn on_completed(&mut self) -> Result<(), SinkError> {
        self.push(ResponseEvent::Completed)
    }

    fn on_error(&mut self, error: ProxyError) -> Result<(), SinkError> {
        self.push(ResponseEvent::Error(error))
    }
}

/// Sink whose terminal delivery (and optionally chunk delivery) fails.
#[derive(Default)]
pub struct FailingSink {
    attempts: Arc<AtomicUsize>,
    fail_chunks: bool,
}

impl FailingSink {
    pub fn failing_chunks() -> Self {
        Self {
            attempts: Arc::default(),
            fail_chunks: true,
        }
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }
}

impl ResponseSink for FailingSink {
    fn on_chunk(&mut self, _chunk: Bytes) -> Result<(), SinkError> {
        if self.fail_chunks {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn on_completed(&mut self) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Failed("connection reset".to_string()))
    }

    fn on_error(&mut self, _error: ProxyError) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Failed("connection reset".to_string()))
    }
}

/// Sink that panics on every event.
pub struct PanickingSink;

impl ResponseSink for PanickingSink {
    fn on_chunk(&mut self, _chunk: Bytes) -> Result<(), SinkError> {
        panic!("sink exploded on chunk");
    }

    fn on_completed(&mut self) -> Result<(), SinkError> {
        panic!("sink exploded on completion");
    }

    fn on_error(&mut self, _error: ProxyError) -> Result<(), SinkError> {
        panic!("sink exploded on error");
    }
}

/// What a [`ScriptedDownstream`] does with every call.
#[derive(Clone)]
pub enum Script {
    Complete(Vec<Bytes>),
    Fail(Vec<Bytes>, DownstreamError),
}

/// Downstream that answers every call synchronously from a script and records
/// which channel served it.
pub struct ScriptedDownstream {
    channel: ChannelId,
    script: Script,
    served: Arc<Mutex<Vec<ChannelId>>>,
}

#[async_trait::async_trait]
impl Downstream for ScriptedDownstream {
    fn start(&self, _payload: Bytes, mut observer: CallObserver) {
        self.served.lock().unwrap().push(self.channel);
        match &self.script {
            Script::Complete(chunks) => {
                for chunk in chunks {
                    observer.on_next(chunk.clone());
                }
                observer.on_completed();
            }
            Script::Fail(chunks, error) => {
                for chunk in chunks {
                    observer.on_next(chunk.clone());
                }
                observer.on_error(error.clone());
            }
        }
    }
}

pub struct ScriptedConnector {
    pub script: Script,
    pub served: Arc<Mutex<Vec<ChannelId>>>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            served: Arc::default(),
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, channel: ChannelId) -> Result<Arc<dyn Downstream>, ConnectError> {
        Ok(Arc::new(ScriptedDownstream {
            channel,
            script: self.script.clone(),
            served: Arc::clone(&self.served),
        }))
    }
}

/// Calls parked by a [`HeldDownstream`], finished on demand by the test.
#[derive(Clone, Default)]
pub struct HeldCalls {
    calls: Arc<Mutex<Vec<(ChannelId, CallObserver)>>>,
    closed: Arc<AtomicUsize>,
}

impl HeldCalls {
    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    pub fn take_oldest(&self) -> Option<(ChannelId, CallObserver)> {
        let mut calls = self.calls.lock().unwrap();
        if calls.is_empty() {
            None
        } else {
            Some(calls.remove(0))
        }
    }

    /// Complete the oldest parked call with one chunk.
    pub fn complete_oldest(&self, chunk: &'static [u8]) -> Option<ChannelId> {
        let (channel, mut observer) = self.take_oldest()?;
        observer.on_next(Bytes::from_static(chunk));
        observer.on_completed();
        Some(channel)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Downstream that never finishes a call on its own.
pub struct HeldDownstream {
    channel: ChannelId,
    held: HeldCalls,
}

#[async_trait::async_trait]
impl Downstream for HeldDownstream {
    fn start(&self, _payload: Bytes, observer: CallObserver) {
        self.held
            .calls
            .lock()
            .unwrap()
            .push((self.channel, observer));
    }

    async fn close(&self) {
        self.held.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct HeldConnector(pub HeldCalls);

impl Connector for HeldConnector {
    fn connect(&self, channel: ChannelId) -> Result<Arc<dyn Downstream>, ConnectError> {
        Ok(Arc::new(HeldDownstream {
            channel,
            held: self.0.clone(),
        }))
    }
}

pub fn channels(n: u64) -> Vec<ChannelId> {
    (1..=n).map(ChannelId::new).collect()
}

pub fn held_pool(n: u64) -> (Arc<SlotPool>, HeldCalls) {
    let held = HeldCalls::default();
    let pool = SlotPool::connect(&channels(n), &HeldConnector(held.clone())).unwrap();
    (Arc::new(pool), held)
}

pub fn scripted_pool(n: u64, script: Script) -> (Arc<SlotPool>, Arc<Mutex<Vec<ChannelId>>>) {
    let connector = ScriptedConnector::new(script);
    let pool = SlotPool::connect(&channels(n), &connector).unwrap();
    (Arc::new(pool), connector.served)
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
