//! In-memory transport doubles for exercising the pipeline without a broker.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::warn;

use crate::transport::{
    InboundMessage, MessageSink, MessageSource, OutboundMessage, SinkError, SourceError,
    TopicMessages,
};

/// Holds `send_batch` calls until released, to observe what happens while a send is in flight.
pub struct SendGate {
    entered: Notify,
    release: Semaphore,
}

impl Default for SendGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SendGate {
    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Resolves once a `send_batch` call is blocked on the gate.
    pub async fn entered(&self) {
        self.entered.notified().await
    }

    /// Lets one blocked `send_batch` call proceed.
    pub fn release(&self) {
        self.release.add_permits(1)
    }
}

#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<TopicMessages>>>,
    direct: Mutex<Vec<TopicMessages>>,
    batch_failures: AtomicUsize,
    fail_direct: AtomicBool,
    gate: Option<Arc<SendGate>>,
    loopback: Mutex<Option<(String, mpsc::UnboundedSender<InboundMessage>)>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gate(gate: Arc<SendGate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Makes the next `count` calls to `send_batch` fail.
    pub fn fail_batches(&self, count: usize) {
        self.batch_failures.store(count, Ordering::SeqCst)
    }

    /// Makes every direct `send` fail.
    pub fn fail_direct_sends(&self) {
        self.fail_direct.store(true, Ordering::SeqCst)
    }

    /// Feeds every batched message produced to `topic` back into a source.
    pub fn loopback(&self, topic: &str, source: &ChannelSource) {
        *lock(&self.loopback) = Some((topic.to_owned(), source.sender()));
    }

    /// Successful `send_batch` calls, in call order.
    pub fn batches(&self) -> Vec<Vec<TopicMessages>> {
        lock(&self.batches).clone()
    }

    /// Every message successfully produced to `topic` through `send_batch`.
    pub fn produced(&self, topic: &str) -> Vec<OutboundMessage> {
        lock(&self.batches)
            .iter()
            .flatten()
            .filter(|group| group.topic == topic)
            .flat_map(|group| group.messages.iter().cloned())
            .collect()
    }

    /// Every message successfully produced to `topic` through direct `send` calls.
    pub fn sent(&self, topic: &str) -> Vec<OutboundMessage> {
        lock(&self.direct)
            .iter()
            .filter(|group| group.topic == topic)
            .flat_map(|group| group.messages.iter().cloned())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send_batch(&self, batch: &[TopicMessages]) -> Result<(), SinkError> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }

        let failing = self
            .batch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("injected batch failure".to_owned()));
        }

        lock(&self.batches).push(batch.to_vec());

        if let Some((topic, sender)) = lock(&self.loopback).as_ref() {
            for group in batch.iter().filter(|group| &group.topic == topic) {
                for message in &group.messages {
                    let looped = InboundMessage::new(topic.clone(), message.payload.clone());
                    if sender.send(looped).is_err() {
                        warn!(topic, "loopback source is gone, dropping produced message");
                    }
                }
            }
        }
        Ok(())
    }

    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<(), SinkError> {
        if self.fail_direct.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("injected send failure".to_owned()));
        }
        lock(&self.direct).push(TopicMessages {
            topic: topic.to_owned(),
            messages: messages.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ChannelSource {
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    closed: AtomicBool,
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSource {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<InboundMessage> {
        self.sender.clone()
    }

    pub fn push(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        if self.sender.send(InboundMessage::new(topic, payload)).is_err() {
            warn!(topic, "channel source receiver closed, dropping message");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&self) -> Result<InboundMessage, SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed);
        }
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(SourceError::Closed)
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.store(true, Ordering::SeqCst);
        self.receiver.lock().await.close();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
