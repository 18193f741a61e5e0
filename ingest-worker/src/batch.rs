use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ingest_common::retry::{retry, RetryPolicy};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::HealthHandle;
use crate::metrics_utils::{
    BATCH_QUEUE_DEPTH, FLUSH_DROPPED_MESSAGES, FLUSH_ERRORS, MESSAGES_PRODUCED,
};
use crate::transport::{MessageSink, OutboundMessage, SinkError, TopicMessages};

struct Pending {
    topic: String,
    message: OutboundMessage,
}

/// Accumulates outbound messages and hands them to the sink in one batch per flush.
///
/// `push` never blocks on I/O. `flush` captures everything pushed so far and clears the buffer
/// before sending, so messages pushed while a send is in progress go out with the next flush.
/// Concurrent flushes are serialized.
pub struct BatchBuffer {
    pending: Mutex<Vec<Pending>>,
    flushing: tokio::sync::Mutex<()>,
    sink: Arc<dyn MessageSink>,
    retry: RetryPolicy,
}

impl BatchBuffer {
    pub fn new(sink: Arc<dyn MessageSink>, retry: RetryPolicy) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            sink,
            retry,
        }
    }

    pub fn push(&self, topic: &str, key: Option<String>, payload: Vec<u8>) {
        let mut pending = self.pending();
        pending.push(Pending {
            topic: topic.to_owned(),
            message: OutboundMessage { key, payload },
        });
        metrics::gauge!(BATCH_QUEUE_DEPTH).set(pending.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends everything buffered so far as a single batch, retrying with backoff.
    ///
    /// Returns the number of messages produced. On failure the captured messages are dropped:
    /// they are not put back into the buffer.
    pub async fn flush(&self) -> Result<usize, SinkError> {
        let _flushing = self.flushing.lock().await;

        let captured = std::mem::take(&mut *self.pending());
        metrics::gauge!(BATCH_QUEUE_DEPTH).set(0.0);
        if captured.is_empty() {
            return Ok(0);
        }

        let count = captured.len();
        let batch = group_by_topic(captured);

        if let Err(e) = retry(&self.retry, || self.sink.send_batch(&batch)).await {
            metrics::counter!(FLUSH_DROPPED_MESSAGES).increment(count as u64);
            return Err(e);
        }

        for group in &batch {
            metrics::counter!(MESSAGES_PRODUCED, "topic" => group.topic.clone())
                .increment(group.messages.len() as u64);
        }
        debug!(count, topics = batch.len(), "flushed batch");
        Ok(count)
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Topics keep first-appearance order, messages keep push order within a topic.
fn group_by_topic(pending: Vec<Pending>) -> Vec<TopicMessages> {
    let mut groups: Vec<TopicMessages> = Vec::new();
    for Pending { topic, message } in pending {
        match groups.iter_mut().find(|group| group.topic == topic) {
            Some(group) => group.messages.push(message),
            None => groups.push(TopicMessages {
                topic,
                messages: vec![message],
            }),
        }
    }
    groups
}

/// Flushes `buffer` every `interval` until `shutdown` is cancelled. A zero interval is treated
/// as one millisecond.
///
/// Flush failures are logged and counted, never propagated. The final flush after
/// cancellation is left to the caller.
pub async fn run_flush_loop(
    buffer: Arc<BatchBuffer>,
    interval: Duration,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        liveness.report_healthy();
        if let Err(e) = buffer.flush().await {
            metrics::counter!(FLUSH_ERRORS).increment(1);
            error!(error = %e, "failed to flush batch, messages were dropped");
        }
    }
    info!("flush loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::test_utils::{MemorySink, SendGate};

    fn no_retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::from_millis(1))
    }

    fn message(key: &str) -> OutboundMessage {
        OutboundMessage {
            key: Some(key.to_owned()),
            payload: key.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_flush_groups_by_topic_in_push_order() {
        let sink = Arc::new(MemorySink::new());
        let buffer = BatchBuffer::new(sink.clone(), no_retry());

        buffer.push("a", Some("1".to_owned()), b"1".to_vec());
        buffer.push("b", Some("2".to_owned()), b"2".to_vec());
        buffer.push("a", Some("3".to_owned()), b"3".to_vec());

        assert_eq!(buffer.flush().await.unwrap(), 3);

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                TopicMessages {
                    topic: "a".to_owned(),
                    messages: vec![message("1"), message("3")],
                },
                TopicMessages {
                    topic: "b".to_owned(),
                    messages: vec![message("2")],
                },
            ]
        );
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_send() {
        let sink = Arc::new(MemorySink::new());
        let buffer = BatchBuffer::new(sink.clone(), no_retry());

        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_pushes_during_send_go_to_next_flush() {
        let gate = Arc::new(SendGate::new());
        let sink = Arc::new(MemorySink::with_gate(gate.clone()));
        let buffer = Arc::new(BatchBuffer::new(sink.clone(), no_retry()));

        for key in ["1", "2", "3"] {
            buffer.push("domain", Some(key.to_owned()), key.as_bytes().to_vec());
        }

        let flushing = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.flush().await })
        };
        gate.entered().await;

        buffer.push("domain", Some("4".to_owned()), b"4".to_vec());
        buffer.push("domain", Some("5".to_owned()), b"5".to_vec());
        assert_eq!(buffer.len(), 2);

        gate.release();
        assert_eq!(flushing.await.unwrap().unwrap(), 3);
        assert_eq!(sink.produced("domain"), vec![message("1"), message("2"), message("3")]);

        gate.release();
        assert_eq!(buffer.flush().await.unwrap(), 2);

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].messages, vec![message("4"), message("5")]);
    }

    #[tokio::test]
    async fn test_flush_retries_then_succeeds() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_batches(2);
        let buffer = BatchBuffer::new(sink.clone(), RetryPolicy::new(2, Duration::from_millis(1)));

        buffer.push("domain", None, b"x".to_vec());

        assert_eq!(buffer.flush().await.unwrap(), 1);
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_messages() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_batches(3);
        let buffer = BatchBuffer::new(sink.clone(), RetryPolicy::new(2, Duration::from_millis(1)));

        buffer.push("domain", None, b"x".to_vec());

        assert!(buffer.flush().await.is_err());
        assert!(buffer.is_empty());
        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_flush_loop_survives_failures_and_stops_on_cancel() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_batches(1);
        let buffer = Arc::new(BatchBuffer::new(sink.clone(), no_retry()));
        let registry = HealthRegistry::new("liveness");
        let shutdown = CancellationToken::new();

        buffer.push("domain", None, b"lost".to_vec());
        let flush_loop = tokio::spawn(run_flush_loop(
            buffer.clone(),
            Duration::from_millis(10),
            registry.register("flusher", Duration::from_secs(30)),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        buffer.push("domain", None, b"kept".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        flush_loop.await.unwrap();

        assert!(registry.get_status().healthy);
        let produced = sink.produced("domain");
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].payload, b"kept");
    }
}
