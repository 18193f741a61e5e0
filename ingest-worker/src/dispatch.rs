use std::sync::Arc;
use std::time::Duration;

use ingest_common::envelope::{DomainEvent, RawMessage};
use ingest_common::registry::PluginRegistry;
use ingest_common::retry::{retry_if, RetryPolicy};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::batch::BatchBuffer;
use crate::error::DispatchError;
use crate::inflight::InFlightTracker;
use crate::metrics_utils::{
    StageTimer, CONSUMER_ERRORS, DEAD_LETTER, DEAD_LETTER_ERRORS, DISPATCH_SATURATION,
    MESSAGES_CONSUMED, OFFSET_STORE_ERRORS, PROCESSING_ERRORS, UNKNOWN_TOPIC, UPSERTS,
};
use crate::transport::{
    Acknowledgement, InboundMessage, MessageSink, MessageSource, OutboundMessage, SourceError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub raw: String,
    pub domain: String,
    pub dead_letter: String,
}

impl Topics {
    pub fn classify(&self, topic: &str) -> Option<Stage> {
        if topic == self.raw {
            Some(Stage::Raw)
        } else if topic == self.domain {
            Some(Stage::Domain)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Tool output, normalized into domain events
    Raw,
    /// Domain events, upserted into storage
    Domain,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Domain => "domain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No plugin is registered for the message's tool or event type.
    NoHandler,
    /// The normalizer ran and this many events were buffered for the domain topic.
    Normalized(usize),
    Upserted,
    /// The message came from a topic this worker does not handle.
    UnknownTopic,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub topics: Topics,
    pub retry: RetryPolicy,
    /// Send malformed messages to the dead letter topic without spending retries on them.
    pub dead_letter_terminal_errors: bool,
    pub max_concurrent: usize,
}

/// Routes consumed messages to the plugin for their stage.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    buffer: Arc<BatchBuffer>,
    inflight: InFlightTracker,
    sink: Arc<dyn MessageSink>,
    settings: DispatchSettings,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PluginRegistry>,
        buffer: Arc<BatchBuffer>,
        inflight: InFlightTracker,
        sink: Arc<dyn MessageSink>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            buffer,
            inflight,
            sink,
            settings,
            tasks: TaskTracker::new(),
        }
    }

    /// Runs one dispatch attempt for a payload of the given stage.
    pub async fn dispatch(
        &self,
        stage: Stage,
        payload: &[u8],
    ) -> Result<DispatchOutcome, DispatchError> {
        match stage {
            Stage::Raw => self.dispatch_raw(payload),
            Stage::Domain => self.dispatch_domain(payload).await,
        }
    }

    fn dispatch_raw(&self, payload: &[u8]) -> Result<DispatchOutcome, DispatchError> {
        let timer = StageTimer::start(Stage::Raw.as_str());
        let raw = RawMessage::from_slice(payload)?;

        let Some(normalizer) = self.registry.normalizer(&raw.tool) else {
            debug!(tool = raw.tool, "no normalizer registered, skipping");
            return Ok(DispatchOutcome::NoHandler);
        };

        let events = normalizer
            .normalize(&raw)
            .map_err(|source| DispatchError::Normalizer {
                tool: raw.tool.clone(),
                source,
            })?
            .unwrap_or_default();

        // Serialize everything first: one bad event fails the message and nothing is buffered.
        let mut encoded = Vec::with_capacity(events.len());
        for event in &events {
            let invalid = |source| DispatchError::InvalidEvent {
                tool: raw.tool.clone(),
                source,
            };
            event.validate().map_err(invalid)?;
            encoded.push((event.fingerprint().to_owned(), event.to_vec().map_err(invalid)?));
        }

        for (fingerprint, bytes) in encoded {
            self.buffer
                .push(&self.settings.topics.domain, Some(fingerprint), bytes);
        }

        timer.fin();
        Ok(DispatchOutcome::Normalized(events.len()))
    }

    async fn dispatch_domain(&self, payload: &[u8]) -> Result<DispatchOutcome, DispatchError> {
        let timer = StageTimer::start(Stage::Domain.as_str());
        let event = DomainEvent::from_slice(payload)?;

        let Some(upserter) = self.registry.upserter(event.event_type()) else {
            debug!(
                event_type = event.event_type(),
                "no upserter registered, skipping"
            );
            return Ok(DispatchOutcome::NoHandler);
        };

        self.inflight
            .track(upserter.upsert(&event))
            .await
            .map_err(|source| DispatchError::Upserter {
                event_type: event.event_type().to_owned(),
                source,
            })?;

        metrics::counter!(UPSERTS, "backend" => upserter.backend()).increment(1);
        timer.fin();
        Ok(DispatchOutcome::Upserted)
    }

    /// Fully handles one consumed message: dispatch with retries, dead-lettering on exhaustion,
    /// then acknowledgement so its offset can be committed.
    ///
    /// Returns the result of the last dispatch attempt. The message is settled either way.
    pub async fn process(&self, message: InboundMessage) -> Result<DispatchOutcome, DispatchError> {
        let InboundMessage {
            topic,
            payload,
            ack,
        } = message;

        let Some(stage) = self.settings.topics.classify(&topic) else {
            warn!(topic, "received message from unexpected topic, dropping");
            metrics::counter!(UNKNOWN_TOPIC, "topic" => topic).increment(1);
            settle(ack);
            return Ok(DispatchOutcome::UnknownTopic);
        };
        metrics::counter!(MESSAGES_CONSUMED, "topic" => topic.clone()).increment(1);

        let fast_fail = self.settings.dead_letter_terminal_errors;
        let result = retry_if(
            &self.settings.retry,
            || self.dispatch(stage, &payload),
            |e: &DispatchError| !fast_fail || e.is_retryable(),
        )
        .await;

        if let Err(e) = &result {
            metrics::counter!(
                PROCESSING_ERRORS,
                "topic" => topic.clone(),
                "stage" => stage.as_str(),
                "reason" => e.reason()
            )
            .increment(1);
            error!(
                topic,
                stage = stage.as_str(),
                error = %e,
                "failed to process message, sending to dead letter topic"
            );
            self.dead_letter(&topic, payload).await;
        }

        settle(ack);
        result
    }

    /// Best effort: a failed dead letter publish is logged and counted, the message still
    /// counts as handled.
    async fn dead_letter(&self, source_topic: &str, payload: Vec<u8>) {
        let dead_letter_topic = &self.settings.topics.dead_letter;
        let message = OutboundMessage { key: None, payload };

        match self.sink.send(dead_letter_topic, &[message]).await {
            Ok(()) => {
                metrics::counter!(DEAD_LETTER, "topic" => source_topic.to_owned()).increment(1);
            }
            Err(e) => {
                metrics::counter!(DEAD_LETTER_ERRORS, "topic" => source_topic.to_owned())
                    .increment(1);
                error!(
                    topic = source_topic,
                    dead_letter_topic,
                    error = %e,
                    "failed to publish to dead letter topic"
                );
            }
        }
    }

    /// Receives from `source` until `shutdown` is cancelled or the source closes, processing
    /// each message on its own task. At most `max_concurrent` messages are processed at once.
    pub async fn run(self: Arc<Self>, source: Arc<dyn MessageSource>, shutdown: CancellationToken) {
        let max_concurrent = self.settings.max_concurrent.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrent));

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = source.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(SourceError::Closed) => {
                    info!("message source closed");
                    break;
                }
                Err(e) => {
                    metrics::counter!(CONSUMER_ERRORS).increment(1);
                    error!(error = %e, "failed to receive message");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Not processed, so not acknowledged: it will be redelivered.
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let in_use = max_concurrent - permits.available_permits();
            metrics::gauge!(DISPATCH_SATURATION)
                .set(in_use as f64 / max_concurrent as f64 * 100.0);

            let dispatcher = self.clone();
            self.tasks.spawn(async move {
                if let Ok(outcome) = dispatcher.process(message).await {
                    debug!(?outcome, "message settled");
                }
                drop(permit);
            });
        }
        info!("dispatch loop stopped");
    }

    /// Waits for every message handed to a processing task to settle.
    pub async fn wait_for_dispatches(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn inflight(&self) -> &InFlightTracker {
        &self.inflight
    }
}

fn settle(ack: Option<Box<dyn Acknowledgement>>) {
    if let Some(ack) = ack {
        if let Err(e) = ack.ack() {
            metrics::counter!(OFFSET_STORE_ERRORS).increment(1);
            warn!(error = %e, "failed to store message offset");
        }
    }
}
