//! The message transport seam between the pipeline and the log broker.
use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("kafka delivery was canceled")]
    Canceled,
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to consume from kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("message source is closed")]
    Closed,
    #[error("consumer was dropped before the offset could be stored")]
    ConsumerGone,
}

/// Marks a consumed message as settled so its offset may be committed.
pub trait Acknowledgement: Send {
    fn ack(self: Box<Self>) -> Result<(), SourceError>;
}

pub struct InboundMessage {
    pub topic: String,
    /// Empty when the broker delivered a message without a payload.
    pub payload: Vec<u8>,
    pub ack: Option<Box<dyn Acknowledgement>>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ack: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Messages bound for one topic, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessages {
    pub topic: String,
    pub messages: Vec<OutboundMessage>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next message from any subscribed topic.
    async fn recv(&self) -> Result<InboundMessage, SourceError>;

    async fn close(&self) -> Result<(), SourceError>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Produces every message of `batch`, resolving once all are acknowledged.
    /// Any failed delivery fails the whole call.
    async fn send_batch(&self, batch: &[TopicMessages]) -> Result<(), SinkError>;

    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<(), SinkError> {
        self.send_batch(&[TopicMessages {
            topic: topic.to_owned(),
            messages: messages.to_vec(),
        }])
        .await
    }

    /// Flushes anything still queued and releases the connection.
    async fn close(&self) -> Result<(), SinkError>;
}
