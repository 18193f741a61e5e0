use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use futures::future::join_all;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Message};
use tracing::{debug, error, info};

use crate::health::HealthHandle;
use crate::offsets::OffsetTracker;
use crate::transport::{
    Acknowledgement, InboundMessage, MessageSink, MessageSource, SinkError, SourceError,
    TopicMessages,
};

/// Broker connection and producer tuning shared by the source and the sink.
#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    /// Delivery timeout per produced record, retries included.
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,
}

impl KafkaConfig {
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // The librdkafka main loop is alive if it calls us
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for KafkaContext {}

/// Produces batches with a shared `FutureProducer`.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    close_timeout: Duration,
}

impl KafkaSink {
    /// Creates the producer and pings the brokers, failing if they cannot be reached.
    pub fn new(
        config: &KafkaConfig,
        liveness: HealthHandle,
        close_timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let mut client_config = config.client_config();
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;

        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {
            producer,
            close_timeout,
        })
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn send_batch(&self, batch: &[TopicMessages]) -> Result<(), SinkError> {
        let mut deliveries = Vec::new();

        for group in batch {
            for message in &group.messages {
                let record = FutureRecord {
                    topic: &group.topic,
                    payload: Some(&message.payload),
                    partition: None,
                    key: message.key.as_deref(),
                    timestamp: None,
                    headers: None,
                };
                match self.producer.send_result(record) {
                    Ok(delivery) => deliveries.push(delivery),
                    Err((e, _)) => return Err(SinkError::Kafka(e)),
                }
            }
        }

        for delivery in join_all(deliveries).await {
            match delivery {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(SinkError::Kafka(e)),
                Err(_) => return Err(SinkError::Canceled),
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.producer.flush(self.close_timeout)?;
        Ok(())
    }
}

/// Consumes the raw and domain topics through one consumer group.
///
/// Offsets are committed in the background. Acknowledgements may arrive in any order, so the
/// offset stored per partition is the watermark kept by [`OffsetTracker`]: a message is never
/// committed while it, or any earlier message of its partition, is still being handled.
pub struct KafkaSource {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<KafkaContext>,
    offsets: OffsetTracker,
}

impl KafkaSource {
    pub fn new(
        config: &KafkaConfig,
        consumer_group: &str,
        offset_reset: &str,
        topics: &[&str],
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = config.client_config();
        client_config
            .set("group.id", consumer_group)
            .set("auto.offset.reset", offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;
        consumer.subscribe(topics)?;
        info!(?topics, consumer_group, "subscribed to topics");

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                offsets: OffsetTracker::new(),
            }),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&self) -> Result<InboundMessage, SourceError> {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
        };
        self.inner
            .offsets
            .delivered(&offset.topic, offset.partition, offset.offset);

        Ok(InboundMessage {
            topic: offset.topic.clone(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            ack: Some(Box::new(offset)),
        })
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.inner.consumer.unsubscribe();
        Ok(())
    }
}

struct Offset {
    handle: Weak<Inner>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Acknowledgement for Offset {
    fn ack(self: Box<Self>) -> Result<(), SourceError> {
        let inner = self.handle.upgrade().ok_or(SourceError::ConsumerGone)?;
        // The watermark is the next offset to read
        let stored = inner
            .offsets
            .settle(&self.topic, self.partition, self.offset, |next| {
                inner.consumer.store_offset(&self.topic, self.partition, next)
            })?;
        if let Some(next) = stored {
            debug!(topic = self.topic, partition = self.partition, next, "stored offset");
        }
        Ok(())
    }
}
