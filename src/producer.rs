//! This module provides an abstraction over a Kafka producer in
//! order to let the harness publish payloads without depending on
//! the rdkafka ThreadedProducer.
//!
//! It also simplify unit tests.

use crate::compression::Compression;
use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::Producer as RdKafkaProducer;
use rdkafka::producer::{BaseRecord, ThreadedProducer};
use rdkafka::producer::{DeliveryResult, ProducerContext};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientContext;
#[cfg(test)]
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
#[cfg(test)]
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// This structure wraps the parameters to initialize a producer.
/// This struct is there in order not to expose the rdkafka
/// details outside.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    config_map: HashMap<String, String>,
    connect_timeout: Option<Duration>,
}

impl KafkaConfig {
    pub fn new_producer_config(
        bootstrap_servers: &str,
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("bootstrap.servers".to_string(), bootstrap_servers.into());

        Self {
            config_map,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
        .with_overrides(override_params.unwrap_or_default())
    }

    /// Raw librdkafka properties. They replace whatever was set
    /// before, codec included.
    pub fn with_overrides<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.config_map
            .extend(params.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    /// Sets the codec the producer compresses batches with.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.config_map
            .insert("compression.codec".to_string(), compression.to_string());
        self
    }

    /// How long the producer waits for cluster metadata when it is
    /// created. `None` skips the check, so an unreachable broker only
    /// shows up later as failed deliveries.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config_map.get(key).map(String::as_str)
    }
}

impl From<KafkaConfig> for RdKafkaConfig {
    fn from(item: KafkaConfig) -> Self {
        item.config_map
            .into_iter()
            .fold(RdKafkaConfig::new(), |mut config_obj, (key, val)| {
                config_obj.set(key, val);
                config_obj
            })
    }
}

/// Reports each delivery. The harness never waits for these, so
/// they are the only trace of messages lost after submission.
struct DeliveryLogContext;

impl ClientContext for DeliveryLogContext {}

impl ProducerContext for DeliveryLogContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult, _delivery_opaque: Self::DeliveryOpaque) {
        match result {
            Ok(message) => event!(
                Level::DEBUG,
                "Delivered {} bytes to {}[{}] at offset {}.",
                message.payload_len(),
                message.topic(),
                message.partition(),
                message.offset()
            ),
            Err((kafka_err, message)) => event!(
                Level::ERROR,
                "Delivery of {} bytes to {} failed. {}",
                message.payload_len(),
                message.topic(),
                kafka_err
            ),
        }
    }
}

/// Kafka producer errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to send a kafka message.
    #[error("failed to send kafka message")]
    SendFailed(#[source] KafkaError),

    /// Failed to create a kafka producer because of the invalid configuration.
    #[error("failed to create kafka producer: invalid kafka config")]
    InvalidConfig(#[source] KafkaError),

    /// The producer was created but no broker answered the metadata request.
    #[error("failed to create kafka producer: broker unreachable")]
    BrokerUnreachable(#[source] KafkaError),

    /// Messages were still queued when the flush timeout expired.
    #[error("failed to flush kafka producer")]
    FlushFailed(#[source] KafkaError),
}

/// A basic Kafka Producer trait.
///
/// We do not need to set headers or key for this data.
pub trait Producer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError>;

    /// Flushes whatever is still queued and releases the producer.
    /// Calling it more than once must be harmless.
    fn close(&mut self) -> Result<(), ClientError>;
}

pub struct KafkaProducer {
    producer: ThreadedProducer<DeliveryLogContext>,
    closed: bool,
}

impl KafkaProducer {
    pub fn new(config: KafkaConfig) -> Result<KafkaProducer, ClientError> {
        let connect_timeout = config.connect_timeout;
        let producer_config: RdKafkaConfig = config.into();
        let producer: ThreadedProducer<DeliveryLogContext> = producer_config
            .create_with_context(DeliveryLogContext)
            .map_err(ClientError::InvalidConfig)?;

        if let Some(timeout) = connect_timeout {
            let metadata = producer
                .client()
                .fetch_metadata(None, timeout)
                .map_err(ClientError::BrokerUnreachable)?;
            event!(
                Level::INFO,
                "Connected to kafka cluster with {} broker(s).",
                metadata.brokers().len()
            );
        }

        Ok(KafkaProducer {
            producer,
            closed: false,
        })
    }
}

impl Producer for KafkaProducer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        let mut record: BaseRecord<'_, [u8], [u8]> =
            BaseRecord::to(topic_name).payload(payload);
        loop {
            match self.producer.send(record) {
                Ok(()) => return Ok(()),
                // The background thread drains the queue, wait for room
                // the way a blocking input channel would.
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    record = returned;
                    thread::sleep(QUEUE_FULL_BACKOFF);
                }
                Err((error, _message)) => return Err(ClientError::SendFailed(error)),
            }
        }
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.producer
            .flush(FLUSH_TIMEOUT)
            .map_err(ClientError::FlushFailed)
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct DummyProducer {
    pub messages: Rc<RefCell<Vec<(String, Vec<u8>)>>>,
    pub close_calls: Rc<Cell<usize>>,
    /// Sends beyond this many messages fail as if the queue were full.
    pub capacity: Option<usize>,
}

#[cfg(test)]
impl Producer for DummyProducer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        if let Some(capacity) = self.capacity {
            if self.messages.borrow().len() >= capacity {
                return Err(ClientError::SendFailed(KafkaError::MessageProduction(
                    RDKafkaErrorCode::QueueFull,
                )));
            }
        }
        self.messages
            .borrow_mut()
            .push((topic_name.to_string(), payload.to_vec()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), ClientError> {
        self.close_calls.set(self.close_calls.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DummyProducer;
    use super::KafkaConfig;
    use super::{ClientError, KafkaProducer, Producer};
    use crate::compression::Compression;
    use rdkafka::config::ClientConfig as RdKafkaConfig;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_build_producer_configuration() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "queued.max.messages.kbytes".to_string(),
                "1000000".to_string(),
            )])),
        );

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(
            rdkafka_config.get("queued.max.messages.kbytes"),
            Some("1000000")
        );
        assert_eq!(rdkafka_config.get("bootstrap.servers"), Some("localhost:9092"));
    }

    #[test]
    fn test_compression_codec_in_configuration() {
        let config = KafkaConfig::new_producer_config("localhost:9092", None)
            .with_compression(Compression::Zstd);
        assert_eq!(config.get("compression.codec"), Some("zstd"));

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(rdkafka_config.get("compression.codec"), Some("zstd"));
    }

    #[test]
    fn test_overrides_replace_codec() {
        let config = KafkaConfig::new_producer_config("localhost:9092", None)
            .with_compression(Compression::Lz4)
            .with_overrides([("compression.codec", "gzip"), ("linger.ms", "5")]);

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(rdkafka_config.get("compression.codec"), Some("gzip"));
        assert_eq!(rdkafka_config.get("linger.ms"), Some("5"));
        assert_eq!(rdkafka_config.get("bootstrap.servers"), Some("localhost:9092"));
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "compression.codec".to_string(),
                "not-a-codec".to_string(),
            )])),
        )
        .with_connect_timeout(None);

        let res = KafkaProducer::new(config);
        assert!(matches!(res, Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_unreachable_broker_fails_construction() {
        // Nothing listens on port 1.
        let config = KafkaConfig::new_producer_config("127.0.0.1:1", None)
            .with_connect_timeout(Some(Duration::from_millis(500)));

        let res = KafkaProducer::new(config);
        assert!(matches!(res, Err(ClientError::BrokerUnreachable(_))));
    }

    #[test]
    fn test_dummy_producer() {
        let mut producer = DummyProducer::default();
        let messages = Rc::clone(&producer.messages);
        let res = producer.send("topic", "message".as_bytes());
        assert!(res.is_ok());

        assert_eq!(messages.borrow().len(), 1);
        assert!(producer.close().is_ok());
        assert_eq!(producer.close_calls.get(), 1);
    }

    #[test]
    fn test_dummy_producer_capacity() {
        let mut producer = DummyProducer {
            capacity: Some(1),
            ..Default::default()
        };
        assert!(producer.send("topic", b"first").is_ok());
        assert!(matches!(
            producer.send("topic", b"second"),
            Err(ClientError::SendFailed(_))
        ));
        assert_eq!(producer.messages.borrow().len(), 1);
    }
}
