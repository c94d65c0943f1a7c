use crate::producer::{ClientError, KafkaConfig, KafkaProducer, Producer};
use crate::record::{RecordSource, SourceError, SourceOptions};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{event, Level};

/// Errors that end a run.
///
/// Per record failures are never reported here, they are logged
/// and counted in `RunStats`.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The input could not be opened, or reading it failed mid run.
    #[error("record source failed")]
    Source(#[from] SourceError),

    /// The producer could not be created.
    #[error("producer construction failed")]
    Producer(#[from] ClientError),

    /// The final flush did not complete.
    #[error("failed to release producer")]
    Release(#[source] ClientError),
}

/// Counters for a single pass over the input.
#[derive(Clone, Debug, PartialEq)]
pub struct RunStats {
    pub records_read: u64,
    pub published: u64,
    pub serialize_failures: u64,
    pub decode_failures: u64,
    pub send_failures: u64,
    pub payload_bytes: u64,
    pub started_at: DateTime<Local>,
    /// Wall clock time of the pass, final flush included.
    pub elapsed: Duration,
}

impl RunStats {
    fn new(started_at: DateTime<Local>) -> Self {
        Self {
            records_read: 0,
            published: 0,
            serialize_failures: 0,
            decode_failures: 0,
            send_failures: 0,
            payload_bytes: 0,
            started_at,
            elapsed: Duration::ZERO,
        }
    }

    pub fn messages_per_sec(&self) -> f64 {
        per_sec(self.published, self.elapsed)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        per_sec(self.payload_bytes, self.elapsed)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "started_at": self.started_at.to_rfc3339(),
            "elapsed_ms": self.elapsed.as_secs_f64() * 1000.0,
            "records_read": self.records_read,
            "published": self.published,
            "serialize_failures": self.serialize_failures,
            "decode_failures": self.decode_failures,
            "send_failures": self.send_failures,
            "payload_bytes": self.payload_bytes,
            "messages_per_sec": self.messages_per_sec(),
            "bytes_per_sec": self.bytes_per_sec(),
        })
    }
}

fn per_sec(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    count as f64 / secs
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "published {} of {} records ({} bytes) in {:.3}s: {:.0} msg/s, {:.0} B/s; \
             skipped {} unserializable, {} undecodable; {} send failures",
            self.published,
            self.records_read,
            self.payload_bytes,
            self.elapsed.as_secs_f64(),
            self.messages_per_sec(),
            self.bytes_per_sec(),
            self.serialize_failures,
            self.decode_failures,
            self.send_failures,
        )
    }
}

/// Owns the producer and closes it exactly once: explicitly at the
/// end of a run, or when dropped on any other exit path.
struct ProducerGuard<'a> {
    producer: Box<dyn Producer + 'a>,
    released: bool,
}

impl<'a> ProducerGuard<'a> {
    fn new(producer: Box<dyn Producer + 'a>) -> Self {
        Self {
            producer,
            released: false,
        }
    }

    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.producer.send(topic_name, payload)
    }

    fn release(&mut self) -> Result<(), ClientError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.producer.close()
    }
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            event!(Level::ERROR, "Failed to release producer. {}", err);
        }
    }
}

/// Reads records, turns each one into a JSON payload and hands it to
/// the producer under a single topic, timing the whole pass.
///
/// The harness itself does not batch, retry or wait for
/// acknowledgments. Every payload is submitted once and delivery is
/// left to the producer, which is flushed when the run ends.
pub struct PublishHarness<'a> {
    producer: ProducerGuard<'a>,
    topic: String,
}

impl<'a> PublishHarness<'a> {
    /// Creates the Kafka producer and owns it. Fails if the producer
    /// cannot be configured or the broker cannot be reached.
    pub fn new(producer_config: KafkaConfig, topic_name: &str) -> Result<Self, HarnessError> {
        let producer = KafkaProducer::new(producer_config)?;
        Ok(PublishHarness::new_with_producer(Box::new(producer), topic_name))
    }

    /// Leaves the responsibility to provide a producer to the
    /// client.
    pub fn new_with_producer(producer: Box<dyn Producer + 'a>, topic_name: &str) -> Self {
        PublishHarness {
            producer: ProducerGuard::new(producer),
            topic: topic_name.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes every record of the sequence, in order, then flushes
    /// and releases the producer.
    ///
    /// Rows that cannot be decoded and records that cannot be
    /// serialized are logged and skipped. A fatal source error stops
    /// the run; the producer is released all the same.
    pub fn run<I, T>(mut self, records: I) -> Result<RunStats, HarnessError>
    where
        I: IntoIterator<Item = Result<T, SourceError>>,
        T: Serialize,
    {
        let mut stats = RunStats::new(Local::now());
        let started = Instant::now();
        event!(Level::INFO, "Publishing records to topic {}.", self.topic);

        for (position, item) in records.into_iter().enumerate() {
            let record = match item {
                Ok(record) => record,
                Err(err) if err.is_fatal() => {
                    event!(
                        Level::ERROR,
                        "Aborting run after {} records. {}",
                        stats.records_read,
                        err
                    );
                    return Err(HarnessError::Source(err));
                }
                Err(err) => {
                    event!(Level::WARN, "item {} failed decoding. {}", position, err);
                    stats.decode_failures += 1;
                    continue;
                }
            };
            stats.records_read += 1;

            let payload = match serde_json::to_vec(&record) {
                Ok(payload) => payload,
                Err(err) => {
                    event!(Level::WARN, "item {} failed marshaling. {}", position, err);
                    stats.serialize_failures += 1;
                    continue;
                }
            };

            match self.producer.send(&self.topic, &payload) {
                Ok(()) => {
                    stats.published += 1;
                    stats.payload_bytes += payload.len() as u64;
                }
                Err(err) => {
                    event!(Level::ERROR, "item {} was not submitted. {}", position, err);
                    stats.send_failures += 1;
                }
            }
        }

        self.producer.release().map_err(HarnessError::Release)?;
        stats.elapsed = started.elapsed();
        event!(Level::INFO, "Run finished: {}", stats);
        Ok(stats)
    }
}

/// Publishes every row of a delimited file to `topic_name`.
///
/// The file is opened and its header read before the producer is
/// created. Either failing aborts the run before any record is read.
pub fn publish_file<P: AsRef<Path>>(
    path: P,
    source_options: &SourceOptions,
    producer_config: KafkaConfig,
    topic_name: &str,
) -> Result<RunStats, HarnessError> {
    let source = RecordSource::open(path, source_options)?;
    let harness = PublishHarness::new(producer_config, topic_name)?;
    harness.run(source)
}
