pub mod compression;
pub mod harness;
pub mod producer;
pub mod record;

pub use compression::Compression;
pub use harness::{publish_file, HarnessError, PublishHarness, RunStats};
pub use producer::{ClientError, KafkaConfig, KafkaProducer, Producer};
pub use record::{FieldValue, Record, RecordSource, SourceError, SourceOptions};
