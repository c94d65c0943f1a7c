//! Compression codecs the Kafka producer can be configured with.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The codec librdkafka applies to outgoing message batches.
/// The harness never looks at it, it only ends up in the
/// producer configuration.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    #[default]
    Lz4,
    Zstd,
}

impl Compression {
    /// The value expected by the `compression.codec` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    /// Topic used when the caller does not pick one, so runs
    /// with different codecs do not share a topic.
    pub fn default_topic(&self) -> String {
        format!("json-marshaling-and-{}", self.as_str())
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown compression codec: {0}")]
pub struct UnknownCompression(pub String);

impl FromStr for Compression {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(UnknownCompression(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Compression, UnknownCompression};

    #[test]
    fn test_parse_codec_names() {
        assert_eq!("lz4".parse::<Compression>(), Ok(Compression::Lz4));
        assert_eq!("ZSTD".parse::<Compression>(), Ok(Compression::Zstd));
        assert_eq!(" Snappy ".parse::<Compression>(), Ok(Compression::Snappy));
        assert_eq!("none".parse::<Compression>(), Ok(Compression::None));
        assert_eq!(
            "brotli".parse::<Compression>(),
            Err(UnknownCompression("brotli".to_string()))
        );
    }

    #[test]
    fn test_display_matches_librdkafka_values() {
        for codec in [
            Compression::None,
            Compression::Gzip,
            Compression::Snappy,
            Compression::Lz4,
            Compression::Zstd,
        ] {
            assert_eq!(codec.to_string().parse::<Compression>(), Ok(codec));
        }
        assert_eq!(Compression::Gzip.to_string(), "gzip");
    }

    #[test]
    fn test_default_topic() {
        assert_eq!(Compression::default(), Compression::Lz4);
        assert_eq!(
            Compression::default().default_topic(),
            "json-marshaling-and-lz4"
        );
    }
}
