//! This module turns a delimited text file into a lazy sequence
//! of `Record`s, one per line, named after the header row.
//!
//! The source is read once, front to back. Rows that cannot be
//! decoded are reported as non fatal errors so the caller can skip
//! them, while I/O failures end the sequence.

use serde::de::{MapAccess, Visitor};
use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A single value of a record.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Picks the narrowest type the raw text parses as. Words such as
    /// "NaN" or "inf" stay text, an inferred value always serializes.
    pub fn infer(raw: &str) -> FieldValue {
        if let Ok(v) = raw.parse::<i64>() {
            return FieldValue::Integer(v);
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => FieldValue::Float(v),
            _ => FieldValue::Text(raw.to_string()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Integer(v) => serializer.serialize_i64(*v),
            FieldValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            // serde_json would silently write `null` for these.
            FieldValue::Float(v) => Err(S::Error::custom(format!("unsupported value: {v}"))),
            FieldValue::Text(v) => serializer.serialize_str(v),
        }
    }
}

/// One decoded line of the input. Fields keep the header order,
/// which is also the order they are serialized in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new(fields: Vec<(String, FieldValue)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> + '_ {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Record::new(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = Record;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a flat object of named fields")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Record, A::Error> {
        let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, value)) = access.next_entry::<String, FieldValue>()? {
            fields.push((name, value));
        }
        Ok(Record { fields })
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RecordVisitor)
    }
}

/// How the delimited input is decoded.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    pub delimiter: u8,
    /// Turn numeric looking values into integers and floats
    /// instead of keeping every value as text.
    pub infer_types: bool,
    pub trim: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            infer_types: false,
            trim: false,
        }
    }
}

/// Record source errors.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The input file could not be opened.
    #[error("failed to open input file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The input has no header row to name the fields with.
    #[error("input has no header row")]
    MissingHeader,

    /// Two columns share a name, so a record could not be keyed by it.
    #[error("duplicate header name: {0}")]
    DuplicateHeader(String),

    /// A row could not be decoded, or reading the input failed.
    #[error("failed to decode input")]
    Csv(#[from] csv::Error),
}

impl SourceError {
    /// Fatal errors end the run. Anything else only affects the
    /// row that produced it.
    pub fn is_fatal(&self) -> bool {
        match self {
            SourceError::Open { .. }
            | SourceError::MissingHeader
            | SourceError::DuplicateHeader(_) => true,
            SourceError::Csv(err) => err.is_io_error(),
        }
    }
}

/// A single pass over a delimited input, yielding one `Record` per
/// line after the header.
pub struct RecordSource<R: io::Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    row: csv::StringRecord,
    infer_types: bool,
    exhausted: bool,
}

impl RecordSource<File> {
    pub fn open<P: AsRef<Path>>(path: P, options: &SourceOptions) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        RecordSource::from_reader(file, options)
    }
}

impl<R: io::Read> RecordSource<R> {
    /// Reads the header row eagerly, so a source that cannot name its
    /// fields fails here rather than on the first record.
    pub fn from_reader(reader: R, options: &SourceOptions) -> Result<Self, SourceError> {
        let trim = if options.trim {
            csv::Trim::All
        } else {
            csv::Trim::None
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(options.delimiter)
            .trim(trim)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.is_empty() {
            return Err(SourceError::MissingHeader);
        }
        for (i, name) in headers.iter().enumerate() {
            if headers[..i].contains(name) {
                return Err(SourceError::DuplicateHeader(name.clone()));
            }
        }

        Ok(Self {
            reader,
            headers,
            row: csv::StringRecord::new(),
            infer_types: options.infer_types,
            exhausted: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn current_record(&self) -> Record {
        let fields = self
            .headers
            .iter()
            .zip(self.row.iter())
            .map(|(name, raw)| {
                let value = if self.infer_types {
                    FieldValue::infer(raw)
                } else {
                    FieldValue::Text(raw.to_string())
                };
                (name.clone(), value)
            })
            .collect();
        Record { fields }
    }
}

impl<R: io::Read> Iterator for RecordSource<R> {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.reader.read_record(&mut self.row) {
            Ok(true) => Some(Ok(self.current_record())),
            Ok(false) => {
                self.exhausted = true;
                None
            }
            Err(err) => {
                let err = SourceError::from(err);
                if err.is_fatal() {
                    self.exhausted = true;
                }
                Some(Err(err))
            }
        }
    }
}
