//! NDJSON framing and serialization
//!
//! [`LineFramer`] turns an arbitrary chunking of bytes into one JSON record per
//! non-empty line; [`NdjsonSerializer`] turns records back into
//! newline-joined text.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{FramingError, IntegrityError, Result};

/// Value reported for records without a `resourceType`
const MISSING_RESOURCE_TYPE: &str = "undefined";

/// Guards applied while framing one file
#[derive(Clone, Debug)]
pub struct NdjsonOptions {
    /// Maximum bytes buffered for one line
    pub max_line_length: usize,
    /// Every record must declare this `resourceType`
    pub expected_resource_type: Option<String>,
    /// Total number of records the file must contain
    pub expected_count: Option<u64>,
}

impl NdjsonOptions {
    /// Options with only a line-length limit
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            expected_resource_type: None,
            expected_count: None,
        }
    }
}

/// Incremental NDJSON decoder
///
/// Feed chunks with [`push`](Self::push), then call [`finish`](Self::finish)
/// for the trailing unterminated line and [`verify_count`](Self::verify_count)
/// once every record has been handled downstream.
///
/// # Examples
///
/// ```
/// use bulk_data_client::ndjson::{LineFramer, NdjsonOptions};
///
/// let mut framer = LineFramer::new(NdjsonOptions::new(1024));
/// let mut records = framer.push(b"{\"a\":1}\n{\"a\"").unwrap();
/// records.extend(framer.push(b":2}").unwrap());
/// records.extend(framer.finish().unwrap());
/// assert_eq!(records.len(), 2);
/// ```
#[derive(Debug)]
pub struct LineFramer {
    options: NdjsonOptions,
    buffer: Vec<u8>,
    line: u64,
    count: u64,
}

impl LineFramer {
    /// Create a framer
    pub fn new(options: NdjsonOptions) -> Self {
        Self {
            options,
            buffer: Vec::new(),
            line: 0,
            count: 0,
        }
    }

    /// Records parsed so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Feed a chunk and return the records completed by it, in order
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            self.append(head)?;
            rest = &tail[1..];

            let line = std::mem::take(&mut self.buffer);
            self.line += 1;
            if let Some(record) = self.parse_line(&line)? {
                records.push(record);
            }
        }

        self.append(rest)?;
        Ok(records)
    }

    /// Flush the trailing line, if any
    pub fn finish(&mut self) -> Result<Vec<Value>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let line = std::mem::take(&mut self.buffer);
        self.line += 1;
        Ok(self.parse_line(&line)?.into_iter().collect())
    }

    /// Check the record total against the expected count
    pub fn verify_count(&self) -> Result<()> {
        match self.options.expected_count {
            Some(expected) if expected != self.count => Err(IntegrityError::ResourceCountMismatch {
                expected,
                found: self.count,
            }
            .into()),
            _ => Ok(()),
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buffer.len() + bytes.len() > self.options.max_line_length {
            self.buffer.clear();
            return Err(FramingError::BufferOverflow {
                line: self.line + 1,
                max_line_length: self.options.max_line_length,
            }
            .into());
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<Option<Value>> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let record: Value =
            serde_json::from_slice(line).map_err(|e| FramingError::InvalidLine {
                line: self.line,
                message: e.to_string(),
            })?;

        if let Some(expected) = &self.options.expected_resource_type {
            let found = record
                .get("resourceType")
                .and_then(Value::as_str)
                .unwrap_or(MISSING_RESOURCE_TYPE);
            if found != expected {
                return Err(IntegrityError::ResourceTypeMismatch {
                    line: self.line,
                    expected: expected.clone(),
                    found: found.to_string(),
                }
                .into());
            }
        }

        self.count += 1;
        Ok(Some(record))
    }
}

/// Encodes records as newline-joined JSON text (no trailing newline)
#[derive(Debug, Default)]
pub struct NdjsonSerializer {
    count: u64,
}

impl NdjsonSerializer {
    /// Create a serializer
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one record, preceded by a newline unless it is the first
    pub fn encode(&mut self, record: &Value) -> Result<Bytes> {
        let mut out = Vec::new();
        if self.count > 0 {
            out.push(b'\n');
        }
        serde_json::to_writer(&mut out, record)?;
        self.count += 1;
        Ok(Bytes::from(out))
    }

    /// Records encoded so far
    pub fn count(&self) -> u64 {
        self.count
    }
}
