//! Chunked CSV record decoder
//!
//! Reads an upload in fixed-size chunks and turns every complete, non-empty line into a
//! [`Record`] keyed by the header line. The file is never held in memory: at any time the
//! decoder owns one chunk, the complete lines split out of it, and the carry-over fragment of a
//! line whose newline has not been read yet.
//!
//! # Format
//!
//! ```text
//! id,first_name,last_name        <- header, BOM and surrounding whitespace stripped
//! 1,Ann,Lee                      <- record {id: 1, first_name: Ann, last_name: Lee}
//!                                <- blank, skipped
//! 2,Bo,Kim\r                     <- \r stripped
//! 3,Cy                           <- short line, DecodeError::MalformedRecord
//! ```
//!
//! Values are matched to columns by position. There is no quoting: every `,` separates fields.

use csvq_common::{Header, Record};
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, trace};

/// Default number of bytes requested from the source per read.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default upper bound for a single line, newline excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("File is empty or has no header line")]
    MissingHeader,

    #[error("Malformed record on line {line}: expected {expected} fields, found {found}")]
    MalformedRecord {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Line {line} is not valid UTF-8")]
    InvalidUtf8 { line: usize },

    #[error("Line {line} exceeds the maximum length of {max} bytes")]
    LineTooLong { line: usize, max: usize },
}

impl DecodeError {
    /// True when the upload's content is at fault rather than the transport.
    pub fn is_malformed_input(&self) -> bool {
        !matches!(self, DecodeError::Io(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    pub chunk_size: usize,
    pub max_line_bytes: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Lazy, non-restartable sequence of records over a byte source.
pub struct StreamDecoder<R> {
    reader: BufReader<R>,
    header: Header,
    max_line_bytes: usize,
    chunk: Vec<u8>,
    carry: Vec<u8>,
    /// Complete lines of the current chunk with their 1-based line numbers
    pending: VecDeque<(usize, Vec<u8>)>,
    next_line: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StreamDecoder<R> {
    /// Read the header line and prepare to decode records.
    pub async fn new(source: R, options: DecoderOptions) -> Result<Self, DecodeError> {
        let chunk_size = options.chunk_size.max(1);
        let max_line_bytes = options.max_line_bytes.max(1);
        let mut reader = BufReader::with_capacity(chunk_size, source);

        let mut first = Vec::new();
        (&mut reader)
            .take(max_line_bytes as u64 + 1)
            .read_until(b'\n', &mut first)
            .await?;

        if first.last() != Some(&b'\n') && first.len() > max_line_bytes {
            return Err(DecodeError::LineTooLong {
                line: 1,
                max: max_line_bytes,
            });
        }

        let text = std::str::from_utf8(&first).map_err(|_| DecodeError::InvalidUtf8 { line: 1 })?;
        let header = Header::parse(text);
        if header.is_empty() {
            return Err(DecodeError::MissingHeader);
        }

        debug!(columns = header.len(), header = %header, "Parsed CSV header");

        Ok(Self {
            reader,
            header,
            max_line_bytes,
            chunk: vec![0; chunk_size],
            carry: Vec::new(),
            pending: VecDeque::new(),
            next_line: 2,
            eof: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Next record, or `None` once the source is exhausted.
    ///
    /// A `MalformedRecord` or `InvalidUtf8` error consumes only the offending line; calling
    /// again continues with the line after it. I/O errors and `LineTooLong` end the sequence.
    pub async fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        loop {
            while let Some((line, bytes)) = self.pending.pop_front() {
                if let Some(record) = self.decode_line(line, bytes)? {
                    return Ok(Some(record));
                }
            }

            if self.eof {
                return Ok(None);
            }

            self.fill().await?;
        }
    }

    /// Read one chunk, split it into complete lines and keep the unterminated tail.
    async fn fill(&mut self) -> Result<(), DecodeError> {
        let read = self.reader.read(&mut self.chunk).await?;

        if read == 0 {
            self.eof = true;
            if !self.carry.is_empty() {
                let last = std::mem::take(&mut self.carry);
                self.push_line(last);
            }
            return Ok(());
        }

        let chunk = std::mem::take(&mut self.chunk);
        let mut start = 0;
        for (pos, _) in chunk[..read].iter().enumerate().filter(|(_, b)| **b == b'\n') {
            let mut line = std::mem::take(&mut self.carry);
            line.extend_from_slice(&chunk[start..pos]);
            self.push_line(line);
            start = pos + 1;
        }
        self.carry.extend_from_slice(&chunk[start..read]);
        self.chunk = chunk;

        trace!(bytes = read, lines = self.pending.len(), carry = self.carry.len(), "Read chunk");

        if self.carry.len() > self.max_line_bytes {
            let line = self.next_line;
            self.carry.clear();
            self.pending.clear();
            self.eof = true;
            return Err(DecodeError::LineTooLong {
                line,
                max: self.max_line_bytes,
            });
        }

        Ok(())
    }

    fn push_line(&mut self, bytes: Vec<u8>) {
        self.pending.push_back((self.next_line, bytes));
        self.next_line += 1;
    }

    fn decode_line(&self, line: usize, bytes: Vec<u8>) -> Result<Option<Record>, DecodeError> {
        if bytes.len() > self.max_line_bytes {
            return Err(DecodeError::LineTooLong {
                line,
                max: self.max_line_bytes,
            });
        }

        let mut text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { line })?;
        text.retain(|c| c != '\r');

        if text.is_empty() {
            trace!(line, "Skipping blank line");
            return Ok(None);
        }

        let fields = split_fields(&text);
        if fields.len() < self.header.len() {
            return Err(DecodeError::MalformedRecord {
                line,
                expected: self.header.len(),
                found: fields.len(),
            });
        }

        Ok(Some(Record::zip(&self.header, fields)))
    }
}

/// Split a line on `,`. A single trailing comma terminates the line instead of opening an
/// empty last field.
fn split_fields(line: &str) -> Vec<&str> {
    line.strip_suffix(',').unwrap_or(line).split(',').collect()
}
