//! Newline-delimited JSON framing for bulk read downloads

use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use tokio_util::codec::Decoder;

use crate::Error;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            // Transport failures from the executor travel wrapped in io::Error.
            DecodeError::Io(io_err) if io_err.get_ref().is_some() => {
                match io_err.into_inner().map(|inner| inner.downcast::<Error>()) {
                    Some(Ok(inner)) => *inner,
                    Some(Err(other)) => Error::network(other),
                    None => Error::network("bulk download stream failed"),
                }
            }
            DecodeError::Io(io_err) => Error::network(io_err),
            json @ DecodeError::Json { .. } => {
                Error::request(json.to_string(), Some(500), Some("INVALID_NDJSON"))
            }
        }
    }
}

/// Splits a byte stream on `\n` and decodes each non-blank line as `T`.
///
/// Incomplete lines stay buffered across chunks; a trailing line without a
/// newline is decoded at end of stream.
#[derive(Debug)]
pub struct NdjsonCodec<T> {
    /// Bytes of the buffer already scanned for a newline.
    next_index: usize,
    line: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> NdjsonCodec<T> {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            line: 0,
            _record: PhantomData,
        }
    }

    fn parse(&mut self, raw: &[u8]) -> Result<Option<T>, DecodeError>
    where
        T: DeserializeOwned,
    {
        self.line += 1;
        let trimmed = raw.trim_ascii();
        if trimmed.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(trimmed)
            .map(Some)
            .map_err(|source| DecodeError::Json {
                line: self.line,
                source,
            })
    }
}

impl<T> Default for NdjsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for NdjsonCodec<T> {
    type Item = T;
    type Error = DecodeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<T>, DecodeError> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = buf.len();
                return Ok(None);
            };
            let line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            if let Some(record) = self.parse(&line)? {
                return Ok(Some(record));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<T>, DecodeError> {
        if let Some(record) = self.decode(buf)? {
            return Ok(Some(record));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        self.next_index = 0;
        self.parse(&rest)
    }
}
