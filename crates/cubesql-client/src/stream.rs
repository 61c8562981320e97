//! Pull interface over a decoded query result
//!
//! `BatchStream` owns the stream decoder for its lifetime: callers pull the
//! schema once, then record batches until end of stream. Batches own their
//! buffers and remain valid after the stream is released.

use bytes::Bytes;
use cubesql_common::{CubeError, RecordBatch, Result, Schema};

use crate::ipc::StreamDecoder;

#[derive(Debug)]
pub struct BatchStream {
    decoder: Option<StreamDecoder>,
    rows_affected: i64,
}

impl BatchStream {
    pub(crate) fn new(payload: Bytes, rows_affected: i64) -> Result<Self> {
        let decoder = StreamDecoder::new(payload)?;
        Ok(Self {
            decoder: Some(decoder),
            rows_affected,
        })
    }

    /// Decode a raw columnar payload outside of a session, e.g. one that
    /// was captured and stored.
    pub fn from_payload(payload: Bytes) -> Result<Self> {
        Self::new(payload, -1)
    }

    /// The result schema. Fails with `InvalidState` once released.
    pub fn schema(&self) -> Result<&Schema> {
        match &self.decoder {
            Some(decoder) => Ok(decoder.schema()),
            None => Err(released()),
        }
    }

    /// Pull the next record batch; `Ok(None)` signals end of stream and
    /// repeats on every later call.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match &mut self.decoder {
            Some(decoder) => decoder.next_batch(),
            None => Err(released()),
        }
    }

    /// Rows-affected count reported by the server for the producing query;
    /// -1 when unknown.
    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    /// Drop the decoder and its payload. Idempotent.
    pub fn release(&mut self) {
        self.decoder = None;
    }

    pub fn is_released(&self) -> bool {
        self.decoder.is_none()
    }
}

impl Iterator for BatchStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

fn released() -> CubeError {
    CubeError::InvalidState("batch stream has been released".into())
}
