//! Columnar interchange stream decoding
//!
//! The server returns query results as an in-memory columnar stream: one
//! schema message followed by record-batch messages, each framed as a
//! little-endian continuation marker plus metadata length, a FlatBuffers
//! metadata header, and an 8-byte-aligned binary body. This framing is
//! little-endian throughout and entirely separate from the big-endian outer
//! wire protocol.

mod convert;
mod decoder;

pub use decoder::StreamDecoder;

/// Sentinel preceding every metadata length, distinguishing the current
/// framing from the legacy layout.
pub(crate) const CONTINUATION_MARKER: u32 = 0xFFFF_FFFF;
