//! Wire protocol for the Cube SQL native client
//!
//! This module defines the request and response messages exchanged with the
//! server and their binary codec. Every message on the socket is one frame:
//!
//! ```text
//! u32 total_payload_len   (big-endian)
//! u8  message_type
//! ... message-specific fields ...
//! ```
//!
//! All integers are big-endian. Strings and byte blobs are length-prefixed
//! with a `u32`. Note that this is distinct from the columnar stream carried
//! inside `QueryResponseBatch`, which is little-endian throughout; the two
//! codecs are deliberately kept in separate modules.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{CubeError, Result};

/// Upper bound on a single frame payload. Anything larger is rejected
/// before allocation.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

// Message Type Discriminants

pub mod msg {
    pub const HANDSHAKE_REQUEST: u8 = 0x01;
    pub const HANDSHAKE_RESPONSE: u8 = 0x02;
    pub const AUTH_REQUEST: u8 = 0x03;
    pub const AUTH_RESPONSE: u8 = 0x04;
    pub const QUERY_REQUEST: u8 = 0x10;
    pub const QUERY_RESPONSE_SCHEMA: u8 = 0x11;
    pub const QUERY_RESPONSE_BATCH: u8 = 0x12;
    pub const QUERY_COMPLETE: u8 = 0x13;
    pub const ERROR: u8 = 0xFF;
}

/// Wire protocol messages, requests and responses alike.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Opens the protocol exchange; the only message valid on a fresh
    /// connection.
    HandshakeRequest { version: u32 },

    /// Server's answer to the handshake.
    HandshakeResponse { version: u32, server_version: String },

    /// Token authentication, with an optional target database.
    AuthRequest { token: String, database: Option<String> },

    /// Authentication outcome.
    AuthResponse { success: bool, session_id: String },

    /// Submit one SQL statement.
    QueryRequest { sql: String },

    /// Standalone columnar schema for the running query.
    QueryResponseSchema { ipc: Bytes },

    /// A columnar stream payload (schema plus record batches).
    QueryResponseBatch { ipc: Bytes },

    /// Successful end of a query. `rows_affected` is -1 when unknown.
    QueryComplete { rows_affected: i64 },

    /// Server-reported failure; terminates the running query.
    Error { code: String, message: String },
}

impl Message {
    /// The discriminant byte for this message kind.
    pub fn message_type(&self) -> u8 {
        match self {
            Message::HandshakeRequest { .. } => msg::HANDSHAKE_REQUEST,
            Message::HandshakeResponse { .. } => msg::HANDSHAKE_RESPONSE,
            Message::AuthRequest { .. } => msg::AUTH_REQUEST,
            Message::AuthResponse { .. } => msg::AUTH_RESPONSE,
            Message::QueryRequest { .. } => msg::QUERY_REQUEST,
            Message::QueryResponseSchema { .. } => msg::QUERY_RESPONSE_SCHEMA,
            Message::QueryResponseBatch { .. } => msg::QUERY_RESPONSE_BATCH,
            Message::QueryComplete { .. } => msg::QUERY_COMPLETE,
            Message::Error { .. } => msg::ERROR,
        }
    }

    /// Encode into a complete frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(self.message_type());

        match self {
            Message::HandshakeRequest { version } => {
                payload.put_u32(*version);
            }
            Message::HandshakeResponse {
                version,
                server_version,
            } => {
                payload.put_u32(*version);
                put_string(&mut payload, server_version);
            }
            Message::AuthRequest { token, database } => {
                put_string(&mut payload, token);
                put_opt_string(&mut payload, database.as_deref());
            }
            Message::AuthResponse {
                success,
                session_id,
            } => {
                payload.put_u8(if *success { 1 } else { 0 });
                put_string(&mut payload, session_id);
            }
            Message::QueryRequest { sql } => {
                put_string(&mut payload, sql);
            }
            Message::QueryResponseSchema { ipc } => {
                put_bytes(&mut payload, ipc);
            }
            Message::QueryResponseBatch { ipc } => {
                put_bytes(&mut payload, ipc);
            }
            Message::QueryComplete { rows_affected } => {
                payload.put_i64(*rows_affected);
            }
            Message::Error { code, message } => {
                put_string(&mut payload, code);
                put_string(&mut payload, message);
            }
        }

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        frame.freeze()
    }

    /// Decode a frame payload (everything after the 4-byte length prefix).
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let mut cursor = payload;
        let message_type = get_u8(&mut cursor)?;

        let message = match message_type {
            msg::HANDSHAKE_REQUEST => Message::HandshakeRequest {
                version: get_u32(&mut cursor)?,
            },
            msg::HANDSHAKE_RESPONSE => {
                let version = get_u32(&mut cursor)?;
                let server_version = get_string(&mut cursor)?;
                Message::HandshakeResponse {
                    version,
                    server_version,
                }
            }
            msg::AUTH_REQUEST => {
                let token = get_string(&mut cursor)?;
                let database = get_opt_string(&mut cursor)?;
                Message::AuthRequest { token, database }
            }
            msg::AUTH_RESPONSE => {
                let success = get_u8(&mut cursor)? != 0;
                let session_id = get_string(&mut cursor)?;
                Message::AuthResponse {
                    success,
                    session_id,
                }
            }
            msg::QUERY_REQUEST => Message::QueryRequest {
                sql: get_string(&mut cursor)?,
            },
            msg::QUERY_RESPONSE_SCHEMA => Message::QueryResponseSchema {
                ipc: get_bytes(&mut cursor)?,
            },
            msg::QUERY_RESPONSE_BATCH => Message::QueryResponseBatch {
                ipc: get_bytes(&mut cursor)?,
            },
            msg::QUERY_COMPLETE => Message::QueryComplete {
                rows_affected: get_i64(&mut cursor)?,
            },
            msg::ERROR => {
                let code = get_string(&mut cursor)?;
                let message = get_string(&mut cursor)?;
                Message::Error { code, message }
            }
            other => {
                return Err(CubeError::InvalidData(format!(
                    "unknown message type: 0x{other:02X}"
                )));
            }
        };

        Ok(message)
    }
}

// Primitive Encoding Helpers

#[inline]
fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

// Absent and empty collapse to the same wire form, mirroring the server.
#[inline]
fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) if !s.is_empty() => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        _ => buf.put_u8(0),
    }
}

#[inline]
fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

// Primitive Decoding Helpers

#[inline]
fn get_u8(cursor: &mut &[u8]) -> Result<u8> {
    if cursor.is_empty() {
        return Err(CubeError::InvalidData("insufficient data for u8".into()));
    }
    let v = cursor[0];
    *cursor = &cursor[1..];
    Ok(v)
}

#[inline]
fn get_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(CubeError::InvalidData("insufficient data for u32".into()));
    }
    let v = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
    *cursor = &cursor[4..];
    Ok(v)
}

#[inline]
fn get_i64(cursor: &mut &[u8]) -> Result<i64> {
    if cursor.len() < 8 {
        return Err(CubeError::InvalidData("insufficient data for i64".into()));
    }
    let v = i64::from_be_bytes([
        cursor[0], cursor[1], cursor[2], cursor[3], cursor[4], cursor[5], cursor[6], cursor[7],
    ]);
    *cursor = &cursor[8..];
    Ok(v)
}

#[inline]
fn get_string(cursor: &mut &[u8]) -> Result<String> {
    let len = get_u32(cursor)? as usize;
    if cursor.len() < len {
        return Err(CubeError::InvalidData("truncated string".into()));
    }
    let s = std::str::from_utf8(&cursor[..len])
        .map_err(|e| CubeError::InvalidData(format!("invalid utf-8 in string: {e}")))?
        .to_owned();
    *cursor = &cursor[len..];
    Ok(s)
}

#[inline]
fn get_opt_string(cursor: &mut &[u8]) -> Result<Option<String>> {
    if get_u8(cursor)? != 0 {
        Ok(Some(get_string(cursor)?))
    } else {
        Ok(None)
    }
}

#[inline]
fn get_bytes(cursor: &mut &[u8]) -> Result<Bytes> {
    let len = get_u32(cursor)? as usize;
    if cursor.len() < len {
        return Err(CubeError::InvalidData("truncated byte blob".into()));
    }
    let bytes = Bytes::copy_from_slice(&cursor[..len]);
    *cursor = &cursor[len..];
    Ok(bytes)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    fn roundtrip(message: Message) -> Message {
        let frame = message.encode();
        Message::decode(&frame[4..]).unwrap()
    }

    #[test]
    fn test_handshake_request_wire_layout() {
        let frame = Message::HandshakeRequest {
            version: PROTOCOL_VERSION,
        }
        .encode();

        // length=5, type=0x01, version=1
        assert_eq!(
            &frame[..],
            &[0x00, 0x00, 0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_handshake_response_wire_layout() {
        let frame: &[u8] = &[
            0x00, 0x00, 0x00, 0x0E, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05, b'1',
            b'.', b'0', b'.', b'0',
        ];
        let decoded = Message::decode(&frame[4..]).unwrap();
        assert_eq!(
            decoded,
            Message::HandshakeResponse {
                version: 1,
                server_version: "1.0.0".into(),
            }
        );
    }

    #[test]
    fn test_auth_request_roundtrip() {
        let with_db = Message::AuthRequest {
            token: "secret".into(),
            database: Some("analytics".into()),
        };
        assert_eq!(roundtrip(with_db.clone()), with_db);

        let without_db = Message::AuthRequest {
            token: "secret".into(),
            database: None,
        };
        assert_eq!(roundtrip(without_db.clone()), without_db);
    }

    #[test]
    fn test_empty_database_encodes_as_absent() {
        let message = Message::AuthRequest {
            token: "t".into(),
            database: Some(String::new()),
        };
        assert_eq!(
            roundtrip(message),
            Message::AuthRequest {
                token: "t".into(),
                database: None,
            }
        );
    }

    #[test]
    fn test_query_complete_roundtrip() {
        let message = Message::QueryComplete { rows_affected: -1 };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_batch_payload_roundtrip() {
        let message = Message::QueryResponseBatch {
            ipc: Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00]),
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_error_roundtrip() {
        let message = Message::Error {
            code: "42601".into(),
            message: "syntax".into(),
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_unknown_message_type() {
        let err = Message::decode(&[0x7B, 0x00]).unwrap_err();
        assert_eq!(err.kind(), "invalid_data");
    }

    #[test]
    fn test_truncated_payload() {
        let frame = Message::QueryRequest {
            sql: "SELECT 1".into(),
        }
        .encode();
        let err = Message::decode(&frame[4..frame.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), "invalid_data");
    }

    #[test]
    fn test_invalid_utf8_in_string() {
        // QueryRequest with a 2-byte string that is not valid UTF-8
        let payload = [msg::QUERY_REQUEST, 0x00, 0x00, 0x00, 0x02, 0xC0, 0x80];
        let err = Message::decode(&payload).unwrap_err();
        assert_eq!(err.kind(), "invalid_data");
    }
}
