//! Client session state machine
//!
//! A `ClientSession` owns one framed transport and drives the protocol
//! exchange: handshake, token authentication, then one query at a time.
//! Requests are strictly ordered with one in flight; the session never
//! pipelines. Sessions are single-threaded and must not be shared.
//!
//! ```text
//! Disconnected --connect--> Connected --handshake--> Handshaked
//!   Handshaked --authenticate(ok)--> Authenticated
//!   Handshaked --authenticate(fail)--> Closed
//!   Authenticated --execute_query--> Querying --complete/error--> Authenticated
//!   any --close--> Closed
//! ```
//!
//! Server `Error` frames leave the stream framed and in sync, so the
//! session returns to `Authenticated`. I/O failures and structural protocol
//! violations close the session: once framing is in doubt the socket cannot
//! be trusted.

use std::io::{Read, Write};
use std::net::TcpStream;

use bytes::Bytes;
use cubesql_common::protocol::Message;
use cubesql_common::{CubeError, Result, PROTOCOL_VERSION};
use tracing::{debug, warn};

use crate::transport::FramedTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Handshaked,
    Authenticated,
    Querying,
    Closed,
}

#[derive(Debug)]
pub struct ClientSession<S = TcpStream> {
    transport: Option<FramedTransport<S>>,
    state: SessionState,
    server_version: Option<String>,
    session_id: Option<String>,
    last_rows_affected: i64,
}

impl ClientSession<TcpStream> {
    /// Open a TCP connection to the server. The session comes back in
    /// `Connected` state, ready for `handshake`.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        if host.is_empty() {
            return Err(CubeError::InvalidArgument("host must not be empty".into()));
        }
        let transport = FramedTransport::connect(host, port)?;
        Ok(Self::from_transport(transport))
    }
}

impl<S: Read + Write> ClientSession<S> {
    /// Build a session over an already-connected stream.
    pub fn from_stream(stream: S) -> Self {
        Self::from_transport(FramedTransport::new(stream))
    }

    fn from_transport(transport: FramedTransport<S>) -> Self {
        Self {
            transport: Some(transport),
            state: SessionState::Connected,
            server_version: None,
            session_id: None,
            last_rows_affected: -1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Server version string reported during the handshake.
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Session identifier assigned on successful authentication.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Rows-affected count from the most recent `QueryComplete`; -1 when
    /// the server did not report one.
    pub fn last_rows_affected(&self) -> i64 {
        self.last_rows_affected
    }

    /// Exchange protocol versions with the server.
    pub fn handshake(&mut self) -> Result<()> {
        self.expect_state(SessionState::Connected, "handshake")?;

        let result = self.handshake_inner();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn handshake_inner(&mut self) -> Result<()> {
        self.send(&Message::HandshakeRequest {
            version: PROTOCOL_VERSION,
        })?;

        match self.recv()? {
            Message::HandshakeResponse {
                version,
                server_version,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(CubeError::InvalidData(format!(
                        "protocol version mismatch: client {PROTOCOL_VERSION}, server {version}"
                    )));
                }
                debug!(%server_version, "handshake complete");
                self.server_version = Some(server_version);
                self.state = SessionState::Handshaked;
                Ok(())
            }
            other => Err(unexpected(&other, "handshake response")),
        }
    }

    /// Authenticate with a token and optional target database. On rejection
    /// the session is closed; the server does not allow a second attempt.
    pub fn authenticate(&mut self, token: &str, database: Option<&str>) -> Result<()> {
        self.expect_state(SessionState::Handshaked, "authenticate")?;
        if token.is_empty() {
            return Err(CubeError::InvalidArgument("token must not be empty".into()));
        }

        let result = self.authenticate_inner(token, database);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn authenticate_inner(&mut self, token: &str, database: Option<&str>) -> Result<()> {
        self.send(&Message::AuthRequest {
            token: token.into(),
            database: database.map(String::from),
        })?;

        match self.recv()? {
            Message::AuthResponse {
                success,
                session_id,
            } => {
                if !success {
                    return Err(CubeError::Unauthenticated("authentication failed".into()));
                }
                debug!(%session_id, "authenticated");
                self.session_id = Some(session_id);
                self.state = SessionState::Authenticated;
                Ok(())
            }
            other => Err(unexpected(&other, "auth response")),
        }
    }

    /// Submit one SQL statement and collect its columnar result payload.
    ///
    /// The payload is a complete columnar stream (schema plus record
    /// batches) ready for the stream decoder. Standalone schema frames are
    /// skipped: each batch frame already carries a self-contained stream,
    /// and if the server sends several batch frames the last one wins.
    pub fn execute_query(&mut self, sql: &str) -> Result<Bytes> {
        self.expect_state(SessionState::Authenticated, "execute_query")?;
        self.state = SessionState::Querying;

        let result = self.execute_query_inner(sql);
        match &result {
            // Both outcomes arrived on intact framing; the session can run
            // another query.
            Ok(_) => self.state = SessionState::Authenticated,
            Err(CubeError::Unknown(_)) | Err(CubeError::InvalidData(_))
                if self.state == SessionState::Querying =>
            {
                self.state = SessionState::Authenticated
            }
            Err(_) => self.close(),
        }
        result
    }

    fn execute_query_inner(&mut self, sql: &str) -> Result<Bytes> {
        self.send(&Message::QueryRequest { sql: sql.into() })?;

        let mut payload: Option<Bytes> = None;
        loop {
            match self.recv().map_err(|e| self.desync(e))? {
                Message::QueryResponseSchema { .. } => {
                    // The batch payload embeds its own schema; a standalone
                    // schema stream would duplicate end-of-stream markers.
                    debug!("skipping standalone schema frame");
                }
                Message::QueryResponseBatch { ipc } => {
                    if payload.is_some() {
                        warn!("multiple batch frames for one query, keeping the last");
                    }
                    debug!(len = ipc.len(), "received batch payload");
                    payload = Some(ipc);
                }
                Message::QueryComplete { rows_affected } => {
                    self.last_rows_affected = rows_affected;
                    debug!(rows_affected, "query complete");
                    break;
                }
                Message::Error { code, message } => {
                    return Err(CubeError::Unknown(format!("[{code}]: {message}")));
                }
                other => {
                    return Err(self.desync(unexpected(&other, "query response")));
                }
            }
        }

        payload.ok_or_else(|| {
            CubeError::InvalidData("query completed without a result payload".into())
        })
    }

    /// Close the session. Idempotent; dropping the transport closes the
    /// socket deterministically.
    pub fn close(&mut self) {
        self.transport = None;
        self.state = SessionState::Closed;
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let frame = message.encode();
        self.transport_mut()?.write_frame(&frame)
    }

    fn recv(&mut self) -> Result<Message> {
        let frame = self.transport_mut()?.read_frame()?;
        Message::decode(&frame[4..])
    }

    fn transport_mut(&mut self) -> Result<&mut FramedTransport<S>> {
        self.transport
            .as_mut()
            .ok_or_else(|| CubeError::InvalidState("session is closed".into()))
    }

    fn expect_state(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(CubeError::InvalidState(format!(
                "{operation} requires {expected:?} state, session is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    // Framing can no longer be trusted after this error; mark the session
    // closed so the caller's state handling does not resurrect it.
    fn desync(&mut self, err: CubeError) -> CubeError {
        self.close();
        err
    }
}

fn unexpected(message: &Message, expected: &str) -> CubeError {
    CubeError::InvalidData(format!(
        "unexpected message type 0x{:02X}, expected {expected}",
        message.message_type()
    ))
}
