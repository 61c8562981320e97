//! Cube SQL native client
//!
//! A blocking client for the Cube SQL native wire protocol. Query results
//! arrive as a columnar stream and are decoded into record batches that can
//! be pulled one at a time, or exported to other runtimes through the
//! columnar-interchange C ABI (see [`ffi`]).
//!
//! # Example
//!
//! ```no_run
//! use cubesql_client::ClientBuilder;
//!
//! fn main() -> cubesql_common::Result<()> {
//!     let mut client = ClientBuilder::new("localhost", 4444)
//!         .token("secret")
//!         .database("analytics")
//!         .connect()?;
//!
//!     let mut result = client.query("SELECT city, population FROM cities")?;
//!     let schema = result.schema()?.clone();
//!     println!("{} columns", schema.len());
//!     while let Some(batch) = result.next_batch()? {
//!         println!("{} rows", batch.num_rows());
//!     }
//!     Ok(())
//! }
//! ```

use tracing::debug;

pub use cubesql_common::{
    Bitmap, Column, CubeError, Field, LogicalType, RecordBatch, Result, Schema, TimeUnit,
};
pub use session::{ClientSession, SessionState};
pub use stream::BatchStream;
pub use transport::FramedTransport;

pub mod ffi;
mod ipc;
mod session;
mod stream;
mod transport;

/// Environment variable consulted for the authentication token when the
/// builder is not given one explicitly.
pub const TOKEN_ENV_VAR: &str = "CUBESQL_CUBE_TOKEN";

/// Wire protocol selection.
///
/// Only the native protocol is implemented; the PostgreSQL-compatible text
/// protocol is exposed as a mode flag for configuration parity and returns
/// `NotImplemented` when selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    #[default]
    Native,
    PostgresWire,
}

/// Builder for configuring and opening a [`Client`].
///
/// # Example
///
/// ```no_run
/// use cubesql_client::ClientBuilder;
///
/// # fn main() -> cubesql_common::Result<()> {
/// let client = ClientBuilder::new("localhost", 4444)
///     .token("secret")
///     .connect()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    host: String,
    port: u16,
    token: Option<String>,
    database: Option<String>,
    mode: ProtocolMode,
}

impl ClientBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            token: None,
            database: None,
            mode: ProtocolMode::Native,
        }
    }

    /// Set the authentication token. Without one, the builder falls back to
    /// the `CUBESQL_CUBE_TOKEN` environment variable.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the target database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Select the wire protocol.
    pub fn mode(mut self, mode: ProtocolMode) -> Self {
        self.mode = mode;
        self
    }

    /// Connect, handshake, and authenticate, returning a ready client.
    pub fn connect(self) -> Result<Client> {
        if self.mode == ProtocolMode::PostgresWire {
            return Err(CubeError::NotImplemented(
                "PostgreSQL wire protocol not yet implemented".into(),
            ));
        }
        if self.host.is_empty() {
            return Err(CubeError::InvalidArgument("host must not be empty".into()));
        }
        let token = Self::resolve_token(self.token, std::env::var(TOKEN_ENV_VAR).ok())?;

        let mut session = ClientSession::connect(&self.host, self.port)?;
        session.handshake()?;
        session.authenticate(&token, self.database.as_deref())?;
        debug!(
            host = %self.host,
            port = self.port,
            server_version = session.server_version().unwrap_or(""),
            "client connected"
        );
        Ok(Client { session })
    }

    fn resolve_token(explicit: Option<String>, env_token: Option<String>) -> Result<String> {
        explicit.or(env_token).ok_or_else(|| {
            CubeError::InvalidArgument("native connection mode requires a token".into())
        })
    }
}

/// A connected, authenticated Cube SQL client.
///
/// One client drives one session: queries run one at a time, and the client
/// must not be shared across threads.
#[derive(Debug)]
pub struct Client {
    session: ClientSession,
}

impl Client {
    /// Execute a SQL statement and stream back its result batches.
    pub fn query(&mut self, sql: &str) -> Result<BatchStream> {
        let payload = self.session.execute_query(sql)?;
        BatchStream::new(payload, self.session.last_rows_affected())
    }

    /// Server version string reported during the handshake.
    pub fn server_version(&self) -> Option<&str> {
        self.session.server_version()
    }

    /// Session identifier assigned on authentication.
    pub fn session_id(&self) -> Option<&str> {
        self.session.session_id()
    }

    /// Close the connection. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        self.session.close();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_wire_mode_is_deferred() {
        let err = ClientBuilder::new("localhost", 4444)
            .token("t")
            .mode(ProtocolMode::PostgresWire)
            .connect()
            .unwrap_err();
        assert_eq!(err.kind(), "not_implemented");
    }

    #[test]
    fn empty_host_is_rejected() {
        let err = ClientBuilder::new("", 4444).token("t").connect().unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn missing_token_is_rejected() {
        let err = ClientBuilder::resolve_token(None, None).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn explicit_token_wins_over_environment() {
        let token = ClientBuilder::resolve_token(Some("builder".into()), Some("env".into()));
        assert_eq!(token.unwrap(), "builder");

        let fallback = ClientBuilder::resolve_token(None, Some("env".into()));
        assert_eq!(fallback.unwrap(), "env");
    }
}
