//! Common library for the Cube SQL native client
//!
//! This crate provides the types shared between the wire protocol and the
//! consumers of query results:
//!
//! * `error`: the error taxonomy used across the driver.
//! * `protocol`: the framed request/response messages spoken on the socket.
//! * `schema`: the logical schema of a query result.
//! * `batch`: columnar record batches handed to callers.

pub mod batch;
pub mod error;
pub mod protocol;
pub mod schema;

// Re-export commonly used types at the base
pub use batch::{Bitmap, Column, RecordBatch};
pub use error::{CubeError, Result};
pub use schema::{Field, LogicalType, Schema, TimeUnit};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the outer wire protocol.
pub const PROTOCOL_VERSION: u32 = 1;
