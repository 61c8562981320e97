//! Error definitions for the Cube SQL client

use thiserror::Error;

/// Errors produced by the Cube SQL client driver.
///
/// Variants follow the canonical driver status kinds: structural protocol
/// violations are always `InvalidData`, socket failures are `Io`, and
/// server-reported query errors are passed through as `Unknown` with the
/// server's code and message intact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CubeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("server error: {0}")]
    Unknown(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, CubeError>;

impl CubeError {
    /// Get the inner message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            CubeError::InvalidArgument(msg) => msg,
            CubeError::InvalidState(msg) => msg,
            CubeError::Io(msg) => msg,
            CubeError::Unauthenticated(msg) => msg,
            CubeError::InvalidData(msg) => msg,
            CubeError::Unknown(msg) => msg,
            CubeError::NotImplemented(msg) => msg,
        }
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            CubeError::InvalidArgument(_) => "invalid_argument",
            CubeError::InvalidState(_) => "invalid_state",
            CubeError::Io(_) => "io_error",
            CubeError::Unauthenticated(_) => "unauthenticated",
            CubeError::InvalidData(_) => "invalid_data",
            CubeError::Unknown(_) => "unknown",
            CubeError::NotImplemented(_) => "not_implemented",
        }
    }
}

/// Convert std::io::Error to CubeError
///
/// Shortcut as it's a common error we need to convert from.
impl From<std::io::Error> for CubeError {
    fn from(err: std::io::Error) -> Self {
        CubeError::Io(err.to_string())
    }
}
