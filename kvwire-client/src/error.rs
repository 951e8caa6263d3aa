//! Driver error taxonomy shared by both backends.

use std::io;

use kvwire_common::{CodecError, CommandError};
use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by a driver.
///
/// Nothing here is retried by the driver itself; every failure goes back to
/// the caller of the operation that failed.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Connect, write or read did not finish within the configured timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// A reply could not be parsed. The connection should not be trusted.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer closed the stream.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The OS refused or failed the connection.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),
    /// The server answered with an error reply.
    #[error("command error: {0}")]
    Command(#[from] CommandError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The driver was used after `disconnect`.
    #[error("not connected")]
    NotConnected,
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
}

impl DriverError {
    /// Classifies an OS error raised while performing `op`.
    pub fn from_io(op: &'static str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DriverError::Timeout(op),
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => DriverError::ConnectionReset,
            io::ErrorKind::NotConnected => DriverError::NotConnected,
            _ => DriverError::Connection(err),
        }
    }

    /// Classifies a decode failure raised while performing `op`.
    pub fn from_codec(op: &'static str, err: CodecError) -> Self {
        match err {
            CodecError::Io(err) => DriverError::from_io(op, err),
            CodecError::ConnectionReset => DriverError::ConnectionReset,
            err @ (CodecError::UnexpectedSigil(_) | CodecError::Protocol(_)) => {
                DriverError::Protocol(err.to_string())
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout(_))
    }
}
