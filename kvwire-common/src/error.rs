//! Codec error type.

use std::io;

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while decoding a reply from a byte source.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The byte source failed (including read timeouts raised below the codec).
    #[error("io error: {0}")]
    Io(io::Error),
    /// The peer closed the stream before a full reply arrived.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The reply line started with a byte that is not a known type sigil.
    #[error("protocol error; unexpected reply sigil {:?}", char::from(*.0))]
    UnexpectedSigil(u8),
    /// Any other framing violation.
    #[error("protocol error; {0}")]
    Protocol(String),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => CodecError::ConnectionReset,
            _ => CodecError::Io(err),
        }
    }
}

impl CodecError {
    /// True when the byte source gave up waiting (`WouldBlock`/`TimedOut`).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CodecError::Io(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_connection_reset() {
        let err = CodecError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, CodecError::ConnectionReset));
    }

    #[test]
    fn timeouts_stay_io() {
        let err = CodecError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, CodecError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(err.is_timeout());
        assert!(CodecError::from(io::Error::from(io::ErrorKind::WouldBlock)).is_timeout());
        assert!(!CodecError::ConnectionReset.is_timeout());
    }

    #[test]
    fn sigil_is_printed_as_char() {
        let err = CodecError::UnexpectedSigil(b'?');
        assert_eq!(err.to_string(), "protocol error; unexpected reply sigil '?'");
    }
}
