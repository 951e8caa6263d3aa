//! # Blocking Engine
//!
//! Purpose: The connection-and-parsing engine behind the delegating driver.
//! An engine connects, writes and reads on its own with native socket
//! deadlines; once a `read` is running it cannot be cancelled except by
//! `disconnect`.
//!
//! ## Design Principles
//! 1. **Shared Handle**: All engine methods take `&self` so a reader thread
//!    and the caller can hold the same engine through an `Arc`.
//! 2. **Split Halves**: Reader and writer are separate clones of the socket,
//!    each behind its own mutex, so a blocked read never blocks a write.
//! 3. **Native Deadlines**: `SO_RCVTIMEO`/`SO_SNDTIMEO` bound every call at
//!    microsecond resolution.
//! 4. **Whole Replies**: Received bytes stay buffered until a reply parses,
//!    so a read that times out part way leaves the reply intact.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use kvwire_common::{read_reply, CodecError, Reply, ReplyBuffer, ReplyRead};
use thiserror::Error;

use crate::config::{Config, Scheme};
use crate::error::DriverError;
use crate::establish::{connect_unix, resolve};
use crate::stream::Stream;

const READ_CHUNK: usize = 16 * 1024;

/// Errors raised by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Protocol(String),
    /// The engine was disconnected.
    #[error("engine is closed")]
    Closed,
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(err) => EngineError::Io(err),
            CodecError::ConnectionReset => {
                EngineError::Io(io::Error::from(io::ErrorKind::ConnectionReset))
            }
            err @ (CodecError::UnexpectedSigil(_) | CodecError::Protocol(_)) => {
                EngineError::Protocol(err.to_string())
            }
        }
    }
}

/// External connection engine driven by `EngineDriver`.
pub trait Engine: Send + Sync + Sized + 'static {
    /// Connects with the engine's own blocking connect, bounded by the
    /// config's timeout.
    fn connect(config: &Config) -> Result<Self, EngineError>;

    /// Writes an already encoded command.
    fn write(&self, command: &[u8]) -> Result<(), EngineError>;

    /// Blocks until one reply is parsed or the engine's timeout fires.
    fn read(&self) -> Result<Reply, EngineError>;

    /// Closes the connection and wakes a blocked `read`.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), EngineError>;
}

/// Engine over a blocking std socket with kernel-enforced timeouts.
#[derive(Debug)]
pub struct BlockingEngine {
    // Buffered reader keeps unparsed bytes between replies.
    reader: Mutex<EngineReader>,
    writer: Mutex<Stream>,
    // Third handle so disconnect never waits on either mutex.
    control: Stream,
    connected: AtomicBool,
}

impl BlockingEngine {
    /// Wraps a connected blocking stream.
    pub fn from_stream(stream: Stream, timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        apply_timeouts(&stream, timeout)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(BlockingEngine {
            reader: Mutex::new(EngineReader {
                stream: reader,
                buffer: ReplyBuffer::with_capacity(READ_CHUNK),
            }),
            writer: Mutex::new(stream),
            control,
            connected: AtomicBool::new(true),
        })
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }
}

impl Engine for BlockingEngine {
    fn connect(config: &Config) -> Result<Self, EngineError> {
        let timeout = config.timeout_duration();
        let stream = match config.scheme {
            Scheme::Tcp => {
                let candidates = resolve(&config.host, config.port).map_err(establish_error)?;
                let stream = connect_tcp(&candidates, timeout)?;
                // Disable Nagle to keep request latency low for small payloads.
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            Scheme::Unix => {
                let path = config.path.as_deref().ok_or_else(|| {
                    EngineError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "unix scheme requires a path",
                    ))
                })?;
                Stream::Unix(connect_unix(path, timeout).map_err(establish_error)?)
            }
        };
        Ok(BlockingEngine::from_stream(stream, timeout)?)
    }

    fn write(&self, command: &[u8]) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut writer = lock(&self.writer);
        writer.write_all(command)?;
        writer.flush()?;
        Ok(())
    }

    fn read(&self) -> Result<Reply, EngineError> {
        self.ensure_open()?;
        let mut reader = lock(&self.reader);
        let reply = read_reply(&mut *reader);
        if !self.is_connected() {
            return Err(EngineError::Closed);
        }
        Ok(reply?)
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            // Wakes a reader blocked in recv; the peer may already be gone.
            let _ = self.control.shutdown();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        self.ensure_open()?;
        apply_timeouts(&self.control, timeout)?;
        Ok(())
    }
}

/// Stream with a rewindable reply buffer, read in blocking mode.
#[derive(Debug)]
struct EngineReader {
    stream: Stream,
    buffer: ReplyBuffer,
}

impl EngineReader {
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                Ok(read) => {
                    self.buffer.extend_from_slice(&chunk[..read]);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

impl ReplyRead for EngineReader {
    fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(line) = self.buffer.take_line() {
                return Ok(line);
            }
            self.fill()?;
        }
    }

    fn read_exact_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        loop {
            if let Some(bytes) = self.buffer.take_exact(len) {
                return Ok(bytes);
            }
            self.fill()?;
        }
    }

    fn begin_reply(&mut self) {
        self.buffer.checkpoint();
    }

    fn rewind_reply(&mut self) {
        self.buffer.rewind();
    }
}

// Connect failures from the shared establisher, in engine terms.
fn establish_error(err: DriverError) -> EngineError {
    match err {
        DriverError::Timeout(op) => {
            EngineError::Io(io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out")))
        }
        DriverError::Connection(err) => EngineError::Io(err),
        DriverError::ConnectionReset => {
            EngineError::Io(io::Error::from(io::ErrorKind::ConnectionReset))
        }
        other => EngineError::Io(io::Error::other(other)),
    }
}

/// Tries each candidate with the engine's own connect; a timeout stops the
/// search, other failures move on.
fn connect_tcp(candidates: &[SocketAddr], timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to");
    for addr in candidates {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Err(err)
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

// Socket options are per socket, so setting them on one clone covers all three.
fn apply_timeouts(stream: &Stream, timeout: Option<Duration>) -> io::Result<()> {
    let timeout = timeout.filter(|timeout| !timeout.is_zero());
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    fn engine_pair(timeout: Option<Duration>) -> (BlockingEngine, UnixStream) {
        let (left, right) = UnixStream::pair().unwrap();
        (BlockingEngine::from_stream(Stream::from(left), timeout).unwrap(), right)
    }

    #[test]
    fn writes_and_reads() {
        let (engine, mut peer) = engine_pair(Some(Duration::from_secs(1)));
        engine.write(b"*1\r\n$4\r\nPING\r\n").unwrap();
        let mut buf = [0u8; 14];
        peer.read_exact(&mut buf).unwrap();
        peer.write_all(b"+PONG\r\n").unwrap();
        assert_eq!(engine.read().unwrap(), Reply::Status("PONG".to_string()));
    }

    #[test]
    fn read_times_out_natively() {
        let (engine, _peer) = engine_pair(Some(Duration::from_millis(40)));
        let start = Instant::now();
        let err = engine.read().unwrap_err();
        assert!(
            matches!(err, EngineError::Io(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)),
            "unexpected error: {err:?}"
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn timed_out_bulk_is_read_whole_later() {
        let (engine, mut peer) = engine_pair(Some(Duration::from_millis(40)));
        peer.write_all(b"$5\r\nhel").unwrap();
        let err = engine.read().unwrap_err();
        assert!(matches!(err, EngineError::Io(_)), "unexpected error: {err:?}");

        peer.write_all(b"lo\r\n:7\r\n").unwrap();
        assert_eq!(engine.read().unwrap(), Reply::Bulk(Some(Bytes::from_static(b"hello"))));
        assert_eq!(engine.read().unwrap(), Reply::Integer(7));
    }

    #[test]
    fn unix_connect_is_bounded_by_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let engine = BlockingEngine::connect(&Config::unix(&path).with_timeout(1.0)).unwrap();
        assert!(engine.is_connected());
    }

    #[test]
    fn bad_sigil_is_protocol_error() {
        let (engine, mut peer) = engine_pair(Some(Duration::from_secs(1)));
        peer.write_all(b"?\r\n").unwrap();
        assert!(matches!(engine.read(), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn disconnect_wakes_blocked_reader() {
        let (engine, _peer) = engine_pair(None);
        let engine = std::sync::Arc::new(engine);
        let reader = {
            let engine = engine.clone();
            thread::spawn(move || engine.read())
        };
        thread::sleep(Duration::from_millis(30));
        engine.disconnect();
        assert!(reader.join().unwrap().is_err());
        assert!(!engine.is_connected());
        assert!(matches!(engine.write(b"x"), Err(EngineError::Closed)));
    }
}
