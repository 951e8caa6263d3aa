//! # Deadline-Bounded Socket
//!
//! Purpose: Give the codec blocking `read_line` / `read_exact_bytes` calls
//! that respect a mutable timeout on top of a non-blocking socket.
//!
//! ## Design Principles
//! 1. **Buffer First**: Requests are served from the application buffer; the
//!    socket is only touched when the buffer is short.
//! 2. **Whole Replies**: Bytes leave the buffer only once a whole reply has
//!    been parsed. A reply that times out part way is rewound, so the next
//!    read parses it again from its first byte.
//! 3. **Re-Armed Waits**: Every readiness wait reads the current timeout.

use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::Bytes;
use kvwire_common::{ReplyBuffer, ReplyRead};

use crate::stream::{wait_ready, Interest, Stream};

const READ_CHUNK: usize = 16 * 1024;

/// Non-blocking stream plus read buffer and current timeout.
#[derive(Debug)]
pub struct DeadlineSocket {
    stream: Option<Stream>,
    buffer: ReplyBuffer,
    timeout: Option<Duration>,
}

impl DeadlineSocket {
    /// Wraps a connected stream, switching it to non-blocking mode.
    pub fn new(stream: Stream, timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(DeadlineSocket {
            stream: Some(stream),
            buffer: ReplyBuffer::with_capacity(READ_CHUNK),
            timeout: normalize(timeout),
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Applies to the next readiness wait, not to one already in progress.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = normalize(timeout);
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Writes all of `data`, waiting for writability within the timeout.
    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        while !data.is_empty() {
            match stream.write(data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => data = &data[written..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !wait_ready(&*stream, Interest::Writable, timeout)? {
                        return Err(timed_out("write"));
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Closes the socket and drops buffered bytes. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone; the fd is released on drop either way.
            let _ = stream.shutdown();
        }
        self.buffer.clear();
    }

    /// Performs one read attempt into the buffer, waiting for readability
    /// when the socket has nothing yet.
    fn fill(&mut self) -> io::Result<()> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "peer closed the connection",
                    ))
                }
                Ok(read) => {
                    self.buffer.extend_from_slice(&chunk[..read]);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !wait_ready(&*stream, Interest::Readable, timeout)? {
                        return Err(timed_out("read"));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl ReplyRead for DeadlineSocket {
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

fn normalize(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|timeout| !timeout.is_zero())
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out"))
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvwire_common::{read_reply, Reply};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    fn socket_pair(timeout: Option<Duration>) -> (DeadlineSocket, UnixStream) {
        let (left, right) = UnixStream::pair().unwrap();
        (DeadlineSocket::new(Stream::from(left), timeout).unwrap(), right)
    }

    #[test]
    fn reads_line_split_across_writes() {
        let (mut socket, mut peer) = socket_pair(Some(Duration::from_secs(1)));
        let writer = thread::spawn(move || {
            peer.write_all(b"+PO").unwrap();
            thread::sleep(Duration::from_millis(20));
            peer.write_all(b"NG\r").unwrap();
            thread::sleep(Duration::from_millis(20));
            peer.write_all(b"\n:1\r\n").unwrap();
            peer
        });
        assert_eq!(socket.read_line().unwrap(), &b"+PONG"[..]);
        assert_eq!(socket.read_line().unwrap(), &b":1"[..]);
        drop(writer.join().unwrap());
    }

    #[test]
    fn bare_lf_stays_inside_the_line() {
        let (mut socket, mut peer) = socket_pair(Some(Duration::from_secs(1)));
        peer.write_all(b"+a\nb\r\n").unwrap();
        assert_eq!(socket.read_line().unwrap(), &b"+a\nb"[..]);
    }

    #[test]
    fn timeout_keeps_partial_data_for_the_next_read() {
        let (mut socket, mut peer) = socket_pair(Some(Duration::from_millis(50)));
        peer.write_all(b"$5\r\nhel").unwrap();

        assert_eq!(socket.read_line().unwrap(), &b"$5"[..]);
        let start = Instant::now();
        let err = socket.read_exact_bytes(5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));

        peer.write_all(b"lo\r\n").unwrap();
        assert_eq!(socket.read_exact_bytes(5).unwrap(), &b"hello"[..]);
    }

    #[test]
    fn timed_out_reply_is_parsed_again_from_its_start() {
        let (mut socket, mut peer) = socket_pair(Some(Duration::from_millis(50)));
        peer.write_all(b"*2\r\n:1\r\n").unwrap();
        let err = read_reply(&mut socket).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err:?}");

        peer.write_all(b":2\r\n+PONG\r\n").unwrap();
        assert_eq!(
            read_reply(&mut socket).unwrap(),
            Reply::MultiBulk(Some(vec![Reply::Integer(1), Reply::Integer(2)]))
        );
        assert_eq!(read_reply(&mut socket).unwrap(), Reply::Status("PONG".to_string()));
    }

    #[test]
    fn timeout_change_applies_to_next_wait() {
        let (mut socket, _peer) = socket_pair(Some(Duration::from_secs(30)));
        socket.set_timeout(Some(Duration::from_millis(20)));
        let start = Instant::now();
        assert_eq!(socket.read_line().unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_means_wait_forever() {
        let (socket, _peer) = socket_pair(Some(Duration::ZERO));
        assert_eq!(socket.timeout(), None);
    }

    #[test]
    fn end_of_stream_is_connection_reset() {
        let (mut socket, peer) = socket_pair(None);
        drop(peer);
        assert_eq!(socket.read_line().unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut socket, _peer) = socket_pair(None);
        socket.close();
        socket.close();
        assert!(!socket.is_connected());
        assert_eq!(socket.write_all(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
