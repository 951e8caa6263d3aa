//! Raw stream sockets and readiness waits.
//!
//! `Stream` unifies TCP and unix sockets so the layers above never match on
//! the transport. `wait_ready` is the only place that blocks on a deadline.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

// Long waits are sliced so each poll timeout fits the platform's int millis.
const MAX_POLL_SLICE: Duration = Duration::from_secs(60);

/// A connected stream socket.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Stream::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_read_timeout(timeout),
            Stream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_write_timeout(timeout),
            Stream::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(stream) => stream.try_clone().map(Stream::Tcp),
            Stream::Unix(stream) => stream.try_clone().map(Stream::Unix),
        }
    }

    /// Shuts down both directions, waking any thread blocked on the socket.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(stream) => stream.as_fd(),
            Stream::Unix(stream) => stream.as_fd(),
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(stream: TcpStream) -> Self {
        Stream::Tcp(stream)
    }
}

impl From<UnixStream> for Stream {
    fn from(stream: UnixStream) -> Self {
        Stream::Unix(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Blocks until `fd` is ready for `interest` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. `None` waits indefinitely. Error and
/// hang-up conditions count as ready so the next I/O call reports them.
pub fn wait_ready<F: AsFd>(fd: &F, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
    let flags = match interest {
        Interest::Readable => PollFlags::POLLIN,
        Interest::Writable => PollFlags::POLLOUT,
    };
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                poll_timeout(remaining.min(MAX_POLL_SLICE))
            }
            None => PollTimeout::NONE,
        };

        let mut fds = [PollFd::new(fd.as_fd(), flags)];
        match poll(&mut fds, slice) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => return Ok(true),
            Err(errno) => return Err(errno.into()),
        }
    }
}

fn poll_timeout(remaining: Duration) -> PollTimeout {
    // Round up so sub-millisecond remainders still block instead of spinning.
    let millis = remaining.as_micros().div_ceil(1000) as u64;
    PollTimeout::try_from(Duration::from_millis(millis)).unwrap_or(PollTimeout::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_wait_times_out_without_data() {
        let (left, _right) = UnixStream::pair().unwrap();
        let start = Instant::now();
        let ready = wait_ready(&left, Interest::Readable, Some(Duration::from_millis(30))).unwrap();
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn readable_wait_returns_when_data_arrives() {
        let (left, mut right) = UnixStream::pair().unwrap();
        right.write_all(b"+OK\r\n").unwrap();
        assert!(wait_ready(&left, Interest::Readable, Some(Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn hang_up_counts_as_ready() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(right);
        assert!(wait_ready(&left, Interest::Readable, None).unwrap());
    }

    #[test]
    fn fresh_socket_is_writable() {
        let (left, _right) = UnixStream::pair().unwrap();
        let stream = Stream::from(left);
        assert!(wait_ready(&stream, Interest::Writable, Some(Duration::from_millis(100))).unwrap());
    }
}
