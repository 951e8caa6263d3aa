//! # Connection Establisher
//!
//! Purpose: Turn a `Config` into a connected, non-blocking `Stream` without
//! ever blocking past the configured timeout.
//!
//! ## Design Principles
//! 1. **Non-Blocking Connect**: Start the connect, then race writability
//!    against the timeout with `poll`.
//! 2. **Ordered Fall-Through**: TCP candidates are tried in resolver order;
//!    a refused or unreachable candidate moves on to the next one.
//! 3. **Terminal Timeouts**: A timeout ends the whole attempt, it is never
//!    charged to a single candidate.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{
    connect, getsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrLike,
    SockaddrStorage, UnixAddr,
};
use tracing::{debug, instrument, warn};

use crate::config::{Config, Scheme, TcpKeepalive};
use crate::error::{DriverError, DriverResult};
use crate::stream::{wait_ready, Interest, Stream};

// Pause between connect retries while a unix listener's backlog is full.
const BACKLOG_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Why a single connect attempt failed.
#[derive(Debug)]
enum ConnectFailure {
    TimedOut,
    Io(io::Error),
}

impl From<io::Error> for ConnectFailure {
    fn from(err: io::Error) -> Self {
        ConnectFailure::Io(err)
    }
}

impl From<Errno> for ConnectFailure {
    fn from(errno: Errno) -> Self {
        ConnectFailure::Io(errno.into())
    }
}

/// Connects according to `config`, bounded by `timeout`.
///
/// The returned stream is in non-blocking mode.
pub fn establish(config: &Config, timeout: Option<Duration>) -> DriverResult<Stream> {
    config.validate()?;
    match config.scheme {
        Scheme::Tcp => {
            let candidates = resolve(&config.host, config.port)?;
            let stream = connect_tcp_candidates(&candidates, timeout)?;
            if let Err(err) = stream.set_nodelay(true) {
                debug!(error = %err, "TCP_NODELAY not applied");
            }
            if let Some(keepalive) = &config.tcp_keepalive {
                apply_keepalive(&stream, keepalive);
            }
            Ok(Stream::Tcp(stream))
        }
        Scheme::Unix => {
            let path = config.path.as_deref().ok_or_else(|| {
                DriverError::InvalidConfig("unix scheme requires a path".to_string())
            })?;
            connect_unix(path, timeout).map(Stream::Unix)
        }
    }
}

/// Resolves `host:port` to candidate addresses in resolver order.
pub fn resolve(host: &str, port: u16) -> DriverResult<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(DriverError::Connection)?
        .collect();
    if candidates.is_empty() {
        return Err(DriverError::Connection(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}:{port} resolved to no addresses"),
        )));
    }
    Ok(candidates)
}

/// Connects to the first reachable candidate.
///
/// Recoverable failures (refused, unreachable, unsupported family) fall
/// through to the next candidate; the last candidate's failure is returned.
/// A timeout on any candidate fails the whole call immediately.
#[instrument(level = "debug", skip(candidates), fields(candidates = candidates.len()))]
pub fn connect_tcp_candidates(
    candidates: &[SocketAddr],
    timeout: Option<Duration>,
) -> DriverResult<TcpStream> {
    let mut last_err = None;
    for (idx, addr) in candidates.iter().enumerate() {
        match connect_tcp(addr, timeout) {
            Ok(stream) => {
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(ConnectFailure::TimedOut) => {
                warn!(%addr, ?timeout, "connect timed out");
                return Err(DriverError::Timeout("connect"));
            }
            Err(ConnectFailure::Io(err)) if err.kind() == io::ErrorKind::TimedOut => {
                warn!(%addr, error = %err, "connect timed out");
                return Err(DriverError::Timeout("connect"));
            }
            Err(ConnectFailure::Io(err)) => {
                let is_last = idx + 1 == candidates.len();
                if is_last || !is_recoverable(&err) {
                    return Err(DriverError::from_io("connect", err));
                }
                debug!(%addr, error = %err, "candidate failed, trying next");
                last_err = Some(err);
            }
        }
    }

    Err(match last_err {
        Some(err) => DriverError::from_io("connect", err),
        None => DriverError::InvalidConfig("no addresses to connect to".to_string()),
    })
}

/// Connects to a unix socket path, bounded by `timeout`.
#[instrument(level = "debug", skip(timeout))]
pub fn connect_unix(path: &Path, timeout: Option<Duration>) -> DriverResult<UnixStream> {
    let addr = UnixAddr::new(path).map_err(|errno| DriverError::Connection(errno.into()))?;
    let fd = stream_socket(AddressFamily::Unix)
        .map_err(|errno| DriverError::Connection(errno.into()))?;
    let stream = UnixStream::from(fd);
    stream.set_nonblocking(true).map_err(DriverError::Connection)?;

    match finish_connect(&stream, &addr, timeout) {
        Ok(()) => {
            debug!("connected");
            Ok(stream)
        }
        Err(ConnectFailure::TimedOut) => {
            warn!(?timeout, "connect timed out");
            Err(DriverError::Timeout("connect"))
        }
        Err(ConnectFailure::Io(err)) => Err(DriverError::from_io("connect", err)),
    }
}

fn connect_tcp(addr: &SocketAddr, timeout: Option<Duration>) -> Result<TcpStream, ConnectFailure> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = stream_socket(family)?;
    let stream = TcpStream::from(fd);
    stream.set_nonblocking(true)?;

    finish_connect(&stream, &SockaddrStorage::from(*addr), timeout)?;
    Ok(stream)
}

/// Creates a stream socket that is not inherited across `exec`.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn stream_socket(family: AddressFamily) -> nix::Result<OwnedFd> {
    socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn stream_socket(family: AddressFamily) -> nix::Result<OwnedFd> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(fd)
}

/// Issues a non-blocking connect and waits for it to settle.
///
/// `EAGAIN` means no connection was started (a unix listener's backlog is
/// full), so the connect is retried until the deadline. Only a connect in
/// progress goes on to the writability wait.
fn finish_connect<S: AsFd>(
    sock: &S,
    addr: &dyn SockaddrLike,
    timeout: Option<Duration>,
) -> Result<(), ConnectFailure> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let remaining = || deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

    loop {
        match connect(sock.as_fd().as_raw_fd(), addr) {
            Ok(()) => return Ok(()),
            Err(Errno::EINPROGRESS | Errno::EINTR) => break,
            Err(Errno::EAGAIN) => match remaining() {
                Some(left) if left.is_zero() => return Err(ConnectFailure::TimedOut),
                Some(left) => thread::sleep(left.min(BACKLOG_RETRY_DELAY)),
                None => thread::sleep(BACKLOG_RETRY_DELAY),
            },
            Err(errno) => return Err(errno.into()),
        }
    }

    if !wait_ready(sock, Interest::Writable, remaining())? {
        return Err(ConnectFailure::TimedOut);
    }

    match getsockopt(sock, sockopt::SocketError)? {
        0 => Ok(()),
        code => Err(ConnectFailure::Io(io::Error::from_raw_os_error(code))),
    }
}

fn is_recoverable(err: &io::Error) -> bool {
    let Some(code) = err.raw_os_error() else {
        return false;
    };
    matches!(
        Errno::from_raw(code),
        Errno::ECONNREFUSED
            | Errno::ECONNRESET
            | Errno::EHOSTUNREACH
            | Errno::ENETUNREACH
            | Errno::EADDRNOTAVAIL
            | Errno::EAFNOSUPPORT
    )
}

/// Applies keepalive settings. Failures are logged, never returned.
fn apply_keepalive(stream: &TcpStream, keepalive: &TcpKeepalive) {
    if let Err(errno) = set_keepalive(stream, keepalive) {
        debug!(error = %errno, "keepalive not applied");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_keepalive(stream: &TcpStream, keepalive: &TcpKeepalive) -> nix::Result<()> {
    use nix::sys::socket::setsockopt;

    setsockopt(stream, sockopt::KeepAlive, &true)?;
    setsockopt(stream, sockopt::TcpKeepIdle, &keepalive.time)?;
    setsockopt(stream, sockopt::TcpKeepInterval, &keepalive.intvl)?;
    setsockopt(stream, sockopt::TcpKeepCount, &keepalive.probes)?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_keepalive(_stream: &TcpStream, _keepalive: &TcpKeepalive) -> nix::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::sys::socket::{bind, listen, Backlog, SockaddrIn};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::os::unix::net::UnixListener;

    fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn connects_to_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_tcp_candidates(&[addr], Some(Duration::from_secs(1))).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn refused_last_candidate_propagates() {
        let err = connect_tcp_candidates(&[closed_addr()], Some(Duration::from_secs(1))).unwrap_err();
        assert!(
            matches!(err, DriverError::Connection(ref e) if e.kind() == io::ErrorKind::ConnectionRefused),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        assert!(matches!(
            connect_tcp_candidates(&[], None),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn resolves_localhost() {
        let candidates = resolve("127.0.0.1", 6379).unwrap();
        assert_eq!(candidates, vec!["127.0.0.1:6379".parse::<SocketAddr>().unwrap()]);
    }

    fn has_cloexec<F: AsFd>(fd: &F) -> bool {
        let flags = fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    /// Listener that queues one connection and never accepts.
    fn full_tcp_listener() -> TcpListener {
        let fd = stream_socket(AddressFamily::Inet).unwrap();
        bind(
            fd.as_raw_fd(),
            &SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
        )
        .unwrap();
        listen(&fd, Backlog::new(0).unwrap()).unwrap();
        TcpListener::from(fd)
    }

    fn full_unix_listener(path: &Path) -> UnixListener {
        let fd = stream_socket(AddressFamily::Unix).unwrap();
        bind(fd.as_raw_fd(), &UnixAddr::new(path).unwrap()).unwrap();
        listen(&fd, Backlog::new(0).unwrap()).unwrap();
        UnixListener::from(fd)
    }

    #[test]
    fn sockets_are_close_on_exec() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tcp = connect_tcp_candidates(&[listener.local_addr().unwrap()], None).unwrap();
        assert!(has_cloexec(&tcp));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloexec.sock");
        let _listener = UnixListener::bind(&path).unwrap();
        let unix = connect_unix(&path, None).unwrap();
        assert!(has_cloexec(&unix));
    }

    #[test]
    fn full_unix_backlog_times_out_instead_of_returning_unconnected_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.sock");
        let _listener = full_unix_listener(&path);

        let mut queued = Vec::new();
        let timed_out = (0..8).any(|_| {
            let start = Instant::now();
            match connect_unix(&path, Some(Duration::from_millis(100))) {
                Ok(stream) => {
                    assert!(stream.peer_addr().is_ok(), "connect returned an unconnected socket");
                    queued.push(stream);
                    false
                }
                Err(DriverError::Timeout("connect")) => {
                    assert!(start.elapsed() >= Duration::from_millis(100));
                    true
                }
                Err(err) => panic!("unexpected error: {err:?}"),
            }
        });
        assert!(timed_out, "backlog never filled after {} connects", queued.len());
    }

    #[test]
    fn timeout_stops_the_candidate_walk() {
        let full = full_tcp_listener();
        let full_addr = full.local_addr().unwrap();
        let mut queued = Vec::new();
        let saturated = (0..16).any(|_| {
            match connect_tcp_candidates(&[full_addr], Some(Duration::from_millis(200))) {
                Ok(stream) => {
                    queued.push(stream);
                    false
                }
                Err(err) => {
                    assert!(matches!(err, DriverError::Timeout("connect")), "unexpected error: {err:?}");
                    true
                }
            }
        });
        assert!(saturated, "listen queue never filled");

        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        live.set_nonblocking(true).unwrap();
        let err = connect_tcp_candidates(
            &[full_addr, live.local_addr().unwrap()],
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::Timeout("connect")), "unexpected error: {err:?}");
        assert_eq!(live.accept().unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn keepalive_options_are_applied() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::tcp("127.0.0.1", port)
            .with_timeout(1.0)
            .with_keepalive(TcpKeepalive {
                time: 30,
                intvl: 5,
                probes: 3,
            });
        let stream = establish(&config, config.timeout_duration()).unwrap();
        assert!(matches!(stream, Stream::Tcp(_)));
        assert!(getsockopt(&stream, sockopt::TcpNoDelay).unwrap());

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            assert!(getsockopt(&stream, sockopt::KeepAlive).unwrap());
            assert_eq!(getsockopt(&stream, sockopt::TcpKeepIdle).unwrap(), 30);
            assert_eq!(getsockopt(&stream, sockopt::TcpKeepInterval).unwrap(), 5);
            assert_eq!(getsockopt(&stream, sockopt::TcpKeepCount).unwrap(), 3);
        }
    }

    #[test]
    fn keepalive_is_off_without_config() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config::tcp("127.0.0.1", listener.local_addr().unwrap().port());
        let stream = establish(&config, None).unwrap();
        assert!(!getsockopt(&stream, sockopt::KeepAlive).unwrap());
    }

    #[test]
    fn connects_to_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.sock");
        let _listener = UnixListener::bind(&path).unwrap();
        let stream = connect_unix(&path, Some(Duration::from_secs(1))).unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[test]
    fn missing_unix_socket_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_unix(&dir.path().join("absent.sock"), None).unwrap_err();
        assert!(matches!(err, DriverError::Connection(_)), "unexpected error: {err:?}");
    }
}
