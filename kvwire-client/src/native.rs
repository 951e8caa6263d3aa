//! # Self-Contained Driver
//!
//! Purpose: Implement the driver contract with nothing but the establisher,
//! the deadline-bounded socket and the codec.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `NativeDriver` hides sockets and framing behind the
//!    `Driver` trait.
//! 2. **Buffer Reuse**: One write buffer lives for the driver's lifetime.
//! 3. **Fail Fast**: Protocol violations surface immediately; the driver
//!    never reconnects or retries on its own.

use std::time::Duration;

use kvwire_common::{encode_command, read_reply, Arg, Reply};
use tracing::{debug, trace};

use crate::config::Config;
use crate::driver::Driver;
use crate::error::{DriverError, DriverResult};
use crate::establish::establish;
use crate::socket::DeadlineSocket;
use crate::stream::Stream;

/// Driver that performs socket I/O and parsing itself.
#[derive(Debug)]
pub struct NativeDriver {
    socket: DeadlineSocket,
    write_buf: Vec<u8>,
}

impl NativeDriver {
    /// Connects according to `config`.
    ///
    /// Fails with `DriverError::Timeout` when the connect does not finish
    /// within the configured timeout.
    pub fn connect(config: &Config) -> DriverResult<Self> {
        let timeout = config.timeout_duration();
        let stream = establish(config, timeout)?;
        debug!(scheme = ?config.scheme, ?timeout, "native driver connected");
        Self::from_stream(stream, timeout)
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: Stream, timeout: Option<Duration>) -> DriverResult<Self> {
        let socket = DeadlineSocket::new(stream, timeout)
            .map_err(|err| DriverError::from_io("connect", err))?;
        Ok(NativeDriver {
            socket,
            write_buf: Vec::with_capacity(256),
        })
    }

    fn ensure_connected(&self) -> DriverResult<()> {
        if self.socket.is_connected() {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }
}

impl Driver for NativeDriver {
    fn write(&mut self, command: &[Arg]) -> DriverResult<()> {
        self.ensure_connected()?;
        self.write_buf.clear();
        encode_command(command, &mut self.write_buf);
        trace!(bytes = self.write_buf.len(), "write command");
        self.socket
            .write_all(&self.write_buf)
            .map_err(|err| DriverError::from_io("write", err))
    }

    fn read(&mut self) -> DriverResult<Reply> {
        self.ensure_connected()?;
        let reply = read_reply(&mut self.socket).map_err(|err| DriverError::from_codec("read", err))?;
        trace!(%reply, "read reply");
        Ok(reply)
    }

    fn disconnect(&mut self) {
        if self.socket.is_connected() {
            self.socket.close();
            debug!("native driver disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    fn timeout(&self) -> Option<Duration> {
        self.socket.timeout()
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> DriverResult<()> {
        self.socket.set_timeout(timeout);
        Ok(())
    }
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}
