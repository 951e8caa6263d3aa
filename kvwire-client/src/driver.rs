//! # Driver Contract and Registry
//!
//! Purpose: One call contract shared by every backend, plus an explicit list
//! of backends that configuration code selects from by name.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: Callers hold a `Box<dyn Driver>` and never see
//!    which backend is behind it.
//! 2. **Strict Alternation**: `write` then `read`, one outstanding read at a
//!    time. `&mut self` enforces it.
//! 3. **No Ambient Globals**: The registry is a value passed to whoever needs
//!    to pick a driver.

use std::fmt;
use std::time::Duration;

use kvwire_common::{Arg, Reply};

use crate::config::{seconds_to_duration, Config};
use crate::delegating::EngineDriver;
use crate::engine::BlockingEngine;
use crate::error::{DriverError, DriverResult};
use crate::native::NativeDriver;

/// Transport and protocol contract for one server connection.
pub trait Driver: Send {
    /// Encodes and sends one command.
    fn write(&mut self, command: &[Arg]) -> DriverResult<()>;

    /// Blocks until one complete reply arrives or the timeout elapses.
    ///
    /// An error reply from the server is returned as `Ok(Reply::Error(..))`;
    /// use `Reply::into_result` to raise it.
    fn read(&mut self) -> DriverResult<Reply>;

    /// Releases the connection. Calling it again does nothing.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn timeout(&self) -> Option<Duration>;

    /// Changes the timeout for subsequent blocking waits.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> DriverResult<()>;

    /// `set_timeout` in fractional seconds; `<= 0` disables the timeout.
    fn set_timeout_secs(&mut self, seconds: f64) -> DriverResult<()> {
        self.set_timeout(seconds_to_duration(seconds))
    }

    /// Writes a command and reads its reply, raising error replies.
    fn call(&mut self, command: &[Arg]) -> DriverResult<Reply> {
        self.write(command)?;
        Ok(self.read()?.into_result()?)
    }
}

/// Constructor for a registered driver.
pub type ConnectFn = fn(&Config) -> DriverResult<Box<dyn Driver>>;

/// A named driver implementation.
#[derive(Clone, Copy)]
pub struct DriverEntry {
    pub name: &'static str,
    pub connect: ConnectFn,
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry").field("name", &self.name).finish()
    }
}

impl DriverEntry {
    /// The self-contained socket driver.
    pub const NATIVE: DriverEntry = DriverEntry {
        name: "native",
        connect: connect_native,
    };

    /// The engine-backed driver.
    pub const ENGINE: DriverEntry = DriverEntry {
        name: "engine",
        connect: connect_engine,
    };
}

fn connect_native(config: &Config) -> DriverResult<Box<dyn Driver>> {
    Ok(Box::new(NativeDriver::connect(config)?))
}

fn connect_engine(config: &Config) -> DriverResult<Box<dyn Driver>> {
    Ok(Box::new(EngineDriver::<BlockingEngine>::connect(config)?))
}

/// Ordered list of available drivers. The first entry is the default.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    entries: Vec<DriverEntry>,
}

impl DriverRegistry {
    pub fn new(entries: Vec<DriverEntry>) -> Self {
        DriverRegistry { entries }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.name)
    }

    pub fn get(&self, name: &str) -> Option<&DriverEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn default_entry(&self) -> Option<&DriverEntry> {
        self.entries.first()
    }

    /// Connects with the driver registered under `name`.
    pub fn connect(&self, name: &str, config: &Config) -> DriverResult<Box<dyn Driver>> {
        let entry = self
            .get(name)
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))?;
        (entry.connect)(config)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        DriverRegistry::new(vec![DriverEntry::NATIVE, DriverEntry::ENGINE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_lists_both_drivers() {
        let registry = DriverRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["native", "engine"]);
        assert_eq!(registry.default_entry().map(|entry| entry.name), Some("native"));
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let registry = DriverRegistry::default();
        let err = registry.connect("missing", &Config::default()).err();
        assert!(matches!(err, Some(DriverError::UnknownDriver(ref name)) if name == "missing"));
    }

    #[test]
    fn every_default_entry_connects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let config = Config::unix(&path).with_timeout(1.0);

        let registry = DriverRegistry::default();
        for name in registry.names() {
            let mut driver = registry.connect(name, &config).unwrap();
            assert!(driver.is_connected(), "driver {name}");
            driver.disconnect();
        }
    }

    #[test]
    fn custom_registry_keeps_order() {
        let registry = DriverRegistry::new(vec![DriverEntry::ENGINE]);
        assert!(registry.get("native").is_none());
        assert_eq!(registry.default_entry().map(|entry| entry.name), Some("engine"));
    }
}
