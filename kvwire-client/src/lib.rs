//! # kvwire Sync Client Transport
//!
//! Purpose: Send RESP commands to a Redis-compatible server and read the
//! replies back, over TCP or Unix sockets, with a timeout that holds even
//! while a reply arrives in pieces.
//!
//! ## Design Principles
//! 1. **Interchangeable Drivers**: `NativeDriver` does its own socket I/O;
//!    `EngineDriver` hands the work to an `Engine` on a reader thread. Both
//!    sit behind the `Driver` trait.
//! 2. **Explicit Registry**: `DriverRegistry` lists drivers by name instead of
//!    discovering them at runtime.
//! 3. **Errors as Values**: Server error replies come back as
//!    `Reply::Error`; transport failures come back as `DriverError`.

mod config;
mod delegating;
mod driver;
mod engine;
mod error;
mod establish;
mod native;
mod socket;
mod stream;

pub use config::{seconds_to_duration, Config, Scheme, TcpKeepalive};
pub use delegating::{EngineDriver, COMPLETION_GRACE};
pub use driver::{ConnectFn, Driver, DriverEntry, DriverRegistry};
pub use engine::{BlockingEngine, Engine, EngineError};
pub use error::{DriverError, DriverResult};
pub use establish::{connect_tcp_candidates, connect_unix, establish, resolve};
pub use native::NativeDriver;
pub use socket::DeadlineSocket;
pub use stream::{wait_ready, Interest, Stream};

pub use kvwire_common::{args, Arg, CommandError, Reply};
