//! # Delegating Driver
//!
//! Purpose: Present the driver contract on top of an `Engine` whose blocking
//! `read` cannot be interrupted, while still returning to the caller when the
//! timeout passes.
//!
//! ## Design Principles
//! 1. **Worker Thread**: One lazily started reader thread runs read jobs
//!    strictly in submission order.
//! 2. **Sequence Tags**: Every job carries a sequence number and so does its
//!    completion. A caller only accepts its own completion; older ones left
//!    behind by a timed-out read are drained and dropped.
//! 3. **Single-Slot Hand-Off**: Jobs and completions travel over bounded
//!    channels of capacity one. Dropping either end stops the worker.
//!
//! ## Notes
//! - A timed-out read is not retracted. The engine keeps reading until its
//!   own timeout fires, and a reply it consumes in that window belongs to the
//!   abandoned request and is discarded.
//! - The caller's wait is the engine timeout plus `COMPLETION_GRACE`, so the
//!   engine normally reports its own timeout first.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use kvwire_common::{encode_command, Arg, Reply};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::driver::Driver;
use crate::engine::{BlockingEngine, Engine, EngineError};
use crate::error::{DriverError, DriverResult};

/// Extra wait on top of the engine timeout before the caller gives up.
pub const COMPLETION_GRACE: Duration = Duration::from_millis(100);

const WORKER_NAME: &str = "kvwire-engine-reader";

struct Completion {
    seq: u64,
    result: Result<Reply, EngineError>,
}

/// Caller side of the reader thread.
struct ReadWorker {
    jobs: Sender<u64>,
    completions: Receiver<Completion>,
}

impl ReadWorker {
    fn spawn<E: Engine>(engine: Arc<E>) -> std::io::Result<Self> {
        let (jobs, job_rx) = bounded::<u64>(1);
        let (completion_tx, completions) = bounded::<Completion>(1);

        thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || {
                for seq in job_rx.iter() {
                    let result = engine.read();
                    if completion_tx.send(Completion { seq, result }).is_err() {
                        break;
                    }
                }
                trace!("engine reader exiting");
            })?;

        Ok(ReadWorker { jobs, completions })
    }
}

/// Driver backed by an `Engine`, `BlockingEngine` unless stated otherwise.
pub struct EngineDriver<E: Engine = BlockingEngine> {
    engine: Option<Arc<E>>,
    worker: Option<ReadWorker>,
    timeout: Option<Duration>,
    next_seq: u64,
    write_buf: Vec<u8>,
}

impl<E: Engine> EngineDriver<E> {
    /// Connects through the engine, translating its timeout into
    /// `DriverError::Timeout`.
    pub fn connect(config: &Config) -> DriverResult<Self> {
        config.validate()?;
        let engine = E::connect(config).map_err(|err| engine_error("connect", err))?;
        debug!(scheme = ?config.scheme, timeout = ?config.timeout_duration(), "engine driver connected");
        Ok(Self::from_engine(engine, config.timeout_duration()))
    }

    /// Wraps a connected engine. The engine's timeout should already match.
    pub fn from_engine(engine: E, timeout: Option<Duration>) -> Self {
        EngineDriver {
            engine: Some(Arc::new(engine)),
            worker: None,
            timeout: timeout.filter(|timeout| !timeout.is_zero()),
            next_seq: 0,
            write_buf: Vec::with_capacity(256),
        }
    }

    fn engine(&self) -> DriverResult<&Arc<E>> {
        self.engine.as_ref().ok_or(DriverError::NotConnected)
    }

    fn worker(&mut self) -> DriverResult<&ReadWorker> {
        if self.worker.is_none() {
            let engine = self.engine()?.clone();
            let worker = ReadWorker::spawn(engine).map_err(DriverError::Connection)?;
            self.worker = Some(worker);
        }
        self.worker.as_ref().ok_or(DriverError::NotConnected)
    }
}

impl<E: Engine> Driver for EngineDriver<E> {
    fn write(&mut self, command: &[Arg]) -> DriverResult<()> {
        self.write_buf.clear();
        encode_command(command, &mut self.write_buf);
        trace!(bytes = self.write_buf.len(), "write command");
        let engine = self.engine()?;
        engine
            .write(&self.write_buf)
            .map_err(|err| engine_error("write", err))
    }

    fn read(&mut self) -> DriverResult<Reply> {
        self.engine()?;
        self.next_seq += 1;
        let seq = self.next_seq;
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout + COMPLETION_GRACE);
        let worker = self.worker()?;

        let sent = match deadline {
            Some(deadline) => worker.jobs.send_deadline(seq, deadline).map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DriverError::Timeout("read"),
                SendTimeoutError::Disconnected(_) => DriverError::ConnectionReset,
            }),
            None => worker.jobs.send(seq).map_err(|_| DriverError::ConnectionReset),
        };
        sent?;

        loop {
            let completion = match deadline {
                Some(deadline) => worker.completions.recv_deadline(deadline),
                None => worker
                    .completions
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            let completion = match completion {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(seq, "engine read still pending at deadline");
                    return Err(DriverError::Timeout("read"));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DriverError::ConnectionReset),
            };

            if completion.seq != seq {
                debug!(stale = completion.seq, current = seq, "discarding stale read result");
                continue;
            }

            let reply = completion.result.map_err(|err| engine_error("read", err))?;
            trace!(%reply, "read reply");
            return Ok(reply);
        }
    }

    fn disconnect(&mut self) {
        // Dropping the worker closes both channels, so a worker parked on
        // either one exits and releases its engine handle.
        self.worker = None;
        if let Some(engine) = self.engine.take() {
            engine.disconnect();
            debug!("engine driver disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.is_connected())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> DriverResult<()> {
        let timeout = timeout.filter(|timeout| !timeout.is_zero());
        self.engine()?
            .set_timeout(timeout)
            .map_err(|err| engine_error("set_timeout", err))?;
        self.timeout = timeout;
        Ok(())
    }
}

impl<E: Engine> Drop for EngineDriver<E> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn engine_error(op: &'static str, err: EngineError) -> DriverError {
    match err {
        EngineError::Io(err) => DriverError::from_io(op, err),
        EngineError::Protocol(message) => DriverError::Protocol(message),
        EngineError::Closed => DriverError::NotConnected,
    }
}
