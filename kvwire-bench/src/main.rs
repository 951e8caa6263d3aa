//! # Driver Latency Harness
//!
//! Purpose: Measure round-trip latency of each registered driver against a
//! live server so the two backends can be compared on the same workload.
//!
//! ## Design Principles
//! 1. **Same Workload**: Every driver runs the same PING/SET/GET loop.
//! 2. **Deterministic Keys**: A fixed PRNG seed keeps runs comparable.
//! 3. **Registry Dispatch**: Drivers are chosen by name, exactly as an
//!    application would choose them.
//!
//! Usage: `kvwire-bench [driver|all] [ops] [config.json]`

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use kvwire_client::{args, Config, Driver, DriverRegistry, Reply};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_OP_COUNT: usize = 10_000;
const KEY_COUNT: usize = 1 << 10;
const VALUE_SIZE: usize = 64;

struct BenchConfig {
    driver: String,
    op_count: usize,
    config_path: Option<PathBuf>,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let driver = args.next().unwrap_or_else(|| "all".to_string());
        let op_count = args
            .next()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_OP_COUNT)
            .max(1);
        let config_path = args.next().map(PathBuf::from);
        BenchConfig {
            driver,
            op_count,
            config_path,
        }
    }

    fn load_config(&self) -> Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default().with_timeout(1.0));
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

/// XorShift keeps key selection reproducible without extra dependencies.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_index(&mut self, bound: usize) -> usize {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x % bound as u64) as usize
    }
}

struct Latencies {
    samples: Vec<Duration>,
}

impl Latencies {
    fn with_capacity(capacity: usize) -> Self {
        Latencies {
            samples: Vec::with_capacity(capacity),
        }
    }

    fn record(&mut self, start: Instant) {
        self.samples.push(start.elapsed());
    }

    fn report(mut self, driver: &str, label: &str) {
        if self.samples.is_empty() {
            return;
        }
        self.samples.sort_unstable();
        let ops = self.samples.len();
        let total: Duration = self.samples.iter().sum();
        let percentile = |p: f64| self.samples[((ops - 1) as f64 * p) as usize];
        println!(
            "{driver:>6} {label:<4}: {ops} ops in {:.3}s ({:.0} ops/s, p50 {:?}, p99 {:?}, max {:?})",
            total.as_secs_f64(),
            ops as f64 / total.as_secs_f64(),
            percentile(0.50),
            percentile(0.99),
            self.samples[ops - 1],
        );
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if let Err(err) = run() {
        eprintln!("kvwire-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let bench = BenchConfig::from_args();
    let config = bench.load_config()?;
    config.validate()?;
    let registry = DriverRegistry::default();

    let drivers: Vec<&str> = if bench.driver == "all" {
        registry.names().collect()
    } else if registry.get(&bench.driver).is_some() {
        vec![bench.driver.as_str()]
    } else {
        bail!(
            "unknown driver {:?}; available: {}",
            bench.driver,
            registry.names().collect::<Vec<_>>().join(", ")
        );
    };

    info!(?drivers, ops = bench.op_count, scheme = ?config.scheme, "starting benchmark");
    for name in drivers {
        let mut driver = registry
            .connect(name, &config)
            .with_context(|| format!("connecting with {name} driver"))?;
        run_workload(name, driver.as_mut(), bench.op_count)?;
        driver.disconnect();
    }
    Ok(())
}

fn run_workload(name: &str, driver: &mut dyn Driver, op_count: usize) -> Result<()> {
    let value = vec![b'x'; VALUE_SIZE];

    let mut latencies = Latencies::with_capacity(op_count);
    for _ in 0..op_count {
        let start = Instant::now();
        let reply = driver.call(&args!["PING"])?;
        latencies.record(start);
        if reply.as_status() != Some("PONG") {
            warn!(%reply, "unexpected PING reply");
        }
    }
    latencies.report(name, "PING");

    let mut rng = XorShift64::new(0xA5A5_A5A5_A5A5_A5A5);
    let mut latencies = Latencies::with_capacity(op_count);
    for _ in 0..op_count {
        let key = format!("kvwire:bench:{}", rng.next_index(KEY_COUNT));
        let start = Instant::now();
        driver.call(&args!["SET", key, value.as_slice()])?;
        latencies.record(start);
    }
    latencies.report(name, "SET");

    let mut rng = XorShift64::new(0xA5A5_A5A5_A5A5_A5A5);
    let mut latencies = Latencies::with_capacity(op_count);
    for _ in 0..op_count {
        let key = format!("kvwire:bench:{}", rng.next_index(KEY_COUNT));
        let start = Instant::now();
        let reply = driver.call(&args!["GET", key])?;
        latencies.record(start);
        if matches!(reply, Reply::Bulk(None)) {
            bail!("GET returned nil for a key written in the SET phase");
        }
    }
    latencies.report(name, "GET");

    Ok(())
}
