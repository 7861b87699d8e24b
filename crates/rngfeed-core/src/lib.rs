//! # rngfeed-core
//!
//! **Hardware RNG output, checked, into the kernel entropy pool.**
//!
//! `rngfeed-core` moves bytes from an entropy source (a hardware RNG character
//! device, or the OS CSPRNG for testing) through the FIPS 140-2 battery and
//! into the Linux kernel's entropy pool, crediting a configurable amount of
//! entropy per bit.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rngfeed_core::{Config, LinuxRandom, Pipeline, ShutdownToken, initial_context, open_source};
//!
//! # fn main() -> Result<(), rngfeed_core::DaemonError> {
//! let config = Arc::new(Config::default());
//! config.validate()?;
//! let mut source = open_source(&config)?;
//! let kernel = LinuxRandom::open(&config.random_device)?;
//! let context = initial_context(&config, source.as_mut())?;
//!
//! let shutdown = ShutdownToken::new();
//! let pipeline = Pipeline::start(config, source, Box::new(kernel), context, shutdown.clone())?;
//! // ... later, from a signal handler or another thread:
//! shutdown.cancel();
//! pipeline.join()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Source thread → [`BufferPool`] → FIPS thread → [`BufferPool`] → sink thread → kernel
//!
//! A fixed set of buffers cycles through the pool. The source blocks when every
//! buffer is full, the sink starves when none has passed testing, and buffers
//! that fail are recycled without ever reaching the kernel. Every stage only
//! touches its own [`StatsRegistry`] group.

pub mod config;
pub mod error;
pub mod fips;
pub mod kernel;
pub mod lock;
pub mod pipeline;
pub mod pool;
pub mod shutdown;
pub mod source;
pub mod sources;
pub mod stats;
mod sys;

pub use config::{Config, HrngPreset, PresetParams, Watermark};
pub use error::{
    ConfigError, DaemonError, EXIT_FAIL, EXIT_OSERR, EXIT_SUCCESS, EXIT_USAGE, LockError,
    PoolError, SinkError, SourceError,
};
pub use fips::{ContinuousRunState, FipsTestEngine};
pub use kernel::{KernelMode, KernelPool, KernelSink, LinuxRandom, WatermarkPolicy};
pub use lock::PidLock;
pub use pipeline::{Pipeline, initial_context, save_continuous_state};
pub use pool::{Buffer, BufferPool, BufferState, PoolCensus, Verdict};
pub use shutdown::ShutdownToken;
pub use source::{DriverKind, EntropySource, SourceInfo};
pub use sources::open_source;
pub use stats::{StatsRegistry, StatsSnapshot, TimingStat};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
