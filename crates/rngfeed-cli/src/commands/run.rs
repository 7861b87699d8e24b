use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use log::{error, info, warn};
use rngfeed_core::{
    Config, DaemonError, DriverKind, EXIT_SUCCESS, HrngPreset, KernelMode, LinuxRandom,
    PidLock, Pipeline, ShutdownToken, StatsSnapshot, Watermark, initial_context, open_source,
    save_continuous_state,
};

use super::parse_duration;
use crate::signals;

/// Options for `rngfeed run`. Unset options fall back to the preset's value,
/// then to the built-in default.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Entropy source device
    #[arg(short = 'r', long)]
    pub rng_device: Option<PathBuf>,

    /// Kernel random device
    #[arg(short = 'o', long)]
    pub random_device: Option<PathBuf>,

    /// PID file (daemon mode only)
    #[arg(short = 'p', long)]
    pub pidfile: Option<PathBuf>,

    /// Stay in the foreground
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Bytes per kernel submission
    #[arg(short = 's', long)]
    pub random_step: Option<usize>,

    /// Keep feeding until the kernel has this much entropy: bits, or a
    /// percentage of the pool ("90%", or the legacy "-90")
    #[arg(short = 'W', long, allow_hyphen_values = true)]
    pub fill_watermark: Option<Watermark>,

    /// Kernel wakeup threshold; defaults to the fill watermark
    #[arg(long, allow_hyphen_values = true)]
    pub low_watermark: Option<Watermark>,

    /// Feed at least this often even when the kernel is full (e.g. 5, 500ms)
    #[arg(short = 't', long, value_parser = parse_duration)]
    pub feed_interval: Option<Duration>,

    /// Source read timeout
    #[arg(short = 'T', long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Entropy per bit of source output, in (0, 1]
    #[arg(short = 'H', long)]
    pub rng_entropy: Option<f64>,

    /// Number of buffers in the pipeline
    #[arg(short = 'B', long)]
    pub rng_buffers: Option<usize>,

    /// Source driver: stream or os
    #[arg(long)]
    pub rng_driver: Option<DriverKind>,

    /// HRNG preset: generic, intelfwh or os
    #[arg(long, default_value = "generic")]
    pub preset: HrngPreset,

    /// Consecutive failing buffers before the source is declared broken
    #[arg(long)]
    pub max_bad_blocks: Option<u32>,

    /// Interval between statistics dumps
    #[arg(long, value_parser = parse_duration)]
    pub stats_interval: Option<Duration>,

    /// Keep the continuous-run test history in this file across restarts
    #[arg(long)]
    pub continuous_state: Option<PathBuf>,

    /// Also write each statistics dump to this file as JSON
    #[arg(long)]
    pub stats_json: Option<PathBuf>,
}

impl RunArgs {
    /// The preset's configuration with every explicitly set option applied.
    pub fn to_config(&self) -> Config {
        let mut config = Config::for_preset(self.preset);
        if let Some(path) = &self.rng_device {
            config.rng_device = path.clone();
        }
        if let Some(path) = &self.random_device {
            config.random_device = path.clone();
        }
        if let Some(path) = &self.pidfile {
            config.pidfile = path.clone();
        }
        config.daemonize = !self.foreground;
        if let Some(step) = self.random_step {
            config.random_step = step;
        }
        if let Some(mark) = self.fill_watermark {
            config.high_watermark = mark;
        }
        if self.low_watermark.is_some() {
            config.low_watermark = self.low_watermark;
        }
        if let Some(interval) = self.feed_interval {
            config.feed_interval = interval;
        }
        if let Some(timeout) = self.timeout {
            config.source_timeout = timeout;
        }
        if let Some(factor) = self.rng_entropy {
            config.entropy_factor = factor;
        }
        if let Some(buffers) = self.rng_buffers {
            config.buffers = buffers;
        }
        if let Some(driver) = self.rng_driver {
            config.driver = driver;
        }
        if let Some(max) = self.max_bad_blocks {
            config.max_bad_blocks = max;
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval = interval;
        }
        if self.continuous_state.is_some() {
            config.continuous_state = self.continuous_state.clone();
        }
        config
    }
}

pub fn run(args: &RunArgs) -> i32 {
    match daemon(args) {
        Ok(()) => {
            info!("exiting");
            EXIT_SUCCESS
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

fn daemon(args: &RunArgs) -> Result<(), DaemonError> {
    KernelMode::detect().ensure_supported()?;
    let config = args.to_config();
    config.validate()?;

    let mut source = open_source(&config)?;
    let kernel = LinuxRandom::open(&config.random_device)?;

    let _lock = if config.daemonize {
        let mut lock = PidLock::acquire(&config.pidfile)?;
        // SAFETY: no threads exist yet; daemon() forks and exits the parent.
        if unsafe { libc::daemon(0, 1) } != 0 {
            return Err(DaemonError::Daemonize(std::io::Error::last_os_error()));
        }
        lock.write_pid()?;
        Some(lock)
    } else {
        None
    };

    let shutdown = ShutdownToken::new();
    signals::install(&shutdown)
        .map_err(|e| DaemonError::Spawn(std::io::Error::other(e.to_string())))?;

    info!("rngfeed {} starting up...", rngfeed_core::VERSION);
    info!(
        "source {} ({}), {} buffers of {} bytes, entropy factor {}",
        source.location(),
        config.driver,
        config.buffers,
        config.buffer_size,
        config.entropy_factor
    );

    let context = initial_context(&config, source.as_mut())?;
    let config = Arc::new(config);
    let pipeline = Pipeline::start(
        Arc::clone(&config),
        source,
        Box::new(kernel),
        context,
        shutdown,
    )?;

    let stats_json = args.stats_json.as_deref();
    pipeline.supervise(config.stats_interval, signals::dump_request(), |snap| {
        record_stats(stats_json, snap)
    });

    let (result, final_stats) = pipeline.finish();
    record_stats(stats_json, &final_stats);
    save_continuous_state(&config, &result?)
}

/// Write a dump to the `--stats-json` file, if one was asked for.
fn record_stats(path: Option<&Path>, snap: &StatsSnapshot) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = write_stats_json(path, snap) {
        warn!("can't write statistics to {}: {e}", path.display());
    }
}

fn write_stats_json(path: &Path, snap: &StatsSnapshot) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(snap).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
