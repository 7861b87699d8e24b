//! Kernel entropy pool interface and the sink stage that feeds it.
//!
//! The sink submits tested bytes in `random_step`-sized chunks. While the
//! kernel holds less than the high watermark it submits immediately;
//! otherwise it sleeps up to `feed_interval` per chunk, waking early when the
//! kernel asks for entropy or shutdown is requested.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{DaemonError, SinkError};
use crate::pool::Buffer;
use crate::shutdown::ShutdownToken;
use crate::stats::StatsRegistry;
use crate::sys;

/// Kernel pool size assumed when `/proc` does not say.
pub const DEFAULT_POOL_SIZE_BITS: u32 = 4096;

const POOL_SIZE_PATH: &str = "/proc/sys/kernel/random/poolsize";
const WAKEUP_THRESHOLD_PATH: &str = "/proc/sys/kernel/random/write_wakeup_threshold";

/// Longest single sleep while waiting for the kernel, so shutdown is noticed.
const WAIT_SLICE: Duration = Duration::from_millis(250);
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);

// _IOR('R', 0x00, int) and _IOW('R', 0x03, int[2]) from <linux/random.h>.
const RNDGETENTCNT: u64 = 0x8004_5200;
const RNDADDENTROPY: u64 = 0x4008_5203;

/// What the host kernel supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelMode {
    Linux,
    Unsupported,
}

impl KernelMode {
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Unsupported
        }
    }

    pub fn ensure_supported(self) -> Result<(), DaemonError> {
        match self {
            Self::Linux => Ok(()),
            Self::Unsupported => Err(DaemonError::UnsupportedKernel(
                std::env::consts::OS.to_string(),
            )),
        }
    }
}

/// The kernel's entropy pool, as the sink sees it.
pub trait KernelPool: Send {
    /// Pool capacity in bits, for resolving percentage watermarks.
    fn pool_size_bits(&self) -> u32 {
        DEFAULT_POOL_SIZE_BITS
    }

    /// Bits of entropy the kernel currently credits itself with.
    fn entropy_level(&self) -> io::Result<u32>;

    /// Mix `data` into the pool, crediting `entropy_bits`.
    fn add_entropy(&mut self, data: &[u8], entropy_bits: u32) -> io::Result<()>;

    /// Block up to `timeout` until the kernel wants more entropy.
    /// Returns `Ok(true)` if it does.
    fn wait_for_demand(&self, timeout: Duration) -> io::Result<bool>;

    /// Ask the kernel to wake writers when it drops below `bits`.
    fn set_wakeup_threshold(&mut self, _bits: u32) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Linux /dev/random
// ---------------------------------------------------------------------------

pub struct LinuxRandom {
    path: PathBuf,
    file: File,
    pool_size_bits: u32,
}

impl LinuxRandom {
    pub fn open(path: &Path) -> Result<Self, DaemonError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|cause| DaemonError::KernelOpen {
                path: path.to_path_buf(),
                cause,
            })?;
        let pool_size_bits =
            sys::read_first_u32(Path::new(POOL_SIZE_PATH)).unwrap_or(DEFAULT_POOL_SIZE_BITS);
        debug!(
            "opened kernel device {} (pool size {pool_size_bits} bits)",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            pool_size_bits,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KernelPool for LinuxRandom {
    fn pool_size_bits(&self) -> u32 {
        self.pool_size_bits
    }

    fn entropy_level(&self) -> io::Result<u32> {
        let mut count: libc::c_int = 0;
        // SAFETY: RNDGETENTCNT writes a single int through the pointer, which
        // points at a live local.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                RNDGETENTCNT as _,
                &mut count as *mut libc::c_int,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(count.max(0) as u32)
    }

    fn add_entropy(&mut self, data: &[u8], entropy_bits: u32) -> io::Result<()> {
        let len = libc::c_int::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entropy chunk too large"))?;
        let bits = libc::c_int::try_from(entropy_bits).unwrap_or(libc::c_int::MAX);
        // struct rand_pool_info { int entropy_count; int buf_size; __u32 buf[]; }
        let mut request = Vec::with_capacity(8 + data.len());
        request.extend_from_slice(&bits.to_ne_bytes());
        request.extend_from_slice(&len.to_ne_bytes());
        request.extend_from_slice(data);
        // SAFETY: `request` holds a complete rand_pool_info header followed by
        // exactly `buf_size` bytes, and outlives the call.
        let rc =
            unsafe { libc::ioctl(self.file.as_raw_fd(), RNDADDENTROPY as _, request.as_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_for_demand(&self, timeout: Duration) -> io::Result<bool> {
        sys::poll_writable(self.file.as_raw_fd(), timeout)
    }

    fn set_wakeup_threshold(&mut self, bits: u32) -> io::Result<()> {
        std::fs::write(WAKEUP_THRESHOLD_PATH, format!("{bits}\n"))
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// When to submit, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkPolicy {
    pub low_bits: u32,
    pub high_bits: u32,
    pub feed_interval: Duration,
}

impl WatermarkPolicy {
    pub fn from_config(config: &Config, pool_size_bits: u32) -> Self {
        let high_bits = config.high_watermark.resolve(pool_size_bits);
        let low_bits = config.low_watermark().resolve(pool_size_bits).min(high_bits);
        Self {
            low_bits,
            high_bits,
            feed_interval: config.feed_interval,
        }
    }

    /// Submit without waiting when the kernel holds `level` bits.
    pub fn submit_now(&self, level: u32) -> bool {
        level < self.high_bits
    }
}

/// Entropy credited for `bytes` bytes: `floor(bytes * 8 * factor)`.
///
/// Never rounds up; the kernel must not be credited more than configured.
pub fn entropy_bits(bytes: u64, factor: f64) -> u64 {
    (bytes as f64 * 8.0 * factor.clamp(0.0, 1.0)).floor() as u64
}

pub struct KernelSink {
    kernel: Box<dyn KernelPool>,
    policy: WatermarkPolicy,
    random_step: usize,
    entropy_factor: f64,
    max_retries: u32,
    stats: Arc<StatsRegistry>,
    shutdown: ShutdownToken,
}

impl KernelSink {
    pub fn new(
        mut kernel: Box<dyn KernelPool>,
        config: &Config,
        stats: Arc<StatsRegistry>,
        shutdown: ShutdownToken,
    ) -> Self {
        let policy = WatermarkPolicy::from_config(config, kernel.pool_size_bits());
        if let Err(e) = kernel.set_wakeup_threshold(policy.low_bits) {
            warn!("can't set kernel write wakeup threshold to {}: {e}", policy.low_bits);
        }
        info!(
            "feeding kernel below {} bits, wakeup at {} bits",
            policy.high_bits, policy.low_bits
        );
        Self {
            kernel,
            policy,
            random_step: config.random_step.max(1),
            entropy_factor: config.entropy_factor,
            max_retries: config.max_sink_retries,
            stats,
            shutdown,
        }
    }

    pub fn policy(&self) -> &WatermarkPolicy {
        &self.policy
    }

    /// Submit a whole buffer.
    ///
    /// On success the buffer's entropy estimate is set to
    /// `floor(fill_len * 8 * factor)` and both counters have been advanced by
    /// what was submitted. Transient kernel errors are retried with backoff;
    /// if they persist past the retry limit they become [`SinkError::Fatal`].
    pub fn submit(&mut self, buf: &mut Buffer) -> Result<(), SinkError> {
        let data = buf.filled();
        let mut credited = 0u64;
        let mut offset = 0usize;
        for chunk in data.chunks(self.random_step) {
            self.wait_for_room()?;
            let end = offset + chunk.len();
            let bits = entropy_bits(end as u64, self.entropy_factor)
                - entropy_bits(offset as u64, self.entropy_factor);
            self.submit_chunk(chunk, bits)?;
            credited += bits;
            offset = end;
        }
        buf.set_entropy_estimate_bits(credited);
        Ok(())
    }

    fn submit_chunk(&mut self, chunk: &[u8], bits: u64) -> Result<(), SinkError> {
        let bits32 = u32::try_from(bits).unwrap_or(u32::MAX);
        let mut attempt = 0u32;
        loop {
            match self.kernel.add_entropy(chunk, bits32).map_err(SinkError::classify) {
                Ok(()) => {
                    self.stats.record_bytes_sent(chunk.len(), bits);
                    return Ok(());
                }
                Err(SinkError::Retryable(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    self.stats.record_sink_retry();
                    let backoff = RETRY_BACKOFF_BASE
                        .saturating_mul(1 << attempt.min(16))
                        .min(RETRY_BACKOFF_MAX);
                    debug!("kernel rejected entropy ({e}), retry {attempt} in {backoff:?}");
                    if self.shutdown.wait_timeout(backoff) {
                        return Err(SinkError::Cancelled);
                    }
                }
                Err(SinkError::Retryable(e)) => return Err(SinkError::Fatal(e)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait until the kernel has room for more entropy, or `feed_interval`
    /// passes, or shutdown is requested.
    fn wait_for_room(&mut self) -> Result<(), SinkError> {
        if self.shutdown.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        match self.kernel.entropy_level() {
            Ok(level) if self.policy.submit_now(level) => return Ok(()),
            Ok(_) => {}
            Err(e) => debug!("can't read kernel entropy level: {e}"),
        }
        let deadline = Instant::now() + self.policy.feed_interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.kernel.wait_for_demand(remaining.min(WAIT_SLICE)) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    debug!("waiting for kernel demand failed: {e}");
                    if self.shutdown.wait_timeout(remaining.min(WAIT_SLICE)) {
                        return Err(SinkError::Cancelled);
                    }
                }
            }
            if self.shutdown.is_cancelled() {
                return Err(SinkError::Cancelled);
            }
        }
    }
}
