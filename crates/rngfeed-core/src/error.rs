//! Error types and process exit codes for rngfeed.
//!
//! Recoverable conditions ([`SourceError::Timeout`], single FIPS failures,
//! retryable sink writes) are handled inside the stage that owns them.
//! Everything that ends the daemon is a [`DaemonError`], which knows its exit code.

use std::io;
use std::path::PathBuf;

use rngfeed_fips::FipsFailures;
use thiserror::Error;

use crate::pool::BufferState;

/// Clean shutdown.
pub const EXIT_SUCCESS: i32 = 0;
/// Generic failure (used by `rngfeed check` when a block fails).
pub const EXIT_FAIL: i32 = 1;
/// Bad arguments, bad configuration, or another instance holds the lock.
pub const EXIT_USAGE: i32 = 64;
/// Device, kernel, or other operating-system failure.
pub const EXIT_OSERR: i32 = 71;

/// Errors from an entropy source read.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No bytes arrived before the read timeout. Recoverable.
    #[error("timed out waiting for entropy source")]
    Timeout,
    /// The device failed in a way a timeout does not explain.
    #[error("entropy source device error: {0}")]
    Device(#[from] io::Error),
}

/// Errors from a kernel entropy submission.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Transient failure; the same data may be submitted again.
    #[error("transient kernel submission failure: {0}")]
    Retryable(#[source] io::Error),
    /// The kernel will not accept entropy from us.
    #[error("kernel submission failed: {0}")]
    Fatal(#[source] io::Error),
    /// Shutdown was requested while waiting to submit.
    #[error("submission cancelled by shutdown")]
    Cancelled,
}

impl SinkError {
    /// Sort an I/O error into retryable or fatal.
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Self::Retryable(err)
            }
            _ if err.raw_os_error() == Some(libc::ENOMEM) => Self::Retryable(err),
            _ => Self::Fatal(err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors from buffer pool operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was closed for shutdown.
    #[error("buffer pool closed")]
    Closed,
    /// A buffer was handed to an operation that does not accept its state.
    #[error("buffer {index}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        index: usize,
        from: BufferState,
        to: BufferState,
    },
    /// A buffer from a different pool was handed back.
    #[error("buffer {index} does not belong to this pool")]
    ForeignBuffer { index: usize },
    /// `commit_filled` was given more bytes than the buffer holds.
    #[error("fill length {len} exceeds buffer capacity {capacity}")]
    Overfill { len: usize, capacity: usize },
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("need at least 2 buffers, got {0}")]
    TooFewBuffers(usize),
    #[error("buffer size {0} is smaller than one FIPS block (2500 bytes)")]
    BufferTooSmall(usize),
    #[error("entropy factor must be in (0, 1], got {0}")]
    EntropyFactor(f64),
    #[error("random step must be at least 1 byte")]
    RandomStep,
    #[error("continuous-run width must be 8, 16, 24, ... 64 bits and divide the buffer, got {0} bits")]
    ContinuousWidth(usize),
    #[error("low watermark {low} is above high watermark {high}")]
    Watermarks { low: String, high: String },
    #[error("invalid watermark '{0}' (expected bits, or a percentage like 90%)")]
    BadWatermark(String),
    #[error("source timeout must be non-zero")]
    Timeout,
    #[error("unknown HRNG preset '{0}'")]
    UnknownPreset(String),
    #[error("unknown entropy source driver '{0}'")]
    UnknownDriver(String),
}

/// Failures acquiring the singleton PID lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("can't open or create {}: {cause}", .path.display())]
    Open { path: PathBuf, cause: io::Error },
    #[error("can't lock {}, running daemon's pid may be {}", .path.display(), pid_label(.pid))]
    Held { path: PathBuf, pid: Option<u32> },
    #[error("can't lock {}: {cause}", .path.display())]
    Lock { path: PathBuf, cause: io::Error },
    #[error("can't write pid to {}: {cause}", .path.display())]
    Write { path: PathBuf, cause: io::Error },
}

fn pid_label(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
}

/// Anything that stops the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("unsupported kernel detected ({0})")]
    UnsupportedKernel(String),

    #[error("can't open entropy source {}: {cause}", .path.display())]
    SourceOpen { path: PathBuf, cause: io::Error },

    #[error("entropy source {source_name} failed {attempts} times in a row: {cause}")]
    SourceFailed {
        source_name: String,
        attempts: u32,
        cause: io::Error,
    },

    #[error(
        "{consecutive} consecutive blocks failed FIPS tests (last: {last}), entropy source presumed broken"
    )]
    SourceBroken { consecutive: u32, last: FipsFailures },

    #[error("can't open kernel device {}: {cause}", .path.display())]
    KernelOpen { path: PathBuf, cause: io::Error },

    #[error("kernel entropy sink failed: {0}")]
    SinkFailed(#[source] io::Error),

    #[error("continuous-run state file {}: {cause}", .path.display())]
    StateFile { path: PathBuf, cause: io::Error },

    #[error("can't daemonize: {0}")]
    Daemonize(#[source] io::Error),

    #[error("insufficient resources to start threads: {0}")]
    Spawn(#[source] io::Error),

    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),

    #[error("buffer pool: {0}")]
    Pool(#[from] PoolError),
}

impl DaemonError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Lock(_) => EXIT_USAGE,
            _ => EXIT_OSERR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rngfeed_fips::FipsTest;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DaemonError::Config(ConfigError::RandomStep).exit_code(), EXIT_USAGE);
        let held = LockError::Held {
            path: PathBuf::from("/run/x.pid"),
            pid: Some(42),
        };
        assert_eq!(DaemonError::Lock(held).exit_code(), EXIT_USAGE);
        let broken = DaemonError::SourceBroken {
            consecutive: 3,
            last: [FipsTest::Monobit].into_iter().collect(),
        };
        assert_eq!(broken.exit_code(), EXIT_OSERR);
        assert_eq!(
            DaemonError::SinkFailed(io::Error::from_raw_os_error(libc::EPERM)).exit_code(),
            EXIT_OSERR
        );
    }

    #[test]
    fn test_lock_error_mentions_pid() {
        let err = LockError::Held {
            path: PathBuf::from("/run/rngfeed.pid"),
            pid: Some(1234),
        };
        assert!(err.to_string().contains("1234"));
        let unknown = LockError::Held {
            path: PathBuf::from("/run/rngfeed.pid"),
            pid: None,
        };
        assert!(unknown.to_string().contains("unknown"));
    }

    #[test]
    fn test_sink_error_classification() {
        assert!(SinkError::classify(io::Error::from(io::ErrorKind::Interrupted)).is_retryable());
        assert!(SinkError::classify(io::Error::from_raw_os_error(libc::EAGAIN)).is_retryable());
        assert!(SinkError::classify(io::Error::from_raw_os_error(libc::ENOMEM)).is_retryable());
        assert!(!SinkError::classify(io::Error::from_raw_os_error(libc::EPERM)).is_retryable());
        assert!(!SinkError::classify(io::Error::from_raw_os_error(libc::EBADF)).is_retryable());
    }

    #[test]
    fn test_source_broken_message() {
        let err = DaemonError::SourceBroken {
            consecutive: 25,
            last: [FipsTest::Monobit, FipsTest::Poker].into_iter().collect(),
        };
        let msg = err.to_string();
        assert!(msg.contains("25 consecutive"));
        assert!(msg.contains("monobit,poker"));
    }
}
