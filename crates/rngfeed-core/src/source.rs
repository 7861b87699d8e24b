//! Abstract entropy source trait.
//!
//! Every hardware or OS source implements [`EntropySource`], which provides
//! metadata via [`SourceInfo`] and a timed, blocking read into caller memory.

use std::io;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{ConfigError, SourceError};

/// How bytes are pulled out of the entropy source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// A character device (or any readable file) read as a byte stream.
    #[default]
    Stream,
    /// The operating system CSPRNG via `getrandom(2)`.
    Os,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Os => write!(f, "os"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "unixstream" => Ok(Self::Stream),
            "os" | "getrandom" => Ok(Self::Os),
            other => Err(ConfigError::UnknownDriver(other.to_string())),
        }
    }
}

/// Metadata about an entropy source driver.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Unique identifier (e.g. `"stream"`).
    pub name: &'static str,
    /// One-line human-readable description.
    pub description: &'static str,
    /// Which driver this is.
    pub driver: DriverKind,
}

/// Trait that every entropy source must implement.
///
/// A source is owned by exactly one thread at a time, so it needs `Send`
/// but not `Sync`.
pub trait EntropySource: Send {
    /// Source metadata.
    fn info(&self) -> &SourceInfo;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` in total.
    ///
    /// Returns the number of bytes written, which is at least 1. A partial
    /// fill is normal when the timeout expires after some bytes arrived.
    /// [`SourceError::Timeout`] means nothing arrived at all.
    fn read_block(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SourceError>;

    /// Try to recover after a device error. The default does nothing.
    fn reopen(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Human-readable location of the source (device path, etc.).
    fn location(&self) -> String {
        self.info().name.to_string()
    }

    /// Convenience: name from info.
    fn name(&self) -> &'static str {
        self.info().name
    }
}

/// Fill `buf` completely, retrying timeouts until `deadline_total` passes.
///
/// Used at startup to prime the continuous-run test, where a short read is
/// useless.
pub fn read_exact(
    source: &mut dyn EntropySource,
    buf: &mut [u8],
    per_read: Duration,
    deadline_total: Duration,
) -> Result<(), SourceError> {
    let started = std::time::Instant::now();
    let mut filled = 0;
    while filled < buf.len() {
        match source.read_block(&mut buf[filled..], per_read) {
            Ok(n) => filled += n,
            Err(SourceError::Timeout) if started.elapsed() < deadline_total => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
