//! Operating-system CSPRNG source.
//!
//! Mostly useful for testing the pipeline on machines without a hardware RNG:
//! feeding the kernel its own output adds no real entropy, so the preset
//! that selects this driver credits it conservatively.

use std::io;
use std::time::Duration;

use crate::error::SourceError;
use crate::source::{DriverKind, EntropySource, SourceInfo};

static OS_INFO: SourceInfo = SourceInfo {
    name: "os",
    description: "Operating system CSPRNG via getrandom(2)",
    driver: DriverKind::Os,
};

#[derive(Debug, Default)]
pub struct OsSource;

impl OsSource {
    pub fn new() -> Self {
        Self
    }
}

impl EntropySource for OsSource {
    fn info(&self) -> &SourceInfo {
        &OS_INFO
    }

    fn read_block(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, SourceError> {
        if buf.is_empty() {
            return Ok(0);
        }
        getrandom::fill(buf).map_err(|e| SourceError::Device(io::Error::other(e.to_string())))?;
        Ok(buf.len())
    }

    fn location(&self) -> String {
        "getrandom(2)".to_string()
    }
}
