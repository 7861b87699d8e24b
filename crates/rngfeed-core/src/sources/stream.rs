//! Byte-stream source: a hardware RNG character device such as `/dev/hwrng`,
//! or any file or pipe that produces random bytes.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::SourceError;
use crate::source::{DriverKind, EntropySource, SourceInfo};
use crate::sys;

static STREAM_INFO: SourceInfo = SourceInfo {
    name: "stream",
    description: "Character device or pipe read as a byte stream",
    driver: DriverKind::Stream,
};

pub struct StreamSource {
    path: PathBuf,
    file: File,
}

impl StreamSource {
    /// Open `path` read-only.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        debug!("opened entropy source {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Wrap an already-open file, e.g. one end of a pipe.
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EntropySource for StreamSource {
    fn info(&self) -> &SourceInfo {
        &STREAM_INFO
    }

    fn read_block(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SourceError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if !sys::poll_readable(self.file.as_raw_fd(), remaining)? {
                continue;
            }
            match self.file.read(&mut buf[filled..]) {
                Ok(0) if filled > 0 => break,
                Ok(0) => {
                    return Err(SourceError::Device(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("end of file on {}", self.path.display()),
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(SourceError::Device(e)),
            }
        }
        if filled == 0 {
            Err(SourceError::Timeout)
        } else {
            Ok(filled)
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        match File::open(&self.path) {
            Ok(file) => {
                self.file = file;
                debug!("reopened entropy source {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                warn!("can't reopen entropy source {}: {e}", self.path.display());
                Err(e)
            }
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
