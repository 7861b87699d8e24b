//! Singleton PID-file lock.
//!
//! The lock is an exclusive `flock(2)` on the PID file, held for as long as
//! the [`PidLock`] lives. The file itself is left behind on exit; only the
//! lock matters.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::LockError;

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    /// Lock `path` and write our PID into it.
    ///
    /// Fails with [`LockError::Held`] (carrying the other PID when it can be
    /// read) if another process holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|cause| LockError::Open {
                path: path.to_path_buf(),
                cause,
            })?;

        loop {
            // SAFETY: flock on a descriptor we own; no memory is passed.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    return Err(LockError::Held {
                        path: path.to_path_buf(),
                        pid: read_pid(&file),
                    });
                }
                _ => {
                    return Err(LockError::Lock {
                        path: path.to_path_buf(),
                        cause: err,
                    });
                }
            }
        }

        let mut lock = Self {
            path: path.to_path_buf(),
            file,
        };
        lock.write_pid()?;
        debug!("locked {} as pid {}", lock.path.display(), std::process::id());
        Ok(lock)
    }

    /// Rewrite the PID file with the current PID (after daemonizing, the
    /// process has a new one; the lock itself survives the fork).
    pub fn write_pid(&mut self) -> Result<(), LockError> {
        let pid = std::process::id();
        let write = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{pid}")?;
            file.flush()
        };
        write(&mut self.file).map_err(|cause| LockError::Write {
            path: self.path.clone(),
            cause,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_pid(mut file: &File) -> Option<u32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}
