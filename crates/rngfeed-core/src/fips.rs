//! The FIPS stage: runs the battery on each buffer, keeps the counters and
//! decides when a run of failures means the source is broken.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use rngfeed_fips::{FIPS_BLOCK_BYTES, FipsContext, FipsFailures};
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::pool::Verdict;
use crate::stats::StatsRegistry;

pub struct FipsTestEngine {
    context: FipsContext,
    stats: Arc<StatsRegistry>,
    consecutive_failures: u32,
    max_consecutive: u32,
}

impl FipsTestEngine {
    /// `max_consecutive` failing buffers in a row are fatal.
    pub fn new(context: FipsContext, stats: Arc<StatsRegistry>, max_consecutive: u32) -> Self {
        Self {
            context,
            stats,
            consecutive_failures: 0,
            max_consecutive: max_consecutive.max(1),
        }
    }

    /// Test one buffer, one FIPS block at a time.
    ///
    /// A failure is counted and reported as [`Verdict::Fail`]. When it is the
    /// `max_consecutive`-th in a row, [`DaemonError::SourceBroken`] is returned
    /// instead.
    pub fn test(&mut self, data: &[u8]) -> Result<Verdict, DaemonError> {
        let started = Instant::now();
        let mut failures = FipsFailures::NONE;
        if data.len() < FIPS_BLOCK_BYTES {
            failures = self.context.run(data).failures;
        } else {
            for block in data.chunks(FIPS_BLOCK_BYTES) {
                for test in self.context.run(block).failures.iter() {
                    failures.insert(test);
                }
            }
        }
        self.stats.record_fips_result(failures, started.elapsed());

        if failures.is_empty() {
            self.consecutive_failures = 0;
            return Ok(Verdict::Pass);
        }

        self.consecutive_failures += 1;
        warn!("failed FIPS 140-2 tests: {failures}");
        if self.consecutive_failures >= self.max_consecutive {
            return Err(DaemonError::SourceBroken {
                consecutive: self.consecutive_failures,
                last: failures,
            });
        }
        Ok(Verdict::Fail)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn context(&self) -> &FipsContext {
        &self.context
    }

    pub fn into_context(self) -> FipsContext {
        self.context
    }
}

// ---------------------------------------------------------------------------
// Continuous-run state
// ---------------------------------------------------------------------------

/// The continuous-run test's history, saved across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousRunState {
    /// Word width in bytes.
    pub width: usize,
    pub last_word: u64,
}

impl ContinuousRunState {
    pub fn from_context(ctx: &FipsContext) -> Option<Self> {
        ctx.last_word().map(|last_word| Self {
            width: ctx.width(),
            last_word,
        })
    }

    /// Load a saved state. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> io::Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write atomically: a temporary file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    /// A context resuming from this state, if the width still matches.
    pub fn resume(&self, width: usize) -> Option<FipsContext> {
        if self.width != width {
            debug!(
                "saved continuous-run width {} does not match {width}, ignoring",
                self.width
            );
            return None;
        }
        Some(FipsContext::resume(width, self.last_word))
    }
}
