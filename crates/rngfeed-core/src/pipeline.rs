//! The running daemon: three worker threads joined by a [`BufferPool`].
//!
//! ```text
//!  source thread ──fill──▶ [PendingTest] ──test──▶ [TestedGood] ──submit──▶ kernel
//!        ▲                                  │ fail                      │
//!        └───────────────[Empty]◀───────────┴───────────────────────────┘
//! ```
//!
//! A worker that hits a fatal error records it, cancels the shared
//! [`ShutdownToken`] and closes the pool, so the other two wake up and exit.
//! The main thread supervises (stats dumps) and finally joins everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rngfeed_fips::FipsContext;

use crate::config::Config;
use crate::error::{DaemonError, PoolError, SinkError, SourceError};
use crate::fips::{ContinuousRunState, FipsTestEngine};
use crate::kernel::{KernelPool, KernelSink};
use crate::pool::{Buffer, BufferPool, Verdict};
use crate::shutdown::ShutdownToken;
use crate::source::{EntropySource, read_exact};
use crate::stats::{StatsRegistry, StatsSnapshot};

/// How long the sink waits for a tested buffer before counting a starvation.
///
/// `sink_starved` grows once per expired wait, so a source that stays idle
/// adds one per second: it measures starved seconds, not starvation episodes.
pub const SINK_STARVE_TIMEOUT: Duration = Duration::from_secs(1);

const SUPERVISE_TICK: Duration = Duration::from_millis(250);
const DEVICE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct Stage {
    config: Arc<Config>,
    pool: Arc<BufferPool>,
    stats: Arc<StatsRegistry>,
    shutdown: ShutdownToken,
    fatal: Arc<Mutex<Option<DaemonError>>>,
}

impl Stage {
    /// Record a fatal error (first one wins) and bring everything down.
    fn fail(&self, stage: &str, err: DaemonError) {
        error!("{stage}: {err}");
        {
            let mut slot = self.fatal.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.shutdown.cancel();
        self.pool.close();
    }
}

pub struct Pipeline {
    stage: Stage,
    source: Option<JoinHandle<()>>,
    fips: Option<JoinHandle<Option<FipsContext>>>,
    sink: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build the pool and start all three workers.
    ///
    /// `context` is the continuous-run history to test the first block
    /// against; see [`initial_context`].
    pub fn start(
        config: Arc<Config>,
        source: Box<dyn EntropySource>,
        kernel: Box<dyn KernelPool>,
        context: FipsContext,
        shutdown: ShutdownToken,
    ) -> Result<Self, DaemonError> {
        let pool = Arc::new(BufferPool::new(config.buffers, config.buffer_size));
        let stats = Arc::new(StatsRegistry::new(config.buffers, config.buffer_size));
        let engine = FipsTestEngine::new(context, Arc::clone(&stats), config.max_bad_blocks);
        let sink = KernelSink::new(kernel, &config, Arc::clone(&stats), shutdown.clone());
        let stage = Stage {
            config,
            pool,
            stats,
            shutdown,
            fatal: Arc::new(Mutex::new(None)),
        };

        // Consumers first, so nothing produced has to wait for a thread to start.
        // If a spawn fails, dropping `pipeline` stops whatever already runs.
        let mut pipeline = Self {
            stage: stage.clone(),
            source: None,
            fips: None,
            sink: None,
        };
        pipeline.sink = Some(spawn("rngfeed-sink", {
            let stage = stage.clone();
            move || {
                if let Err(e) = sink_loop(&stage, sink) {
                    stage.fail("kernel sink", e);
                }
            }
        })?);
        pipeline.fips = Some(spawn("rngfeed-fips", {
            let stage = stage.clone();
            move || match fips_loop(&stage, engine) {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    stage.fail("FIPS tester", e);
                    None
                }
            }
        })?);
        pipeline.source = Some(spawn("rngfeed-source", move || {
            if let Err(e) = source_loop(&stage, source) {
                stage.fail("entropy source", e);
            }
        })?);
        Ok(pipeline)
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stage.stats
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.stage.pool
    }

    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.stage.shutdown
    }

    /// Log the statistics and return them.
    pub fn dump_stats(&self) -> StatsSnapshot {
        self.stage
            .stats
            .record_buffer_lowmark(self.stage.pool.take_ready_lowmark());
        self.stage.stats.snapshot_and_log()
    }

    /// Wait for shutdown, dumping statistics every `stats_interval` and
    /// whenever `dump_request` is raised.
    pub fn supervise(
        &self,
        stats_interval: Duration,
        dump_request: &AtomicBool,
        mut on_dump: impl FnMut(&StatsSnapshot),
    ) {
        let mut next_dump = Instant::now() + stats_interval;
        while !self.stage.shutdown.wait_timeout(SUPERVISE_TICK) {
            let now = Instant::now();
            if dump_request.swap(false, Ordering::SeqCst) || now >= next_dump {
                on_dump(&self.dump_stats());
                next_dump = now + stats_interval;
            }
        }
    }

    /// Stop every worker, wait for them, and dump statistics.
    ///
    /// Returns the final continuous-run history on a clean stop, or the
    /// first fatal error a worker hit.
    pub fn join(self) -> Result<FipsContext, DaemonError> {
        self.finish().0
    }

    /// Like [`join`](Self::join), but also hands back the at-exit statistics
    /// dump, whichever way the pipeline ended.
    pub fn finish(mut self) -> (Result<FipsContext, DaemonError>, StatsSnapshot) {
        self.stop();
        let mut panicked = None;
        if let Some(handle) = self.source.take() {
            if handle.join().is_err() {
                panicked.get_or_insert("source");
            }
        }
        let context = match self.fips.take().map(JoinHandle::join) {
            Some(Ok(ctx)) => ctx,
            Some(Err(_)) => {
                panicked.get_or_insert("fips");
                None
            }
            None => None,
        };
        if let Some(handle) = self.sink.take() {
            if handle.join().is_err() {
                panicked.get_or_insert("sink");
            }
        }
        let final_stats = self.dump_stats();

        let result = if let Some(err) = self.stage.fatal.lock().unwrap().take() {
            Err(err)
        } else if let Some(name) = panicked {
            Err(DaemonError::WorkerPanicked(name))
        } else {
            context.ok_or(DaemonError::WorkerPanicked("fips"))
        };
        (result, final_stats)
    }

    fn stop(&self) {
        self.stage.shutdown.cancel();
        self.stage.pool.close();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.source.is_none() && self.fips.is_none() && self.sink.is_none() {
            return;
        }
        self.stop();
        if let Some(h) = self.source.take() {
            let _ = h.join();
        }
        if let Some(h) = self.fips.take() {
            let _ = h.join();
        }
        if let Some(h) = self.sink.take() {
            let _ = h.join();
        }
    }
}

fn spawn<T, F>(name: &str, f: F) -> Result<JoinHandle<T>, DaemonError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(DaemonError::Spawn)
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

fn source_loop(stage: &Stage, mut source: Box<dyn EntropySource>) -> Result<(), DaemonError> {
    let timeout = stage.config.source_timeout;
    let mut device_failures = 0u32;
    loop {
        let mut buf = match stage.pool.acquire_empty() {
            Ok(buf) => buf,
            Err(PoolError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let started = Instant::now();
        let mut filled = 0;
        while filled < buf.capacity() {
            if stage.shutdown.is_cancelled() {
                stage.pool.release_empty(buf)?;
                return Ok(());
            }
            match source.read_block(&mut buf.space_mut()[filled..], timeout) {
                Ok(n) => {
                    filled += n;
                    device_failures = 0;
                    stage.stats.record_bytes_received(n);
                }
                Err(SourceError::Timeout) => {
                    stage.stats.record_source_timeout();
                    warn!("entropy source {} timed out", source.location());
                }
                Err(SourceError::Device(cause)) => {
                    device_failures += 1;
                    stage.stats.record_device_error();
                    if device_failures > stage.config.max_device_retries {
                        stage.pool.release_empty(buf)?;
                        return Err(DaemonError::SourceFailed {
                            source_name: source.location(),
                            attempts: device_failures,
                            cause,
                        });
                    }
                    warn!(
                        "error reading entropy source {}: {cause} (attempt {device_failures})",
                        source.location()
                    );
                    if stage.shutdown.wait_timeout(DEVICE_RETRY_DELAY.min(timeout)) {
                        stage.pool.release_empty(buf)?;
                        return Ok(());
                    }
                    if let Err(e) = source.reopen() {
                        debug!("reopen failed: {e}");
                    }
                }
            }
        }
        stage.stats.record_block_fill(started.elapsed());
        stage.pool.commit_filled(buf, filled)?;
    }
}

fn fips_loop(stage: &Stage, mut engine: FipsTestEngine) -> Result<FipsContext, DaemonError> {
    loop {
        let buf = match stage.pool.acquire_for_test() {
            Ok(buf) => buf,
            Err(PoolError::Closed) => return Ok(engine.into_context()),
            Err(e) => return Err(e.into()),
        };
        match engine.test(buf.filled()) {
            Ok(verdict) => stage.pool.commit_tested(buf, verdict)?,
            Err(e) => {
                stage.pool.commit_tested(buf, Verdict::Fail)?;
                return Err(e);
            }
        }
    }
}

/// Take the next tested buffer for the sink, counting a starvation if none
/// arrives within `timeout`.
pub fn acquire_for_sink_counted(
    pool: &BufferPool,
    stats: &StatsRegistry,
    timeout: Duration,
) -> Result<Option<Buffer>, PoolError> {
    let buf = pool.acquire_for_sink_timeout(timeout)?;
    if buf.is_none() {
        stats.record_sink_starved();
    }
    Ok(buf)
}

fn sink_loop(stage: &Stage, mut sink: KernelSink) -> Result<(), DaemonError> {
    let mut starved_since: Option<Instant> = None;
    loop {
        let asked = Instant::now();
        let mut buf = match acquire_for_sink_counted(&stage.pool, &stage.stats, SINK_STARVE_TIMEOUT)
        {
            Ok(Some(buf)) => buf,
            Ok(None) => {
                if starved_since.is_none() {
                    debug!("entropy starvation: no tested buffer ready");
                    starved_since = Some(asked);
                }
                continue;
            }
            Err(PoolError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Some(since) = starved_since.take() {
            stage.stats.record_starved_wait(since.elapsed());
        }

        let result = sink.submit(&mut buf);
        stage.pool.release_empty(buf)?;
        match result {
            Ok(()) => {}
            Err(SinkError::Cancelled) => return Ok(()),
            Err(SinkError::Retryable(e) | SinkError::Fatal(e)) => {
                return Err(DaemonError::SinkFailed(e));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Continuous-run history across restarts
// ---------------------------------------------------------------------------

/// The continuous-run history to start from.
///
/// Resumes from the configured state file when it holds a usable word;
/// otherwise reads and discards one word from the source to prime the test.
pub fn initial_context(
    config: &Config,
    source: &mut dyn EntropySource,
) -> Result<FipsContext, DaemonError> {
    let width = config.continuous_width_bytes();
    if let Some(path) = &config.continuous_state {
        match ContinuousRunState::load(path) {
            Ok(Some(state)) => {
                if let Some(ctx) = state.resume(width) {
                    info!("resuming continuous-run test from {}", path.display());
                    return Ok(ctx);
                }
            }
            Ok(None) => debug!("no continuous-run state at {}", path.display()),
            Err(e) => warn!("ignoring continuous-run state {}: {e}", path.display()),
        }
    }
    prime_continuous_test(source, width, config.source_timeout)
}

/// Read one `width`-byte word and use it as the continuous-run history.
pub fn prime_continuous_test(
    source: &mut dyn EntropySource,
    width: usize,
    timeout: Duration,
) -> Result<FipsContext, DaemonError> {
    let mut word = vec![0u8; width];
    read_exact(source, &mut word, timeout, timeout).map_err(|e| {
        DaemonError::SourceFailed {
            source_name: source.location(),
            attempts: 1,
            cause: match e {
                SourceError::Timeout => std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no data while priming the continuous-run test",
                ),
                SourceError::Device(cause) => cause,
            },
        }
    })?;
    let mut ctx = FipsContext::new(width);
    ctx.prime(&word);
    Ok(ctx)
}

/// Save the continuous-run history if a state file is configured.
pub fn save_continuous_state(config: &Config, ctx: &FipsContext) -> Result<(), DaemonError> {
    let (Some(path), Some(state)) = (
        &config.continuous_state,
        ContinuousRunState::from_context(ctx),
    ) else {
        return Ok(());
    };
    state.save(path).map_err(|cause| DaemonError::StateFile {
        path: path.clone(),
        cause,
    })?;
    debug!("saved continuous-run state to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DriverKind, SourceInfo};

    struct Fixed(Vec<u8>);

    static FIXED_INFO: SourceInfo = SourceInfo {
        name: "fixed",
        description: "fixed bytes",
        driver: DriverKind::Stream,
    };

    impl EntropySource for Fixed {
        fn info(&self) -> &SourceInfo {
            &FIXED_INFO
        }

        fn read_block(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, SourceError> {
            if self.0.is_empty() {
                return Err(SourceError::Timeout);
            }
            let n = buf.len().min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = self.0.split_off(n);
            Ok(n)
        }
    }

    #[test]
    fn test_prime_consumes_one_word() {
        let mut src = Fixed(vec![1, 2, 3, 4, 5, 6]);
        let ctx = prime_continuous_test(&mut src, 4, Duration::from_millis(10)).unwrap();
        assert_eq!(ctx.last_word(), Some(0x0403_0201));
        assert_eq!(src.0, vec![5, 6]);
    }

    #[test]
    fn test_prime_times_out() {
        let mut src = Fixed(Vec::new());
        let err = prime_continuous_test(&mut src, 4, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DaemonError::SourceFailed { .. }));
    }

    #[test]
    fn test_initial_context_prefers_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        ContinuousRunState {
            width: 4,
            last_word: 0xDEAD_BEEF,
        }
        .save(&path)
        .unwrap();
        let config = Config {
            continuous_state: Some(path),
            ..Config::default()
        };
        let mut src = Fixed(vec![9; 8]);
        let ctx = initial_context(&config, &mut src).unwrap();
        assert_eq!(ctx.last_word(), Some(0xDEAD_BEEF));
        // Nothing was read from the source.
        assert_eq!(src.0.len(), 8);
    }

    #[test]
    fn test_initial_context_cold_start_on_width_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        ContinuousRunState {
            width: 2,
            last_word: 7,
        }
        .save(&path)
        .unwrap();
        let config = Config {
            continuous_state: Some(path),
            ..Config::default()
        };
        let mut src = Fixed(vec![1, 0, 0, 0]);
        let ctx = initial_context(&config, &mut src).unwrap();
        assert_eq!(ctx.last_word(), Some(1));
        assert!(src.0.is_empty());
    }

    #[test]
    fn test_save_state_roundtrip_through_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let config = Config {
            continuous_state: Some(path.clone()),
            ..Config::default()
        };
        save_continuous_state(&config, &FipsContext::resume(4, 42)).unwrap();
        let loaded = ContinuousRunState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_word, 42);

        // Without a configured path nothing is written.
        save_continuous_state(&Config::default(), &FipsContext::resume(4, 1)).unwrap();
    }

    #[test]
    fn test_counted_acquire_counts_each_timeout() {
        let pool = BufferPool::new(3, 16);
        let stats = StatsRegistry::new(3, 16);
        for _ in 0..3 {
            let got = acquire_for_sink_counted(&pool, &stats, Duration::from_millis(5)).unwrap();
            assert!(got.is_none());
        }
        assert_eq!(stats.snapshot().sink.sink_starved, 3);
    }
}
