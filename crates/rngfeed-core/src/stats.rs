//! Per-stage counters and timings.
//!
//! Each stage writes only its own group, so contention is limited to the
//! dump, which briefly locks all three. Counters are diagnostic: a dump
//! taken while stages run may mix values from slightly different moments.

use std::sync::Mutex;
use std::time::Duration;

use log::info;
use rngfeed_fips::{FipsFailures, FipsTest};
use serde::Serialize;

/// Min / mean / max of a duration series, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingStat {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub total_us: u64,
}

impl TimingStat {
    pub fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        if self.count == 0 || us < self.min_us {
            self.min_us = us;
        }
        if us > self.max_us {
            self.max_us = us;
        }
        self.count += 1;
        self.total_us = self.total_us.saturating_add(us);
    }

    pub fn mean_us(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_us as f64 / self.count as f64)
    }

    /// Throughput (min, avg, max) in Kibits/s when each sample moved `bits`.
    pub fn throughput_kibits(&self, bits: u64) -> Option<(f64, f64, f64)> {
        let mean = self.mean_us()?;
        let rate = |us: f64| {
            if us <= 0.0 {
                f64::INFINITY
            } else {
                bits as f64 / 1024.0 / (us / 1_000_000.0)
            }
        };
        Some((rate(self.max_us as f64), rate(mean), rate(self.min_us as f64)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub bytes_received: u64,
    pub timeouts: u64,
    pub device_errors: u64,
    /// Time to fill one buffer.
    pub block_fill: TimingStat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FipsStats {
    pub good_fips_blocks: u64,
    pub bad_fips_blocks: u64,
    /// Failure count per test, indexed by [`FipsTest::index`].
    pub test_failures: [u64; 5],
    /// Time to test one buffer.
    pub test_time: TimingStat,
}

impl FipsStats {
    pub fn failures_of(&self, test: FipsTest) -> u64 {
        self.test_failures[test.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SinkStats {
    pub bytes_sent: u64,
    pub entropy_sent_bits: u64,
    /// Fewest tested-good buffers waiting, since the last dump.
    pub buffer_lowmark: usize,
    /// Sink waits of one second that ended with no tested buffer.
    pub sink_starved: u64,
    pub sink_retries: u64,
    /// Time spent waiting for a tested buffer after starving.
    pub starved_wait: TimingStat,
}

/// All three groups at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub source: SourceStats,
    pub fips: FipsStats,
    pub sink: SinkStats,
}

pub struct StatsRegistry {
    source: Mutex<SourceStats>,
    fips: Mutex<FipsStats>,
    sink: Mutex<SinkStats>,
    buffers: usize,
    buffer_bits: u64,
}

impl StatsRegistry {
    /// A registry for a pipeline of `buffers` buffers of `buffer_size` bytes.
    pub fn new(buffers: usize, buffer_size: usize) -> Self {
        Self {
            source: Mutex::new(SourceStats::default()),
            fips: Mutex::new(FipsStats::default()),
            sink: Mutex::new(SinkStats {
                bytes_sent: 0,
                entropy_sent_bits: 0,
                buffer_lowmark: buffers.saturating_sub(1),
                sink_starved: 0,
                sink_retries: 0,
                starved_wait: TimingStat::default(),
            }),
            buffers,
            buffer_bits: buffer_size as u64 * 8,
        }
    }

    // -- source ------------------------------------------------------------

    pub fn record_bytes_received(&self, n: usize) {
        self.source.lock().unwrap().bytes_received += n as u64;
    }

    pub fn record_source_timeout(&self) {
        self.source.lock().unwrap().timeouts += 1;
    }

    pub fn record_device_error(&self) {
        self.source.lock().unwrap().device_errors += 1;
    }

    pub fn record_block_fill(&self, elapsed: Duration) {
        self.source.lock().unwrap().block_fill.record(elapsed);
    }

    // -- fips --------------------------------------------------------------

    pub fn record_fips_result(&self, failures: FipsFailures, elapsed: Duration) {
        let mut fips = self.fips.lock().unwrap();
        if failures.is_empty() {
            fips.good_fips_blocks += 1;
        } else {
            fips.bad_fips_blocks += 1;
            for test in failures.iter() {
                fips.test_failures[test.index()] += 1;
            }
        }
        fips.test_time.record(elapsed);
    }

    // -- sink --------------------------------------------------------------

    pub fn record_bytes_sent(&self, bytes: usize, entropy_bits: u64) {
        let mut sink = self.sink.lock().unwrap();
        sink.bytes_sent += bytes as u64;
        sink.entropy_sent_bits += entropy_bits;
    }

    pub fn record_sink_starved(&self) {
        self.sink.lock().unwrap().sink_starved += 1;
    }

    pub fn record_starved_wait(&self, elapsed: Duration) {
        self.sink.lock().unwrap().starved_wait.record(elapsed);
    }

    pub fn record_sink_retry(&self) {
        self.sink.lock().unwrap().sink_retries += 1;
    }

    /// Store the ready-buffer low-water mark observed by the pool.
    pub fn record_buffer_lowmark(&self, lowmark: usize) {
        self.sink.lock().unwrap().buffer_lowmark = lowmark;
    }

    // -- reporting ---------------------------------------------------------

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            source: *self.source.lock().unwrap(),
            fips: *self.fips.lock().unwrap(),
            sink: *self.sink.lock().unwrap(),
        }
    }

    /// Log every counter, then reset the low-water mark for the next period.
    pub fn snapshot_and_log(&self) -> StatsSnapshot {
        let snap = self.snapshot();
        log_snapshot(&snap, self.buffer_bits);
        self.sink.lock().unwrap().buffer_lowmark = self.buffers.saturating_sub(1);
        snap
    }
}

fn format_rate(rate: Option<(f64, f64, f64)>) -> String {
    match rate {
        Some((min, avg, max)) => format!("(min={min:.3}; avg={avg:.3}; max={max:.3})Kibits/s"),
        None => "(no samples)".to_string(),
    }
}

fn log_snapshot(snap: &StatsSnapshot, buffer_bits: u64) {
    let StatsSnapshot { source, fips, sink } = snap;
    info!("stats: bits received from HRNG source: {}", source.bytes_received * 8);
    info!("stats: bits sent to kernel pool: {}", sink.bytes_sent * 8);
    info!("stats: entropy added to kernel pool: {}", sink.entropy_sent_bits);
    info!("stats: FIPS 140-2 successes: {}", fips.good_fips_blocks);
    info!("stats: FIPS 140-2 failures: {}", fips.bad_fips_blocks);
    for test in FipsTest::ALL {
        info!("stats: {}: {}", test.name(), fips.failures_of(test));
    }
    info!("stats: HRNG source timeouts: {}", source.timeouts);
    info!("stats: HRNG source device errors: {}", source.device_errors);
    info!(
        "stats: HRNG source speed: {}",
        format_rate(source.block_fill.throughput_kibits(buffer_bits))
    );
    info!(
        "stats: FIPS tests speed: {}",
        format_rate(fips.test_time.throughput_kibits(buffer_bits))
    );
    info!("stats: Lowest ready-buffers level: {}", sink.buffer_lowmark);
    info!("stats: Entropy starvations (1s waits): {}", sink.sink_starved);
    info!("stats: Kernel submission retries: {}", sink.sink_retries);
    match sink.starved_wait.mean_us() {
        Some(avg) => info!(
            "stats: Time spent starving for entropy: (min={}; avg={avg:.3}; max={})us",
            sink.starved_wait.min_us, sink.starved_wait.max_us
        ),
        None => info!("stats: Time spent starving for entropy: (none)"),
    }
}
