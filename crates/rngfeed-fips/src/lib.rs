//! FIPS 140-2 bit-statistics battery.
//!
//! Implements the power-up / continuous tests of FIPS 140-2 (change notice of
//! 2001-10-10) over 20 000-bit blocks:
//!
//! - **Monobit**: number of set bits must satisfy 9725 < X < 10275.
//! - **Poker**: 4-bit nibble chi-square statistic must lie in [1.03, 57.4].
//! - **Runs**: run counts per length (1..=5, 6+) and polarity within fixed ranges.
//! - **Long run**: no run of 26 or more identical bits.
//! - **Continuous run**: no two consecutive words (default 32 bits) are equal,
//!   including across block boundaries via [`FipsContext`].
//!
//! All thresholds are integers, so verdicts never depend on floating point.
//! The poker statistic is compared as `sum(count_i^2)` against pre-scaled bounds.

use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Bytes in one FIPS 140-2 test block.
pub const FIPS_BLOCK_BYTES: usize = 2500;

/// Bits in one FIPS 140-2 test block.
pub const FIPS_BLOCK_BITS: usize = FIPS_BLOCK_BYTES * 8;

/// Monobit acceptance is the open interval (MONOBIT_LOW, MONOBIT_HIGH):
/// a block with exactly 9725 or 10275 ones fails, as in FIPS 140-2 and rngd.
pub const MONOBIT_LOW: u32 = 9725;
pub const MONOBIT_HIGH: u32 = 10275;

/// Poker acceptance on `sum(count_i^2)`.
///
/// `X = 16/5000 * S - 5000`, so `1.03 <= X <= 57.4` is `1562822 <= S <= 1580437`.
pub const POKER_SUM_SQ_MIN: u64 = 1_562_822;
pub const POKER_SUM_SQ_MAX: u64 = 1_580_437;

/// Inclusive acceptance ranges for runs of length 1, 2, 3, 4, 5 and 6+.
/// Applied to runs of zeros and runs of ones independently.
pub const RUNS_RANGES: [(u32, u32); 6] = [
    (2315, 2685),
    (1114, 1386),
    (527, 723),
    (240, 384),
    (103, 209),
    (103, 209),
];

/// A run of this many identical bits fails the long-run test.
pub const LONG_RUN_LIMIT: u32 = 26;

/// Default word width for the continuous-run test, in bytes.
pub const DEFAULT_CONTINUOUS_WIDTH: usize = 4;

// ═══════════════════════════════════════════════════════════════════════════════
// Test identifiers and failure bitmap
// ═══════════════════════════════════════════════════════════════════════════════

/// One test of the battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FipsTest {
    Monobit,
    Poker,
    Runs,
    LongRun,
    ContinuousRun,
}

impl FipsTest {
    /// Every test, in reporting order.
    pub const ALL: [FipsTest; 5] = [
        FipsTest::Monobit,
        FipsTest::Poker,
        FipsTest::Runs,
        FipsTest::LongRun,
        FipsTest::ContinuousRun,
    ];

    /// Index into per-test counter arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Monobit => 0,
            Self::Poker => 1,
            Self::Runs => 2,
            Self::LongRun => 3,
            Self::ContinuousRun => 4,
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }

    /// Human-readable test name used in logs and stats dumps.
    pub fn name(self) -> &'static str {
        match self {
            Self::Monobit => "FIPS 140-2(2001-10-10) Monobit",
            Self::Poker => "FIPS 140-2(2001-10-10) Poker",
            Self::Runs => "FIPS 140-2(2001-10-10) Runs",
            Self::LongRun => "FIPS 140-2(2001-10-10) Long run",
            Self::ContinuousRun => "FIPS 140-2(2001-10-10) Continuous run",
        }
    }
}

impl fmt::Display for FipsTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monobit => write!(f, "monobit"),
            Self::Poker => write!(f, "poker"),
            Self::Runs => write!(f, "runs"),
            Self::LongRun => write!(f, "long_run"),
            Self::ContinuousRun => write!(f, "continuous_run"),
        }
    }
}

/// Bitmap of failed tests for one block. Empty means the block passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FipsFailures(u8);

impl FipsFailures {
    pub const NONE: FipsFailures = FipsFailures(0);

    pub fn insert(&mut self, test: FipsTest) {
        self.0 |= test.bit();
    }

    pub fn contains(self, test: FipsTest) -> bool {
        self.0 & test.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bitmap (bit `i` set for `FipsTest::ALL[i]`).
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Iterate over the failed tests in reporting order.
    pub fn iter(self) -> impl Iterator<Item = FipsTest> {
        FipsTest::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<FipsTest> for FipsFailures {
    fn from_iter<I: IntoIterator<Item = FipsTest>>(iter: I) -> Self {
        let mut failures = FipsFailures::NONE;
        for test in iter {
            failures.insert(test);
        }
        failures
    }
}

impl fmt::Display for FipsFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-test results
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a single test on one block, for reporting.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub test: FipsTest,
    pub passed: bool,
    pub statistic: f64,
    pub details: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Static block statistics (monobit, poker, runs, long run)
// ═══════════════════════════════════════════════════════════════════════════════

/// Bit statistics of one 20 000-bit block, gathered in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatistics {
    /// Number of bits examined (20 000 unless the block was short).
    pub bits: usize,
    /// Number of set bits.
    pub ones: u32,
    /// Occurrences of each 4-bit nibble value.
    pub poker: [u32; 16],
    /// `runs[polarity][len - 1]`; index 5 aggregates runs of 6 or more.
    pub runs: [[u32; 6]; 2],
    /// Longest run of identical bits seen.
    pub longest_run: u32,
}

impl BlockStatistics {
    /// Gather statistics over the first [`FIPS_BLOCK_BYTES`] of `data`
    /// (MSB first within each byte).
    pub fn compute(data: &[u8]) -> Self {
        let block = &data[..data.len().min(FIPS_BLOCK_BYTES)];
        let mut stats = BlockStatistics {
            bits: block.len() * 8,
            ones: 0,
            poker: [0; 16],
            runs: [[0; 6]; 2],
            longest_run: 0,
        };

        let mut run_bit = 0u8;
        let mut run_len = 0u32;
        for &byte in block {
            stats.poker[(byte >> 4) as usize] += 1;
            stats.poker[(byte & 0x0f) as usize] += 1;
            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1;
                stats.ones += u32::from(bit);
                if run_len > 0 && bit == run_bit {
                    run_len += 1;
                } else {
                    if run_len > 0 {
                        stats.close_run(run_bit, run_len);
                    }
                    run_bit = bit;
                    run_len = 1;
                }
            }
        }
        // Trailing run ends at the block boundary.
        if run_len > 0 {
            stats.close_run(run_bit, run_len);
        }
        stats
    }

    fn close_run(&mut self, bit: u8, len: u32) {
        let bucket = (len.min(6) - 1) as usize;
        self.runs[bit as usize][bucket] += 1;
        self.longest_run = self.longest_run.max(len);
    }

    fn is_complete(&self) -> bool {
        self.bits >= FIPS_BLOCK_BITS
    }

    /// `sum(count_i^2)` over the 16 nibble counts.
    pub fn poker_sum_sq(&self) -> u64 {
        self.poker.iter().map(|&c| u64::from(c) * u64::from(c)).sum()
    }

    /// The FIPS poker statistic `16/5000 * sum(count_i^2) - 5000`, for display.
    pub fn poker_statistic(&self) -> f64 {
        16.0 / 5000.0 * self.poker_sum_sq() as f64 - 5000.0
    }

    pub fn monobit_passed(&self) -> bool {
        self.is_complete() && self.ones > MONOBIT_LOW && self.ones < MONOBIT_HIGH
    }

    pub fn poker_passed(&self) -> bool {
        let s = self.poker_sum_sq();
        self.is_complete() && (POKER_SUM_SQ_MIN..=POKER_SUM_SQ_MAX).contains(&s)
    }

    pub fn runs_passed(&self) -> bool {
        self.is_complete()
            && self.runs.iter().all(|polarity| {
                polarity
                    .iter()
                    .zip(RUNS_RANGES.iter())
                    .all(|(&count, &(lo, hi))| (lo..=hi).contains(&count))
            })
    }

    pub fn long_run_passed(&self) -> bool {
        self.is_complete() && self.longest_run < LONG_RUN_LIMIT
    }

    /// Failures among the four static tests.
    pub fn failures(&self) -> FipsFailures {
        let mut failures = FipsFailures::NONE;
        if !self.monobit_passed() {
            failures.insert(FipsTest::Monobit);
        }
        if !self.poker_passed() {
            failures.insert(FipsTest::Poker);
        }
        if !self.runs_passed() {
            failures.insert(FipsTest::Runs);
        }
        if !self.long_run_passed() {
            failures.insert(FipsTest::LongRun);
        }
        failures
    }

    /// Per-test results for the four static tests.
    pub fn results(&self) -> Vec<TestResult> {
        if !self.is_complete() {
            return [
                FipsTest::Monobit,
                FipsTest::Poker,
                FipsTest::Runs,
                FipsTest::LongRun,
            ]
            .into_iter()
            .map(|test| insufficient(test, self.bits))
            .collect();
        }
        vec![
            TestResult {
                test: FipsTest::Monobit,
                passed: self.monobit_passed(),
                statistic: f64::from(self.ones),
                details: format!("ones={}, accept ({MONOBIT_LOW}, {MONOBIT_HIGH})", self.ones),
            },
            TestResult {
                test: FipsTest::Poker,
                passed: self.poker_passed(),
                statistic: self.poker_statistic(),
                details: format!("X={:.4}, accept [1.03, 57.4]", self.poker_statistic()),
            },
            TestResult {
                test: FipsTest::Runs,
                passed: self.runs_passed(),
                statistic: 0.0,
                details: format!("zeros={:?}, ones={:?}", self.runs[0], self.runs[1]),
            },
            TestResult {
                test: FipsTest::LongRun,
                passed: self.long_run_passed(),
                statistic: f64::from(self.longest_run),
                details: format!("longest={}, limit {LONG_RUN_LIMIT}", self.longest_run),
            },
        ]
    }
}

/// Return a failing `TestResult` when the block is too short.
fn insufficient(test: FipsTest, got_bits: usize) -> TestResult {
    TestResult {
        test,
        passed: false,
        statistic: 0.0,
        details: format!("Insufficient data: need {FIPS_BLOCK_BITS} bits, got {got_bits}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Continuous-run state and the full battery
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of running the whole battery on one block.
#[derive(Debug, Clone)]
pub struct FipsReport {
    pub failures: FipsFailures,
    pub statistics: BlockStatistics,
}

impl FipsReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Battery state carried between consecutive blocks of one source.
///
/// Only the continuous-run test needs history: the last word of the previous
/// block, compared against the first word of the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FipsContext {
    width: usize,
    last_word: Option<u64>,
}

impl FipsContext {
    /// New context comparing `width`-byte words (1..=8).
    ///
    /// # Panics
    /// Panics if `width` is 0 or greater than 8.
    pub fn new(width: usize) -> Self {
        assert!((1..=8).contains(&width), "continuous-run width must be 1..=8 bytes");
        Self {
            width,
            last_word: None,
        }
    }

    /// New context resuming from a previously saved word.
    pub fn resume(width: usize, last_word: u64) -> Self {
        let mut ctx = Self::new(width);
        ctx.last_word = Some(last_word);
        ctx
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn last_word(&self) -> Option<u64> {
        self.last_word
    }

    /// Seed the continuous-run history from discarded start-up bytes.
    /// The last complete word of `data` becomes the comparison word.
    pub fn prime(&mut self, data: &[u8]) {
        if let Some(word) = data.chunks_exact(self.width).last() {
            self.last_word = Some(word_le(word));
        }
    }

    /// Run the continuous-run test over every complete word in `data`.
    /// History is updated whether or not the test passes.
    pub fn continuous_run(&mut self, data: &[u8]) -> bool {
        let mut passed = true;
        for chunk in data.chunks_exact(self.width) {
            let word = word_le(chunk);
            if self.last_word == Some(word) {
                passed = false;
            }
            self.last_word = Some(word);
        }
        passed
    }

    /// Run the complete battery on one block.
    pub fn run(&mut self, data: &[u8]) -> FipsReport {
        let continuous_ok = self.continuous_run(data);
        let statistics = BlockStatistics::compute(data);
        let mut failures = statistics.failures();
        if !continuous_ok {
            failures.insert(FipsTest::ContinuousRun);
        }
        FipsReport {
            failures,
            statistics,
        }
    }
}

impl Default for FipsContext {
    fn default() -> Self {
        Self::new(DEFAULT_CONTINUOUS_WIDTH)
    }
}

fn word_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random block (SplitMix64).
    fn pseudo_random(n: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        let mut data = Vec::with_capacity(n + 8);
        while data.len() < n {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            data.extend_from_slice(&z.to_le_bytes());
        }
        data.truncate(n);
        data
    }

    fn set_bit(data: &mut [u8], index: usize, bit: bool) {
        let mask = 0x80u8 >> (index % 8);
        if bit {
            data[index / 8] |= mask;
        } else {
            data[index / 8] &= !mask;
        }
    }

    /// Block with exactly `ones` set bits, packed at the front.
    fn block_with_ones(ones: usize) -> Vec<u8> {
        let mut data = vec![0u8; FIPS_BLOCK_BYTES];
        for i in 0..ones {
            set_bit(&mut data, i, true);
        }
        data
    }

    /// Alternating one- and zero-runs with exactly the given run counts per
    /// length bucket (`[len1, .., len5, len6+]`). Each polarity covers 10 000
    /// bits; the 6+ runs absorb whatever the shorter runs leave.
    fn block_with_runs(ones: [u32; 6], zeros: [u32; 6]) -> Vec<u8> {
        fn lengths(counts: [u32; 6]) -> Vec<usize> {
            let mut runs = Vec::new();
            for (i, &count) in counts[..5].iter().enumerate() {
                runs.extend(std::iter::repeat_n(i + 1, count as usize));
            }
            let rest = FIPS_BLOCK_BITS / 2 - runs.iter().sum::<usize>();
            let long = counts[5] as usize;
            let (base, extra) = (rest / long, rest % long);
            assert!(base >= 6 && base < 25, "6+ runs of {base} bits");
            runs.extend((0..long).map(|k| base + usize::from(k < extra)));
            runs
        }

        let (ones, zeros) = (lengths(ones), lengths(zeros));
        assert_eq!(ones.len(), zeros.len());
        let mut data = vec![0u8; FIPS_BLOCK_BYTES];
        let mut pos = 0;
        for (&one, &zero) in ones.iter().zip(&zeros) {
            for i in pos..pos + one {
                set_bit(&mut data, i, true);
            }
            pos += one + zero;
        }
        assert_eq!(pos, FIPS_BLOCK_BITS);
        data
    }

    /// Alternating bits with a single run of `len` ones starting at bit 1001.
    fn block_with_run(len: usize) -> Vec<u8> {
        let mut data = vec![0x55u8; FIPS_BLOCK_BYTES];
        let start = 1001;
        set_bit(&mut data, start - 1, false);
        for i in start..start + len {
            set_bit(&mut data, i, true);
        }
        set_bit(&mut data, start + len, false);
        data
    }

    // -----------------------------------------------------------------------
    // Constant blocks
    // -----------------------------------------------------------------------

    #[test]
    fn test_all_zero_fails_everything() {
        let mut ctx = FipsContext::default();
        let report = ctx.run(&[0u8; FIPS_BLOCK_BYTES]);
        assert!(!report.passed());
        for test in FipsTest::ALL {
            assert!(report.failures.contains(test), "{test} should fail");
        }
        assert_eq!(report.statistics.ones, 0);
        assert_eq!(report.statistics.longest_run, FIPS_BLOCK_BITS as u32);
    }

    #[test]
    fn test_all_one_fails_monobit() {
        let mut ctx = FipsContext::default();
        let report = ctx.run(&[0xffu8; FIPS_BLOCK_BYTES]);
        assert!(report.failures.contains(FipsTest::Monobit));
        assert_eq!(report.statistics.ones, FIPS_BLOCK_BITS as u32);
    }

    #[test]
    fn test_alternating_bits() {
        let stats = BlockStatistics::compute(&[0x55u8; FIPS_BLOCK_BYTES]);
        assert_eq!(stats.ones, 10_000);
        assert!(stats.monobit_passed());
        assert!(!stats.poker_passed());
        assert_eq!(stats.poker_sum_sq(), 5000 * 5000);
        assert_eq!(stats.runs[0][0], 10_000);
        assert_eq!(stats.runs[1][0], 10_000);
        assert!(!stats.runs_passed());
        assert_eq!(stats.longest_run, 1);
        assert!(stats.long_run_passed());
    }

    // -----------------------------------------------------------------------
    // Individual statistics
    // -----------------------------------------------------------------------

    #[test]
    fn test_monobit_boundaries_are_exclusive() {
        assert!(!BlockStatistics::compute(&block_with_ones(9725)).monobit_passed());
        assert!(BlockStatistics::compute(&block_with_ones(9726)).monobit_passed());
        assert!(BlockStatistics::compute(&block_with_ones(10_274)).monobit_passed());
        assert!(!BlockStatistics::compute(&block_with_ones(10_275)).monobit_passed());
    }

    #[test]
    fn test_poker_counts_nibbles() {
        let stats = BlockStatistics::compute(&[0x01u8; FIPS_BLOCK_BYTES]);
        assert_eq!(stats.poker[0], 2500);
        assert_eq!(stats.poker[1], 2500);
        assert_eq!(stats.poker_sum_sq(), 2 * 2500 * 2500);
        assert!(!stats.poker_passed());
    }

    #[test]
    fn test_poker_bounds_match_float_interval() {
        let x = |s: u64| 16.0 / 5000.0 * s as f64 - 5000.0;
        assert!(x(POKER_SUM_SQ_MIN) >= 1.03);
        assert!(x(POKER_SUM_SQ_MIN - 1) < 1.03);
        assert!(x(POKER_SUM_SQ_MAX) <= 57.4);
        assert!(x(POKER_SUM_SQ_MAX + 1) > 57.4);
    }

    #[test]
    fn test_runs_of_four() {
        let stats = BlockStatistics::compute(&[0xf0u8; FIPS_BLOCK_BYTES]);
        assert_eq!(stats.runs[1][3], 2500);
        assert_eq!(stats.runs[0][3], 2500);
        assert_eq!(stats.runs[0][0], 0);
        assert_eq!(stats.longest_run, 4);
    }

    #[test]
    fn test_long_run_limit() {
        let ok = BlockStatistics::compute(&block_with_run(25));
        assert_eq!(ok.longest_run, 25);
        assert!(ok.long_run_passed());

        let bad = BlockStatistics::compute(&block_with_run(26));
        assert_eq!(bad.longest_run, 26);
        assert!(!bad.long_run_passed());
    }

    #[test]
    fn test_runs_six_or_more_aggregate() {
        let stats = BlockStatistics::compute(&block_with_run(9));
        assert_eq!(stats.runs[1][5], 1);
    }

    fn runs_of(data: &[u8]) -> (bool, [[u32; 6]; 2]) {
        let stats = BlockStatistics::compute(data);
        (stats.runs_passed(), stats.runs)
    }

    #[test]
    fn test_runs_length_one_lower_bound() {
        let at = [2315, 1285, 600, 300, 150, 150];
        let below = [2314, 1286, 600, 300, 150, 150];

        let (passed, runs) = runs_of(&block_with_runs(at, at));
        assert_eq!(runs, [at, at]);
        assert!(passed);

        let (passed, runs) = runs_of(&block_with_runs(below, at));
        assert_eq!(runs[1][0], 2314);
        assert!(!passed);
        let (passed, runs) = runs_of(&block_with_runs(at, below));
        assert_eq!(runs[0][0], 2314);
        assert!(!passed);
    }

    #[test]
    fn test_runs_length_one_upper_bound() {
        let at = [2685, 1114, 527, 240, 103, 131];
        let above = [2686, 1114, 527, 240, 103, 130];

        let (passed, runs) = runs_of(&block_with_runs(at, at));
        assert_eq!(runs, [at, at]);
        assert!(passed);

        assert!(!runs_of(&block_with_runs(above, at)).0);
        assert!(!runs_of(&block_with_runs(at, above)).0);
    }

    #[test]
    fn test_runs_six_plus_bounds() {
        let low = [2400, 1200, 600, 300, 150, 103];
        let below = [2400, 1200, 600, 300, 151, 102];
        let high = [2400, 1200, 600, 300, 150, 209];
        let above = [2400, 1200, 600, 300, 149, 210];

        let (passed, runs) = runs_of(&block_with_runs(low, low));
        assert_eq!(runs, [low, low]);
        assert!(passed);
        assert!(!runs_of(&block_with_runs(below, low)).0);
        assert!(!runs_of(&block_with_runs(low, below)).0);

        let (passed, runs) = runs_of(&block_with_runs(high, high));
        assert_eq!(runs, [high, high]);
        assert!(passed);
        assert!(!runs_of(&block_with_runs(above, high)).0);
        assert!(!runs_of(&block_with_runs(high, above)).0);
    }

    #[test]
    fn test_runs_every_bucket_bound_both_polarities() {
        let mid: [u32; 6] = RUNS_RANGES.map(|(lo, hi)| (lo + hi) / 2);
        let check = |polarity: usize, bucket: usize, count: u32| {
            let mut runs = [mid, mid];
            runs[polarity][bucket] = count;
            BlockStatistics {
                bits: FIPS_BLOCK_BITS,
                ones: 10_000,
                poker: [0; 16],
                runs,
                longest_run: 0,
            }
            .runs_passed()
        };
        for polarity in 0..2 {
            for (bucket, &(lo, hi)) in RUNS_RANGES.iter().enumerate() {
                assert!(check(polarity, bucket, lo), "[{polarity}][{bucket}] = {lo}");
                assert!(check(polarity, bucket, hi), "[{polarity}][{bucket}] = {hi}");
                assert!(!check(polarity, bucket, lo - 1), "[{polarity}][{bucket}] = {}", lo - 1);
                assert!(!check(polarity, bucket, hi + 1), "[{polarity}][{bucket}] = {}", hi + 1);
            }
        }
    }

    #[test]
    fn test_short_block_is_insufficient() {
        let data = pseudo_random(100, 1);
        let stats = BlockStatistics::compute(&data);
        assert_eq!(stats.bits, 800);
        let failures = stats.failures();
        assert!(failures.contains(FipsTest::Monobit));
        assert!(failures.contains(FipsTest::Poker));
        assert!(failures.contains(FipsTest::Runs));
        assert!(failures.contains(FipsTest::LongRun));
        assert!(stats.results().iter().all(|r| r.details.contains("Insufficient")));
    }

    #[test]
    fn test_only_first_block_is_examined() {
        let mut data = vec![0x55u8; FIPS_BLOCK_BYTES];
        data.extend_from_slice(&[0u8; 500]);
        let stats = BlockStatistics::compute(&data);
        assert_eq!(stats.bits, FIPS_BLOCK_BITS);
        assert_eq!(stats.ones, 10_000);
    }

    // -----------------------------------------------------------------------
    // Pseudo-random blocks
    // -----------------------------------------------------------------------

    #[test]
    fn test_pseudo_random_blocks_mostly_pass() {
        let mut ctx = FipsContext::default();
        let passed = (1..=20u64)
            .filter(|&seed| ctx.run(&pseudo_random(FIPS_BLOCK_BYTES, seed)).passed())
            .count();
        assert!(passed >= 18, "only {passed}/20 pseudo-random blocks passed");
    }

    #[test]
    fn test_results_cover_static_tests() {
        let stats = BlockStatistics::compute(&pseudo_random(FIPS_BLOCK_BYTES, 7));
        let results = stats.results();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].test, FipsTest::Monobit);
        assert_eq!(results[3].test, FipsTest::LongRun);
    }

    // -----------------------------------------------------------------------
    // Continuous run
    // -----------------------------------------------------------------------

    #[test]
    fn test_continuous_run_across_blocks() {
        let first = pseudo_random(FIPS_BLOCK_BYTES, 11);
        let mut second = pseudo_random(FIPS_BLOCK_BYTES, 12);
        second[..4].copy_from_slice(&first[FIPS_BLOCK_BYTES - 4..]);

        let mut ctx = FipsContext::new(4);
        assert!(!ctx.run(&first).failures.contains(FipsTest::ContinuousRun));
        let report = ctx.run(&second);
        assert!(report.failures.contains(FipsTest::ContinuousRun));
        // History moves on even after a failure.
        assert_eq!(ctx.last_word(), Some(word_le(&second[FIPS_BLOCK_BYTES - 4..])));
    }

    #[test]
    fn test_continuous_run_fresh_context_has_no_history() {
        let mut ctx = FipsContext::new(4);
        assert_eq!(ctx.last_word(), None);
        assert!(ctx.continuous_run(&[1, 2, 3, 4]));
        assert_eq!(ctx.last_word(), Some(0x0403_0201));
    }

    #[test]
    fn test_prime_and_resume() {
        let mut ctx = FipsContext::new(4);
        ctx.prime(&[9, 9, 9, 9, 1, 0, 0, 0, 7]);
        assert_eq!(ctx.last_word(), Some(1));
        assert!(!ctx.continuous_run(&[1, 0, 0, 0]));

        let mut resumed = FipsContext::resume(2, 0xabcd);
        assert!(!resumed.continuous_run(&[0xcd, 0xab]));
        assert_eq!(resumed.width(), 2);
    }

    #[test]
    #[should_panic(expected = "continuous-run width")]
    fn test_invalid_width_panics() {
        let _ = FipsContext::new(9);
    }

    // -----------------------------------------------------------------------
    // Failure bitmap
    // -----------------------------------------------------------------------

    #[test]
    fn test_failures_bitmap() {
        let failures: FipsFailures = [FipsTest::Poker, FipsTest::ContinuousRun].into_iter().collect();
        assert!(failures.contains(FipsTest::Poker));
        assert!(!failures.contains(FipsTest::Monobit));
        assert_eq!(failures.bits(), 0b1_0010);
        assert_eq!(failures.to_string(), "poker,continuous_run");
        assert_eq!(FipsFailures::NONE.to_string(), "none");
        assert_eq!(failures.iter().count(), 2);
    }

    #[test]
    fn test_indices_match_all_order() {
        for (i, test) in FipsTest::ALL.iter().enumerate() {
            assert_eq!(test.index(), i);
        }
    }
}
