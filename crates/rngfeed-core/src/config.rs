//! Daemon configuration, watermarks and HRNG presets.
//!
//! A [`Config`] is built once by the CLI, validated, then shared read-only
//! as `Arc<Config>` by every stage.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rngfeed_fips::FIPS_BLOCK_BYTES;
use serde::Serialize;

use crate::error::ConfigError;
use crate::source::DriverKind;

/// A kernel entropy threshold, absolute or relative to the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Watermark {
    /// An absolute number of bits.
    Bits(u32),
    /// A percentage (1..=100) of the kernel pool size.
    Percent(u8),
}

impl Watermark {
    /// Resolve to bits for a kernel pool of `pool_size_bits`.
    pub fn resolve(self, pool_size_bits: u32) -> u32 {
        match self {
            Self::Bits(bits) => bits.min(pool_size_bits),
            Self::Percent(pct) => (u64::from(pool_size_bits) * u64::from(pct) / 100) as u32,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bits(bits) => write!(f, "{bits}"),
            Self::Percent(pct) => write!(f, "{pct}%"),
        }
    }
}

impl FromStr for Watermark {
    type Err = ConfigError;

    /// Accepts `"2048"`, `"90%"`, or the legacy negative form `"-90"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadWatermark(s.to_string());
        let trimmed = s.trim();
        let percent = trimmed
            .strip_suffix('%')
            .or_else(|| trimmed.strip_prefix('-'));
        match percent {
            Some(pct) => {
                let pct: u8 = pct.parse().map_err(|_| bad())?;
                if pct == 0 || pct > 100 {
                    return Err(bad());
                }
                Ok(Self::Percent(pct))
            }
            None => trimmed.parse().map(Self::Bits).map_err(|_| bad()),
        }
    }
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// Known hardware RNG profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HrngPreset {
    /// Any character-device HRNG with unknown quality.
    #[default]
    Generic,
    /// Intel 82802AB/82802AC firmware hub RNG.
    IntelFwh,
    /// The OS CSPRNG; for testing without hardware.
    Os,
}

/// Values a preset supplies for options the user did not set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetParams {
    pub tag: &'static str,
    pub name: &'static str,
    pub continuous_width_bits: usize,
    pub buffers: usize,
    pub entropy_factor: f64,
    pub driver: DriverKind,
}

impl HrngPreset {
    pub const ALL: [HrngPreset; 3] = [Self::Generic, Self::IntelFwh, Self::Os];

    pub fn params(self) -> PresetParams {
        match self {
            Self::Generic => PresetParams {
                tag: "generic",
                name: "Generic character-device HRNG",
                continuous_width_bits: 32,
                buffers: 3,
                entropy_factor: 1.0,
                driver: DriverKind::Stream,
            },
            Self::IntelFwh => PresetParams {
                tag: "intelfwh",
                name: "Intel FWH (82802AB/AC) RNG",
                continuous_width_bits: 32,
                buffers: 5,
                entropy_factor: 0.998,
                driver: DriverKind::Stream,
            },
            Self::Os => PresetParams {
                tag: "os",
                name: "Operating system CSPRNG (getrandom)",
                continuous_width_bits: 32,
                buffers: 3,
                entropy_factor: 0.5,
                driver: DriverKind::Os,
            },
        }
    }

    pub fn tag(self) -> &'static str {
        self.params().tag
    }
}

impl fmt::Display for HrngPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for HrngPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.tag() == wanted)
            .ok_or_else(|| ConfigError::UnknownPreset(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Everything the daemon needs to run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Entropy source device.
    pub rng_device: PathBuf,
    /// Kernel random device.
    pub random_device: PathBuf,
    pub pidfile: PathBuf,
    pub daemonize: bool,
    pub driver: DriverKind,
    pub buffers: usize,
    /// Bytes per buffer; a whole number of FIPS blocks.
    pub buffer_size: usize,
    /// Entropy credited per bit of source output, in (0, 1].
    pub entropy_factor: f64,
    /// Word size for the continuous-run test, in bits.
    pub continuous_width_bits: usize,
    /// Bytes per kernel submission.
    pub random_step: usize,
    /// How long the sink sleeps when the kernel pool is full.
    pub feed_interval: Duration,
    /// Submit immediately while the kernel holds less than this.
    pub high_watermark: Watermark,
    /// Kernel wakes us when it drops below this; defaults to the high mark.
    pub low_watermark: Option<Watermark>,
    /// Per-read source timeout.
    pub source_timeout: Duration,
    /// Consecutive FIPS failures that mean the source is broken.
    pub max_bad_blocks: u32,
    pub max_device_retries: u32,
    pub max_sink_retries: u32,
    pub stats_interval: Duration,
    /// Where the continuous-run test's last word survives restarts.
    pub continuous_state: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rng_device: PathBuf::from("/dev/urandom"),
            random_device: PathBuf::from("/dev/random"),
            pidfile: PathBuf::from("/var/run/rngfeed.pid"),
            daemonize: true,
            driver: DriverKind::Stream,
            buffers: 3,
            buffer_size: FIPS_BLOCK_BYTES,
            entropy_factor: 1.0,
            continuous_width_bits: 32,
            random_step: 64,
            feed_interval: Duration::from_secs(5),
            high_watermark: Watermark::Percent(90),
            low_watermark: None,
            source_timeout: Duration::from_secs(10),
            max_bad_blocks: 25,
            max_device_retries: 3,
            max_sink_retries: 5,
            stats_interval: Duration::from_secs(3600),
            continuous_state: None,
        }
    }
}

impl Config {
    /// Defaults with a preset's values applied.
    pub fn for_preset(preset: HrngPreset) -> Self {
        let params = preset.params();
        Self {
            buffers: params.buffers,
            entropy_factor: params.entropy_factor,
            continuous_width_bits: params.continuous_width_bits,
            driver: params.driver,
            ..Self::default()
        }
    }

    pub fn continuous_width_bytes(&self) -> usize {
        self.continuous_width_bits / 8
    }

    /// The effective low watermark.
    pub fn low_watermark(&self) -> Watermark {
        self.low_watermark.unwrap_or(self.high_watermark)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffers < 2 {
            return Err(ConfigError::TooFewBuffers(self.buffers));
        }
        if self.buffer_size < FIPS_BLOCK_BYTES || self.buffer_size % FIPS_BLOCK_BYTES != 0 {
            return Err(ConfigError::BufferTooSmall(self.buffer_size));
        }
        if !(self.entropy_factor > 0.0 && self.entropy_factor <= 1.0) {
            return Err(ConfigError::EntropyFactor(self.entropy_factor));
        }
        if self.random_step == 0 {
            return Err(ConfigError::RandomStep);
        }
        let width = self.continuous_width_bits;
        if width == 0 || width % 8 != 0 || width > 64 || FIPS_BLOCK_BYTES % (width / 8) != 0 {
            return Err(ConfigError::ContinuousWidth(width));
        }
        if self.source_timeout.is_zero() {
            return Err(ConfigError::Timeout);
        }
        let low = self.low_watermark();
        let too_high = match (low, self.high_watermark) {
            (Watermark::Bits(l), Watermark::Bits(h)) => l > h,
            (Watermark::Percent(l), Watermark::Percent(h)) => l > h,
            _ => false,
        };
        if too_high {
            return Err(ConfigError::Watermarks {
                low: low.to_string(),
                high: self.high_watermark.to_string(),
            });
        }
        Ok(())
    }
}
