use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Instant;

use rngfeed_core::{EXIT_FAIL, EXIT_OSERR, EXIT_SUCCESS, EXIT_USAGE};
use rngfeed_fips::{FIPS_BLOCK_BYTES, FipsContext, FipsTest};

/// Totals from checking a stream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub blocks: u64,
    pub failed_blocks: u64,
    pub test_failures: [u64; 5],
    /// Failing blocks as (index, failures) pairs.
    pub failed: Vec<(u64, String)>,
}

impl CheckSummary {
    pub fn passed(&self) -> bool {
        self.failed_blocks == 0
    }
}

pub fn run(input: Option<&Path>, max_blocks: Option<u64>, width_bits: usize) -> i32 {
    if width_bits == 0 || width_bits % 8 != 0 || width_bits > 64 {
        eprintln!("--width-bits must be a multiple of 8 between 8 and 64");
        return EXIT_USAGE;
    }
    let reader: Box<dyn Read> = match input {
        None => Box::new(io::stdin().lock()),
        Some(p) if p == Path::new("-") => Box::new(io::stdin().lock()),
        Some(p) => match File::open(p) {
            Ok(f) => Box::new(BufReader::new(f)),
            Err(e) => {
                eprintln!("can't open {}: {e}", p.display());
                return EXIT_OSERR;
            }
        },
    };

    let started = Instant::now();
    let summary = match check_stream(reader, max_blocks, width_bits / 8) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("read error: {e}");
            return EXIT_OSERR;
        }
    };
    print_summary(&summary, started.elapsed().as_secs_f64());

    if summary.blocks == 0 {
        eprintln!("not enough input for one {FIPS_BLOCK_BYTES}-byte block");
        return EXIT_FAIL;
    }
    if summary.passed() {
        EXIT_SUCCESS
    } else {
        EXIT_FAIL
    }
}

/// Prime the continuous-run test from the first word, then test each
/// complete block. A trailing partial block is ignored.
pub fn check_stream(
    mut reader: impl Read,
    max_blocks: Option<u64>,
    width: usize,
) -> io::Result<CheckSummary> {
    let mut summary = CheckSummary::default();
    let mut ctx = FipsContext::new(width);
    let mut word = vec![0u8; width];
    if !fill(&mut reader, &mut word)? {
        return Ok(summary);
    }
    ctx.prime(&word);

    let mut block = vec![0u8; FIPS_BLOCK_BYTES];
    while max_blocks.is_none_or(|max| summary.blocks < max) {
        if !fill(&mut reader, &mut block)? {
            break;
        }
        let failures = ctx.run(&block).failures;
        if !failures.is_empty() {
            summary.failed_blocks += 1;
            for test in failures.iter() {
                summary.test_failures[test.index()] += 1;
            }
            summary.failed.push((summary.blocks, failures.to_string()));
        }
        summary.blocks += 1;
    }
    Ok(summary)
}

/// Fill `buf` completely; `false` on EOF before it is full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn print_summary(summary: &CheckSummary, secs: f64) {
    for (index, failures) in &summary.failed {
        println!("block {index:>6}: FAIL ({failures})");
    }
    println!();
    println!("  {:<40} {:>8}", "Blocks tested", summary.blocks);
    println!("  {:<40} {:>8}", "Successes", summary.blocks - summary.failed_blocks);
    println!("  {:<40} {:>8}", "Failures", summary.failed_blocks);
    for test in FipsTest::ALL {
        println!("  {:<40} {:>8}", test.name(), summary.test_failures[test.index()]);
    }
    if secs > 0.0 {
        let kibits = (summary.blocks * FIPS_BLOCK_BYTES as u64 * 8) as f64 / 1024.0;
        println!("  {:<40} {:>8.1} Kibits/s", "Throughput", kibits / secs);
    }
}
