//! CLI for rngfeed: check hardware RNG output with FIPS 140-2 tests and feed
//! it to the kernel entropy pool.

mod commands;
mod signals;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rngfeed_core::{EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "rngfeed")]
#[command(about = "rngfeed: check hardware RNG output and feed it to the kernel entropy pool")]
#[command(version = rngfeed_core::VERSION)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: read the HRNG, test every block, feed the kernel
    Run(commands::run::RunArgs),

    /// Run the FIPS 140-2 battery over a file (or stdin) and report
    Check {
        /// Input file; stdin when omitted or "-"
        input: Option<PathBuf>,

        /// Stop after this many 2500-byte blocks
        #[arg(long)]
        blocks: Option<u64>,

        /// Continuous-run test word size in bits
        #[arg(long, default_value_t = 32)]
        width_bits: usize,
    },

    /// List the known HRNG presets
    Presets,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logging(cli.verbose, cli.quiet);

    let code = match cli.command {
        Commands::Run(args) => commands::run::run(&args),
        Commands::Check {
            input,
            blocks,
            width_bits,
        } => commands::check::run(input.as_deref(), blocks, width_bits),
        Commands::Presets => commands::presets::run(),
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}
