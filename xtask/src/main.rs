//! Build automation tasks for headlink
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

const FUZZ_TARGETS: [&str; 3] = [
    "fuzz_packet_parser",
    "fuzz_stun_response",
    "fuzz_signal_message",
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "headlink build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the packet codec benchmarks
    Bench,

    /// Run fuzz targets (requires nightly and cargo-fuzz)
    Fuzz {
        /// Single target to run; all targets when omitted
        target: Option<String>,

        /// Seconds per target
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench => {
            run_command("cargo", &["bench", "-p", "headlink-core"])?;
        }
        Commands::Fuzz { target, seconds } => {
            let targets: Vec<String> = match target {
                Some(target) if FUZZ_TARGETS.contains(&target.as_str()) => vec![target],
                Some(target) => anyhow::bail!(
                    "Unknown fuzz target {}. Known targets: {}",
                    target,
                    FUZZ_TARGETS.join(", ")
                ),
                None => FUZZ_TARGETS.iter().map(|t| (*t).to_string()).collect(),
            };
            let max_time = format!("-max_total_time={seconds}");
            for target in &targets {
                println!("Fuzzing {target} for {seconds}s...");
                run_command(
                    "cargo",
                    &["+nightly", "fuzz", "run", "--fuzz-dir", "fuzz", target, "--", &max_time],
                )?;
            }
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
