//! Build automation tasks for lltrace
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

/// Fuzz targets under `fuzz/`
const FUZZ_TARGETS: &[&str] = &["fuzz_pdu_parser", "fuzz_engine", "fuzz_config_parse"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "lltrace build automation")]
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

    /// Generate documentation
    Doc,

    /// Run a fuzz target (requires cargo-fuzz and a nightly toolchain)
    Fuzz {
        /// Target name; all targets when omitted
        target: Option<String>,

        /// Seconds per target
        #[arg(long, default_value_t = 60)]
        seconds: u32,
    },
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
            run_command("cargo", &["bench", "--workspace", "--no-run"])?;
            println!("All CI checks passed!");
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
        Commands::Fuzz { target, seconds } => {
            let targets: Vec<&str> = match &target {
                Some(name) if FUZZ_TARGETS.contains(&name.as_str()) => vec![name.as_str()],
                Some(name) => anyhow::bail!(
                    "Unknown fuzz target {name}. Available: {}",
                    FUZZ_TARGETS.join(", ")
                ),
                None => FUZZ_TARGETS.to_vec(),
            };
            let max_time = format!("-max_total_time={seconds}");
            for target in targets {
                println!("Fuzzing {target} for {seconds}s...");
                run_command("cargo", &["+nightly", "fuzz", "run", target, "--", &max_time])?;
            }
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
