//! lltrace CLI
//!
//! Bluetooth LE link-layer connection and control-procedure tracking over pcap captures

mod capture;
mod config;
mod progress;
mod report;

use clap::{Parser, Subcommand};
use lltrace_core::{Discard, Engine, FrameContext, NextLayer, Pass, ReassembledMessage};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use capture::Capture;
use config::{Config, OutputFormat};
use progress::{PassProgress, format_bytes};

/// lltrace - follow BLE connections, retransmissions and LL control procedures
#[derive(Parser)]
#[command(name = "lltrace")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report format, overriding the configuration file
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the verdict of every frame
    Analyze {
        /// Capture file (pcap, link type 251 or 256)
        #[arg(required = true)]
        capture: PathBuf,

        /// Print payloads handed to the next layer as hex
        #[arg(long)]
        payloads: bool,
    },

    /// List connection instances
    Connections {
        /// Capture file (pcap, link type 251 or 256)
        #[arg(required = true)]
        capture: PathBuf,
    },

    /// List LL control procedures
    Procedures {
        /// Capture file (pcap, link type 251 or 256)
        #[arg(required = true)]
        capture: PathBuf,
    },

    /// Write a default configuration file
    Init {
        /// Output path (defaults to the user config directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format.unwrap_or(config.output.format);
    match cli.command {
        Commands::Analyze { capture, payloads } => {
            analyze(&capture, &config, format, payloads)?;
        }
        Commands::Connections { capture } => {
            list_connections(&capture, &config, format)?;
        }
        Commands::Procedures { capture } => {
            list_procedures(&capture, &config, format)?;
        }
        Commands::Init { output } => {
            let path = output.unwrap_or_else(Config::default_path);
            if path.exists() {
                anyhow::bail!("Refusing to overwrite {}", path.display());
            }
            Config::default().save(&path)?;
            println!("Configuration written to {}", path.display());
        }
    }

    Ok(())
}

/// Read a capture and run the authoritative pass over it, handing completed
/// messages to `next`
fn load(path: &Path, config: &Config, next: &mut dyn NextLayer) -> anyhow::Result<(Capture, Engine)> {
    let size = std::fs::metadata(path)?.len();
    let capture = Capture::open(path)?;
    tracing::info!(
        link_type = ?capture.link_type(),
        "Read {} frames ({}) from {}",
        capture.frames().len(),
        format_bytes(size),
        path.display()
    );
    if capture.skipped() > 0 {
        tracing::warn!("{} records skipped", capture.skipped());
    }

    let mut engine = Engine::new(config.engine.clone())?;
    let progress = PassProgress::new(capture.frames().len() as u64, "Authoritative");
    for frame in capture.frames() {
        engine.process(&frame.bytes, &frame.ctx, Pass::Authoritative, next)?;
        progress.inc();
    }
    progress.finish();
    Ok((capture, engine))
}

/// Print every frame's verdict from a replay pass
fn analyze(path: &Path, config: &Config, format: OutputFormat, payloads: bool) -> anyhow::Result<()> {
    let show_payloads = payloads || config.output.show_payloads;
    let mut delivered: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    let mut collect = |message: &ReassembledMessage<'_>, ctx: &FrameContext| {
        if show_payloads {
            delivered
                .entry(ctx.frame)
                .or_default()
                .push(hex::encode(message.bytes));
        }
    };
    let (capture, mut engine) = load(path, config, &mut collect)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let progress = PassProgress::new(capture.frames().len() as u64, "Replay");
    let mut annotated = 0usize;

    for frame in capture.frames() {
        let verdict = engine
            .process(&frame.bytes, &frame.ctx, Pass::Replay, &mut Discard)?
            .clone();
        let payloads = delivered.get(&frame.ctx.frame).map_or(&[][..], Vec::as_slice);
        if !verdict.annotations.is_empty() {
            annotated += 1;
        }

        let refs = config
            .output
            .show_cross_references
            .then(|| engine.cross_references(frame.ctx.frame));
        let line = match format {
            OutputFormat::Text => report::frame_text(&verdict, refs.as_ref(), payloads),
            OutputFormat::Json => report::frame_json(&verdict, refs.as_ref(), payloads)?,
        };
        writeln!(out, "{line}")?;
        progress.inc();
    }
    progress.finish();

    if format == OutputFormat::Text {
        eprintln!(
            "{} frames, {} connections, {} procedures, {} frames annotated",
            capture.frames().len(),
            engine.registry().connections().len(),
            engine.procedures().len(),
            annotated
        );
    }
    Ok(())
}

/// Print every connection instance
fn list_connections(path: &Path, config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    let (_, engine) = load(path, config, &mut Discard)?;
    let registry = engine.registry();
    let connections = registry.connections();
    if connections.is_empty() && format == OutputFormat::Text {
        println!("No connections found");
    }
    for record in connections {
        match format {
            OutputFormat::Text => println!("{}", report::connection_text(registry, record)),
            OutputFormat::Json => println!("{}", report::connection_json(registry, record)?),
        }
    }
    Ok(())
}

/// Print every control procedure
fn list_procedures(path: &Path, config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    if !config.engine.analyze_control_procedures {
        anyhow::bail!("Control procedure analysis is disabled in the configuration");
    }
    let (_, engine) = load(path, config, &mut Discard)?;
    let procedures = engine.procedures();
    if procedures.is_empty() && format == OutputFormat::Text {
        println!("No control procedures found");
    }
    for (id, record) in procedures {
        match format {
            OutputFormat::Text => println!("{}", report::procedure_text(&id, record)),
            OutputFormat::Json => println!("{}", report::procedure_json(&id, record)?),
        }
    }
    Ok(())
}
