//! nflog-dump
//!
//! Binds an nflog group, performs `count` receives and prints every batch.
//! The default output is the textual dump format, which `--replay` reads
//! back through the same receive path without touching the kernel.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging on stderr
//! - AU-12: Audit Record Generation - Logged packets written to stdout
//! - SI-4: System Monitoring - Kernel drop count reported at exit

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use nflog_reader::{
    read_dump, Batch, DumpWriter, InterfaceNames, NflogError, NflogSocket, OverflowMode,
    PacketSummary, ReplayTransport, SocketConfig, Transport,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Receive timeout used when neither a flag nor a config file sets one
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Queue threshold used when neither a flag nor a config file sets one
const DEFAULT_QTHRESH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Round-trippable literal dump
    Dump,
    /// One summary line per packet
    Text,
    /// One JSON object per packet
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "nflog-dump", version, about = "Dump packets logged through nfnetlink_log")]
struct Args {
    /// Logging group to bind (iptables --nflog-group)
    group: u16,

    /// Number of receive calls; each prints one batch
    count: usize,

    /// TOML socket configuration; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Receive timeout in milliseconds
    #[arg(short, long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Messages queued by the kernel before a batch is sent
    #[arg(short, long)]
    qthresh: Option<u32>,

    /// Reaction to kernel buffer overflow: ignore, handle or raise
    #[arg(short, long)]
    overflow: Option<OverflowMode>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Dump)]
    format: Format,

    /// Read batches from a dump file instead of the kernel
    #[arg(long, value_name = "DUMP")]
    replay: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    match run(&args) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %format!("{e:#}"), "nflog-dump: exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging on stderr
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {e}"))
}

fn build_config(args: &Args) -> Result<SocketConfig> {
    let mut config = match &args.config {
        Some(path) => SocketConfig::load_or_default(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SocketConfig::default()
            .with_receive_timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .with_queue_threshold(DEFAULT_QTHRESH),
    };

    config.group = args.group.into();
    if let Some(ms) = args.timeout_ms {
        config.receive_timeout_ms = Some(ms);
    }
    if let Some(qthresh) = args.qthresh {
        config.queue_threshold = qthresh;
    }
    if let Some(mode) = args.overflow {
        config.overflow_mode = mode;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    let mut output = Output::new(args.format, io::stdout().lock())?;

    match &args.replay {
        Some(path) => {
            let batches =
                read_dump(path).with_context(|| format!("reading dump {}", path.display()))?;
            info!(path = %path.display(), batches = batches.len(), "Replaying dump");
            let transport = ReplayTransport::from_batches(batches);
            let mut socket = NflogSocket::with_transport(config, transport)?;
            pump(&mut socket, args.count, &mut output)?;
        }
        None => {
            let mut socket = NflogSocket::open(config)
                .with_context(|| format!("opening nflog group {}", args.group))?;
            pump(&mut socket, args.count, &mut output)?;
        }
    }

    output.finish()
}

fn pump<T: Transport, W: Write>(
    socket: &mut NflogSocket<T>,
    count: usize,
    output: &mut Output<W>,
) -> Result<()> {
    for n in 0..count {
        match socket.receive() {
            Ok(batch) => output.write_batch(&batch)?,
            Err(NflogError::Closed) => {
                info!(receives = n, "Input closed");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Skipping batch");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(drops) = socket.drops().filter(|&d| d > 0) {
        warn!(drops, "Kernel dropped log messages");
    }
    socket.close();
    Ok(())
}

enum Output<W: Write> {
    Dump(DumpWriter<W>),
    Text { out: W, names: InterfaceNames },
    Json { out: W, names: InterfaceNames },
}

impl<W: Write> Output<W> {
    fn new(format: Format, out: W) -> io::Result<Self> {
        Ok(match format {
            Format::Dump => Self::Dump(DumpWriter::new(out)?),
            Format::Text => Self::Text {
                out,
                names: InterfaceNames::new(),
            },
            Format::Json => Self::Json {
                out,
                names: InterfaceNames::new(),
            },
        })
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        match self {
            Self::Dump(writer) => writer.write_batch(batch)?,
            Self::Text { out, names } => {
                for record in batch {
                    writeln!(out, "{}", PacketSummary::from_record(record, names))?;
                }
                out.flush()?;
            }
            Self::Json { out, names } => {
                for record in batch {
                    serde_json::to_writer(&mut *out, &PacketSummary::from_record(record, names))?;
                    out.write_all(b"\n")?;
                }
                out.flush()?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self {
            Self::Dump(writer) => {
                writer.finish()?;
            }
            Self::Text { mut out, .. } | Self::Json { mut out, .. } => out.flush()?,
        }
        Ok(())
    }
}
