//! depth-recorder: record Binance depth to an archive and replay it offline.
//!
//! Usage:
//!   depth-recorder record                       # symbols from config.json
//!   depth-recorder record --symbols BTCUSDT,futures:ETHUSDT
//!   depth-recorder snapshots --symbol BTCUSDT
//!   depth-recorder blocks --symbol BTCUSDT
//!   depth-recorder replay --symbol BTCUSDT --from 0 --depth 10 --flat

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use market_data::binance::Binance;
use market_data::blocks::list_data_blocks;
use market_data::config::RecorderConfig;
use market_data::live::{LiveOptions, LiveRecorder};
use market_data::replay::{
    list_snapshot_update_ids, reconstruct_partial, Projection, SideFilter, DEFAULT_BLOCK_SIZE,
};
use persistence::archive::{ArchiveOptions, ArchiveReader, FileArchive};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use types::ids::Symbol;

#[derive(Parser, Debug)]
#[command(name = "depth-recorder")]
#[command(about = "Record order book snapshots and diffs, and rebuild books from the archive")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "RECORDER_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Archive root, overrides `archive_dir` from the config file
    #[arg(long, env = "RECORDER_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream live depth into the archive until interrupted
    Record {
        /// Overrides `symbols` from the config file
        #[arg(long, env = "RECORDER_SYMBOLS", value_delimiter = ',')]
        symbols: Vec<String>,
    },

    /// List archived symbols
    Symbols,

    /// List snapshot update ids for a symbol
    Snapshots {
        #[arg(long)]
        symbol: String,
    },

    /// List contiguous runs of archived diffs
    Blocks {
        #[arg(long)]
        symbol: String,

        #[arg(long, default_value = "0")]
        from: u64,

        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
    },

    /// Rebuild books and print one line per state
    Replay {
        #[arg(long)]
        symbol: String,

        /// Start at the first snapshot after this update id
        #[arg(long, default_value = "0")]
        from: u64,

        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,

        /// Levels per side; all levels when omitted
        #[arg(long)]
        depth: Option<usize>,

        #[arg(long, value_enum, default_value = "both")]
        side: SideArg,

        /// Print `update_id,timestamp,ask1_p,ask1_q,bid1_p,bid1_q,...` instead of JSON
        #[arg(long)]
        flat: bool,

        /// Stop after this many states
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SideArg {
    Both,
    Bids,
    Asks,
}

impl From<SideArg> for SideFilter {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Both => SideFilter::Both,
            SideArg::Bids => SideFilter::Bids,
            SideArg::Asks => SideFilter::Asks,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Record { symbols } => {
            let mut config = RecorderConfig::load(&args.config)?;
            if !symbols.is_empty() {
                config.symbols = symbols;
            }
            if let Some(dir) = args.archive_dir {
                config.archive_dir = dir;
            }
            let symbols = config.validate()?;
            init_logging(&config)?;
            let ignored = config.ignored_keys();
            if !ignored.is_empty() {
                warn!(keys = ?ignored, "Ignoring legacy config keys");
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?;
            runtime.block_on(record(config, symbols))
        }
        Commands::Symbols => {
            let archive = open_archive(&args.config, args.archive_dir)?;
            print_symbols(&archive)
        }
        Commands::Snapshots { symbol } => {
            let archive = open_archive(&args.config, args.archive_dir)?;
            print_snapshots(&archive, &Symbol::parse(&symbol)?)
        }
        Commands::Blocks {
            symbol,
            from,
            block_size,
        } => {
            let archive = open_archive(&args.config, args.archive_dir)?;
            print_blocks(&archive, &Symbol::parse(&symbol)?, from, block_size)
        }
        Commands::Replay {
            symbol,
            from,
            block_size,
            depth,
            side,
            flat,
            limit,
        } => {
            let archive = open_archive(&args.config, args.archive_dir)?;
            let projection = Projection {
                side: side.into(),
                depth,
            };
            let options = ReplayOutput {
                flat,
                limit: limit.unwrap_or(usize::MAX),
            };
            print_replay(&archive, &Symbol::parse(&symbol)?, from, block_size, projection, options)
        }
    }
}

/// Offline commands log warnings to stderr and read the archive.
fn open_archive(config: &Path, flag: Option<PathBuf>) -> Result<FileArchive> {
    init_console_logging();
    let archive_dir = resolve_archive_dir(config, flag);
    FileArchive::open(&archive_dir, ArchiveOptions::default())
        .with_context(|| format!("failed to open archive {}", archive_dir.display()))
}

fn init_logging(config: &RecorderConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_to_console {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    }

    std::fs::create_dir_all(&config.archive_dir)?;
    let path = config.log_file();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
}

/// Flag, then config file, then the default.
fn resolve_archive_dir(config: &Path, flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    match RecorderConfig::load(config) {
        Ok(config) => config.archive_dir,
        Err(_) => PathBuf::from("archive"),
    }
}

async fn record(config: RecorderConfig, symbols: Vec<Symbol>) -> Result<()> {
    info!(
        symbols = ?symbols,
        archive_dir = %config.archive_dir.display(),
        stream_interval = config.stream_interval,
        full_fetch_interval = config.full_fetch_interval,
        "Starting depth recorder"
    );

    let archive = FileArchive::open(&config.archive_dir, config.archive_options())
        .with_context(|| format!("failed to open archive {}", config.archive_dir.display()))?;
    let binance = Arc::new(Binance::new(config.stream_interval)?);
    let cancel = CancellationToken::new();

    let recorder = LiveRecorder::spawn(
        Arc::clone(&binance),
        binance,
        archive,
        LiveOptions::from_config(&config, symbols),
        cancel.clone(),
    );

    shutdown_signal().await;
    info!("Received shutdown signal, draining");
    cancel.cancel();

    let report = recorder.join().await?;
    for (symbol, stats) in &report.engines {
        info!(
            symbol = %symbol,
            diffs_applied = stats.diffs_applied,
            gaps = stats.gaps,
            resyncs = stats.resyncs,
            "Final engine stats"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl+c");
    }
}

fn print_symbols(archive: &FileArchive) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    for symbol in archive.list_symbols()? {
        writeln!(out, "{}", symbol)?;
    }
    out.flush()?;
    Ok(())
}

fn print_snapshots(archive: &FileArchive, symbol: &Symbol) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    for id in list_snapshot_update_ids(archive, symbol)? {
        writeln!(out, "{}", id)?;
    }
    out.flush()?;
    Ok(())
}

fn print_blocks(archive: &FileArchive, symbol: &Symbol, from: u64, block_size: usize) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    for block in list_data_blocks(archive, symbol, from, block_size)? {
        writeln!(out, "{}", serde_json::to_string(&block)?)?;
    }
    out.flush()?;
    Ok(())
}

struct ReplayOutput {
    flat: bool,
    limit: usize,
}

fn print_replay(
    archive: &FileArchive,
    symbol: &Symbol,
    from: u64,
    block_size: usize,
    projection: Projection,
    output: ReplayOutput,
) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    let mut replay = reconstruct_partial(archive, symbol, from, block_size, projection)?;

    for book in replay.by_ref().take(output.limit) {
        let book = book?;
        if output.flat {
            let row: Vec<String> = book.interleaved().iter().map(|v| v.to_string()).collect();
            writeln!(
                out,
                "{},{},{}",
                book.last_update_id,
                book.timestamp,
                row.join(",")
            )?;
        } else {
            writeln!(out, "{}", serde_json::to_string(&book)?)?;
        }
    }
    out.flush()?;

    eprintln!(
        "stopped: {:?}, resume with --from {}",
        replay.termination(),
        replay.resume_cursor()
    );
    Ok(())
}
