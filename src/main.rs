//! treesync - push a local tree to a treesyncd daemon

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use treesync::cli::parse_host_port;
use treesync::logger::{ConsoleLogger, Logger, NoopLogger, TextLogger};
use treesync::walker;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "treesync - replicate a directory tree onto a remote treesyncd daemon"
)]
struct Args {
    /// Source file or directory to replicate
    source: PathBuf,

    /// Remote daemon address (host[:port])
    remote: String,

    /// Show entries and verdicts as they happen
    #[arg(short, long)]
    verbose: bool,

    /// Write timestamped log lines to file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (host, port) = parse_host_port(&args.remote);

    let log: Arc<dyn Logger> = match &args.log_file {
        Some(path) => Arc::new(TextLogger::new(path)?),
        None if args.verbose => Arc::new(ConsoleLogger),
        None => Arc::new(NoopLogger),
    };

    let start = Instant::now();
    let stats = walker::push(&args.source, &host, port, log.clone())?;
    let seconds = start.elapsed().as_secs_f64();
    log.done(stats.entries, stats.transfers, stats.errors, seconds);

    println!(
        "{} entries, {} transfers, {} errors in {:.3}s",
        stats.entries, stats.transfers, stats.errors, seconds
    );
    if stats.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
