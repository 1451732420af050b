//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;

/// Common daemon options used by treesyncd
#[derive(Clone, Debug, Parser)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:9040")]
    pub bind: String,

    /// Root directory to replicate into
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Write JSONL log entries to file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

/// Split a `host[:port]` argument, falling back to the protocol default port.
pub fn parse_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(DEFAULT_PORT))
        }
        _ => (addr.to_string(), DEFAULT_PORT),
    }
}
