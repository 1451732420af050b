//! Treesync library
//!
//! Push-style tree replication: a client walks a local file tree and
//! replicates it into a remote daemon's root over a private wire protocol,
//! streaming file contents only when size or fingerprint differ.

pub mod cli;
pub mod daemon;
pub mod fingerprint;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod walker;
