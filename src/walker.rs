//! Client tree walker
//!
//! Walks the source tree depth-first (directories before their contents),
//! sends one entry descriptor per file or directory on the control
//! connection, and reacts to the server's verdict. SendData fans out to a
//! transfer worker thread with its own connection so traversal and payload
//! transfer overlap; every worker is joined before the walk reports.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use walkdir::WalkDir;

use crate::fingerprint::{fingerprint_reader, FINGERPRINT_LEN};
use crate::logger::Logger;
use crate::protocol::{decode_verdict, Entry, EntryKind, Verdict, VERDICT_LEN};
use crate::transfer;

/// Aggregate outcome of one push.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushStats {
    /// Descriptors transmitted (symlinks and failed entries excluded).
    pub entries: u64,
    /// Data transfers the server requested.
    pub transfers: u64,
    /// Entries that failed on either side.
    pub errors: u64,
}

/// Replicate `source` (a file or directory) into the remote daemon's root.
/// The transmitted paths start at the source's basename, so `push /tmp/tree`
/// creates `tree/...` under the daemon root.
pub fn push(source: &Path, host: &str, port: u16, log: Arc<dyn Logger>) -> Result<PushStats> {
    let source = fs::canonicalize(source)
        .with_context(|| format!("resolve source {}", source.display()))?;
    let base: PathBuf = match source.file_name() {
        Some(name) => PathBuf::from(name),
        None => bail!("source {} has no basename", source.display()),
    };
    let mut control = TcpStream::connect((host, port))
        .with_context(|| format!("connect {}:{}", host, port))?;

    let mut stats = PushStats::default();
    let mut workers: Vec<(String, JoinHandle<Result<u64>>)> = Vec::new();

    // Dotfile entries below the root are always skipped; this hides them and
    // keeps `.`/`..` out of the recursion.
    let mut it = WalkDir::new(&source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    while let Some(item) = it.next() {
        let item = match item {
            Ok(i) => i,
            Err(e) => {
                let at = e.path().map_or_else(String::new, |p| p.display().to_string());
                log.error("walk", &at, &e.to_string());
                stats.errors += 1;
                continue;
            }
        };
        if item.file_type().is_symlink() {
            // Builds to a Skip descriptor; never transmitted.
            log.entry(EntryKind::Skip.name(), &item.path().display().to_string());
            continue;
        }
        let is_dir = item.file_type().is_dir();
        let rel = match relative_name(&base, &source, item.path()) {
            Ok(r) => r,
            Err(e) => {
                log.error("path", &item.path().display().to_string(), &e.to_string());
                stats.errors += 1;
                if is_dir {
                    it.skip_current_dir();
                }
                continue;
            }
        };
        let entry = match build_entry(item.path(), &rel) {
            Ok(e) => e,
            Err(e) => {
                log.error("entry", &rel, &e.to_string());
                stats.errors += 1;
                if is_dir {
                    // Without the directory descriptor its children cannot
                    // land anywhere; abandon the subtree.
                    it.skip_current_dir();
                }
                continue;
            }
        };

        log.entry(entry.kind.name(), &entry.rel_path);
        let verdict = match exchange(&mut control, &entry) {
            Ok(v) => v,
            Err(e) => {
                // Transfers already in flight still get joined and reported
                // before the walk gives up.
                join_workers(std::mem::take(&mut workers), &mut stats, log.as_ref());
                return Err(e).context("control connection failed");
            }
        };
        stats.entries += 1;
        log.verdict(&entry.rel_path, verdict.name());
        match verdict {
            Verdict::Ok => {}
            Verdict::Error => {
                stats.errors += 1;
                if is_dir {
                    it.skip_current_dir();
                }
            }
            Verdict::SendData => {
                stats.transfers += 1;
                let host = host.to_string();
                let path = item.path().to_path_buf();
                let rel_for_log = entry.rel_path.clone();
                let handle =
                    std::thread::spawn(move || transfer::send_file(&host, port, entry, &path));
                workers.push((rel_for_log, handle));
            }
        }
    }

    // Join every transfer worker so failures surface in the exit status and
    // nothing is orphaned.
    join_workers(workers, &mut stats, log.as_ref());
    Ok(stats)
}

fn join_workers(
    workers: Vec<(String, JoinHandle<Result<u64>>)>,
    stats: &mut PushStats,
    log: &dyn Logger,
) {
    for (rel, handle) in workers {
        match handle.join() {
            Ok(Ok(bytes)) => log.transfer(&rel, bytes),
            Ok(Err(e)) => {
                log.error("transfer", &rel, &e.to_string());
                stats.errors += 1;
            }
            Err(_) => {
                log.error("transfer", &rel, "worker panicked");
                stats.errors += 1;
            }
        }
    }
}

/// Path as transmitted: source basename plus the path below the source.
fn relative_name(base: &Path, source: &Path, full: &Path) -> Result<String> {
    let suffix = full.strip_prefix(source)?;
    let rel = if suffix.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(suffix)
    };
    match rel.to_str() {
        Some(s) => Ok(s.to_string()),
        None => bail!("path is not UTF-8"),
    }
}

/// lstat one filesystem object into a descriptor. Regular files carry their
/// size, permission bits, and full-content fingerprint; directories leave
/// the fingerprint zeroed.
fn build_entry(full: &Path, rel: &str) -> Result<Entry> {
    let meta = fs::symlink_metadata(full)?;
    let mode = meta.permissions().mode();
    if meta.is_dir() {
        return Ok(Entry {
            kind: EntryKind::Directory,
            rel_path: rel.to_string(),
            mode,
            fingerprint: [0u8; FINGERPRINT_LEN],
            size: 0,
        });
    }
    let size = match u16::try_from(meta.len()) {
        Ok(s) => s,
        // The wire size field is 16-bit; larger files cannot be described.
        Err(_) => bail!("file is {} bytes, larger than the protocol maximum", meta.len()),
    };
    let mut file = fs::File::open(full)?;
    let fingerprint = fingerprint_reader(&mut file)?;
    Ok(Entry {
        kind: EntryKind::File,
        rel_path: rel.to_string(),
        mode,
        fingerprint,
        size,
    })
}

/// Send one descriptor on the control connection and block for its verdict.
fn exchange(control: &mut TcpStream, entry: &Entry) -> Result<Verdict> {
    control.write_all(&entry.encode()?)?;
    let mut reply = [0u8; VERDICT_LEN];
    control.read_exact(&mut reply)?;
    decode_verdict(&reply)
}
