//! Per-connection protocol state machine and destination checking
//!
//! Each connection owns an incremental parser that assembles one entry
//! descriptor across successive readiness events. One invocation performs at
//! most one field-read (or one payload chunk read) and advances the phase;
//! the machine never reads into the next field. TCP does not preserve write
//! boundaries, so a field may arrive split across events and is buffered
//! until complete.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::fingerprint::{first_mismatch, fingerprint_reader, FINGERPRINT_LEN};
use crate::logger::Logger;
use crate::protocol::{
    decode_kind, decode_mode, decode_path, decode_size, encode_verdict, Entry, EntryKind, Verdict,
    KIND_LEN, MAXDATA, MAXPATH, MODE_LEN, SIZE_LEN,
};

/// Current step of the incremental descriptor parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Kind,
    Path,
    Mode,
    Fingerprint,
    Size,
    Data,
}

impl Phase {
    fn field_len(self) -> usize {
        match self {
            Self::Kind => KIND_LEN,
            Self::Path => MAXPATH,
            Self::Mode => MODE_LEN,
            Self::Fingerprint => FINGERPRINT_LEN,
            Self::Size => SIZE_LEN,
            Self::Data => 0,
        }
    }
}

/// Outcome of driving the state machine once.
#[derive(Debug)]
pub enum Event {
    /// Nothing to report; wait for more readiness.
    Continue,
    /// A verdict must be written back to the peer.
    Reply(Verdict),
    /// Peer closed the connection cleanly.
    Closed,
}

fn blank_entry() -> Entry {
    Entry {
        kind: EntryKind::Skip,
        rel_path: String::new(),
        mode: 0,
        fingerprint: [0u8; FINGERPRINT_LEN],
        size: 0,
    }
}

/// State for one open socket. Created on accept, destroyed on peer close or
/// unrecoverable error; the in-progress entry is discarded with it.
pub struct Connection {
    stream: TcpStream,
    peer: String,
    phase: Phase,
    field: Vec<u8>,
    entry: Entry,
    remaining: usize,
    dest: Option<(PathBuf, File)>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            phase: Phase::Kind,
            field: Vec::with_capacity(MAXPATH),
            entry: blank_entry(),
            remaining: 0,
            dest: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn reset(&mut self) {
        self.phase = Phase::Kind;
        self.field.clear();
        self.entry = blank_entry();
        self.remaining = 0;
        self.dest = None;
    }

    /// Drive the state machine for one readiness notification.
    pub fn handle_readable(&mut self, root: &Path, log: &dyn Logger) -> Result<Event> {
        if self.phase == Phase::Data {
            return self.read_chunk(log);
        }
        self.read_field(root, log)
    }

    fn read_field(&mut self, root: &Path, log: &dyn Logger) -> Result<Event> {
        let want = self.phase.field_len() - self.field.len();
        let mut buf = [0u8; MAXPATH];
        let n = match self.stream.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Event::Continue),
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Event::Continue),
            Err(e) => return Err(e).context("read field"),
        };
        if n == 0 {
            // EOF before the first byte of a descriptor is a clean close;
            // anywhere else the peer died mid-entry.
            if self.phase == Phase::Kind && self.field.is_empty() {
                return Ok(Event::Closed);
            }
            bail!("peer closed mid-descriptor in phase {:?}", self.phase);
        }
        self.field.extend_from_slice(&buf[..n]);
        if self.field.len() < self.phase.field_len() {
            return Ok(Event::Continue);
        }
        self.field_complete(root, log)
    }

    fn field_complete(&mut self, root: &Path, log: &dyn Logger) -> Result<Event> {
        match self.phase {
            Phase::Kind => {
                self.entry.kind = decode_kind(&self.field)?;
                self.phase = Phase::Path;
            }
            Phase::Path => {
                self.entry.rel_path = decode_path(&self.field)?;
                self.phase = Phase::Mode;
            }
            Phase::Mode => {
                self.entry.mode = decode_mode(&self.field);
                self.phase = Phase::Fingerprint;
            }
            Phase::Fingerprint => {
                self.entry.fingerprint.copy_from_slice(&self.field);
                self.phase = Phase::Size;
            }
            Phase::Size => {
                self.entry.size = decode_size(&self.field);
                self.field.clear();
                return self.descriptor_complete(root, log);
            }
            Phase::Data => unreachable!("data phase has no field"),
        }
        self.field.clear();
        Ok(Event::Continue)
    }

    fn descriptor_complete(&mut self, root: &Path, log: &dyn Logger) -> Result<Event> {
        log.entry(self.entry.kind.name(), &self.entry.rel_path);
        if self.entry.kind == EntryKind::FileData {
            return self.begin_data(root, log);
        }
        let verdict = checkfile(root, &self.entry, log);
        log.verdict(&self.entry.rel_path, verdict.name());
        self.reset();
        Ok(Event::Reply(verdict))
    }

    /// The control connection's checkfile already created or truncated the
    /// destination; the payload is appended onto it. No verdict is emitted
    /// until the byte count declared in the descriptor has arrived.
    fn begin_data(&mut self, root: &Path, log: &dyn Logger) -> Result<Event> {
        let dest = resolve_dest(root, &self.entry.rel_path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dest)
            .with_context(|| format!("open {} for append", dest.display()))?;
        self.remaining = self.entry.size as usize;
        self.dest = Some((dest, file));
        self.phase = Phase::Data;
        if self.remaining == 0 {
            return self.finish_data(log);
        }
        Ok(Event::Continue)
    }

    fn read_chunk(&mut self, log: &dyn Logger) -> Result<Event> {
        let want = self.remaining.min(MAXDATA);
        let mut buf = [0u8; MAXDATA];
        let n = match self.stream.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Event::Continue),
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Event::Continue),
            Err(e) => return Err(e).context("read payload chunk"),
        };
        if n == 0 {
            bail!(
                "peer closed with {} payload bytes outstanding for {}",
                self.remaining,
                self.entry.rel_path
            );
        }
        match self.dest.as_mut() {
            Some((_, file)) => file.write_all(&buf[..n])?,
            None => bail!("data phase without destination"),
        }
        self.remaining -= n;
        if self.remaining == 0 {
            return self.finish_data(log);
        }
        Ok(Event::Continue)
    }

    fn finish_data(&mut self, log: &dyn Logger) -> Result<Event> {
        let verdict = match self.dest.take() {
            Some((path, file)) => {
                drop(file);
                match apply_mode(&path, self.entry.mode) {
                    Ok(()) => Verdict::Ok,
                    Err(e) => {
                        log.error("chmod", &self.entry.rel_path, &e.to_string());
                        Verdict::Error
                    }
                }
            }
            None => Verdict::Error,
        };
        log.verdict(&self.entry.rel_path, verdict.name());
        self.reset();
        Ok(Event::Reply(verdict))
    }

    /// Write one verdict back to the peer. The reply is two bytes, so a full
    /// send buffer clears almost immediately; spin on WouldBlock.
    pub fn send_verdict(&mut self, verdict: Verdict) -> Result<()> {
        let buf = encode_verdict(verdict);
        let mut off = 0;
        while off < buf.len() {
            match self.stream.write(&buf[off..]) {
                Ok(0) => bail!("peer closed while sending verdict"),
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("send verdict"),
            }
        }
        Ok(())
    }
}

/// Join the relative path onto the served root. The protocol assumes trusted
/// peers, but absolute paths and `..` components are still rejected before
/// anything touches the filesystem.
fn resolve_dest(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty() || rel_path.is_absolute() {
        bail!("invalid destination path: {:?}", rel);
    }
    for comp in rel_path.components() {
        match comp {
            Component::Normal(_) => {}
            _ => bail!("destination path escapes root: {:?}", rel),
        }
    }
    Ok(root.join(rel_path))
}

fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    // Keep setuid/setgid/sticky, drop file-type bits.
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

/// Decide what the client must do for one entry: nothing (`Ok`), stream the
/// file contents (`SendData`), or give up on this entry (`Error`). Mode bits
/// are still applied where safe even on a mismatch.
pub fn checkfile(root: &Path, entry: &Entry, log: &dyn Logger) -> Verdict {
    let dest = match resolve_dest(root, &entry.rel_path) {
        Ok(d) => d,
        Err(e) => {
            log.error("checkfile", &entry.rel_path, &e.to_string());
            return Verdict::Error;
        }
    };
    match entry.kind {
        EntryKind::Directory => check_directory(&dest, entry, log),
        EntryKind::File => check_regular(&dest, entry, log),
        kind => {
            log.error("checkfile", &entry.rel_path, &format!("unexpected kind {:?}", kind));
            Verdict::Error
        }
    }
}

fn check_directory(dest: &Path, entry: &Entry, log: &dyn Logger) -> Verdict {
    match fs::symlink_metadata(dest) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if let Err(e) = fs::create_dir(dest) {
                log.error("mkdir", &entry.rel_path, &e.to_string());
                return Verdict::Error;
            }
            if let Err(e) = apply_mode(dest, entry.mode) {
                log.error("chmod", &entry.rel_path, &e.to_string());
                return Verdict::Error;
            }
            Verdict::Ok
        }
        Err(e) => {
            log.error("lstat", &entry.rel_path, &e.to_string());
            Verdict::Error
        }
        Ok(meta) if meta.is_dir() => match apply_mode(dest, entry.mode) {
            Ok(()) => Verdict::Ok,
            Err(e) => {
                log.error("chmod", &entry.rel_path, &e.to_string());
                Verdict::Error
            }
        },
        Ok(_) => {
            // Exists but is not a directory: type mismatch. Permissions are
            // still applied, the entry itself is abandoned.
            let _ = apply_mode(dest, entry.mode);
            log.error("checkfile", &entry.rel_path, "destination exists and is not a directory");
            Verdict::Error
        }
    }
}

fn check_regular(dest: &Path, entry: &Entry, log: &dyn Logger) -> Verdict {
    let meta = match fs::symlink_metadata(dest) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Create empty so the append pass has something to extend.
            return match File::create(dest) {
                Ok(_) => Verdict::SendData,
                Err(e) => {
                    log.error("create", &entry.rel_path, &e.to_string());
                    Verdict::Error
                }
            };
        }
        Err(e) => {
            log.error("lstat", &entry.rel_path, &e.to_string());
            return Verdict::Error;
        }
        Ok(meta) => meta,
    };
    if !meta.is_file() {
        let _ = apply_mode(dest, entry.mode);
        log.error("checkfile", &entry.rel_path, "destination exists and is not a regular file");
        return Verdict::Error;
    }
    let differs = if meta.len() != u64::from(entry.size) {
        true
    } else {
        let fp = File::open(dest)
            .map_err(anyhow::Error::from)
            .and_then(|mut f| fingerprint_reader(&mut f));
        match fp {
            Ok(fp) => first_mismatch(&fp, &entry.fingerprint).is_some(),
            Err(e) => {
                log.error("fingerprint", &entry.rel_path, &e.to_string());
                return Verdict::Error;
            }
        }
    };
    if differs {
        // Truncate now so the data pass overwrites instead of extending.
        match File::create(dest) {
            Ok(_) => Verdict::SendData,
            Err(e) => {
                log.error("truncate", &entry.rel_path, &e.to_string());
                Verdict::Error
            }
        }
    } else {
        match apply_mode(dest, entry.mode) {
            Ok(()) => Verdict::Ok,
            Err(e) => {
                log.error("chmod", &entry.rel_path, &e.to_string());
                Verdict::Error
            }
        }
    }
}
