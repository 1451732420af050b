//! Wire protocol: fixed-layout entry descriptors and verdict codes
//!
//! An entry descriptor is five consecutive fixed-width fields (kind, path,
//! mode, fingerprint, size), 144 bytes total. There is no framing, no length
//! prefixes, and no versioning; both ends agree out-of-band on the field
//! widths below. All multi-byte integers are big-endian.

use crate::fingerprint::FINGERPRINT_LEN;
use anyhow::{bail, Result};

/// Fixed path buffer width; paths are NUL-padded, not length-prefixed.
pub const MAXPATH: usize = 128;
/// Maximum payload chunk size during a data transfer.
pub const MAXDATA: usize = 256;
/// Default daemon port.
pub const DEFAULT_PORT: u16 = 9040;

pub const KIND_LEN: usize = 2;
pub const MODE_LEN: usize = 4;
pub const SIZE_LEN: usize = 2;
pub const VERDICT_LEN: usize = 2;
/// Total wire size of one entry descriptor.
pub const ENTRY_LEN: usize = KIND_LEN + MAXPATH + MODE_LEN + FINGERPRINT_LEN + SIZE_LEN;

/// What an entry descriptor describes.
///
/// `Skip` marks symbolic links on the client side; it is never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Skip,
    File,
    Directory,
    FileData,
}

impl EntryKind {
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Skip => 0,
            Self::File => 1,
            Self::Directory => 2,
            Self::FileData => 3,
        }
    }

    pub fn from_wire(code: u16) -> Result<Self> {
        match code {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            3 => Ok(Self::FileData),
            _ => bail!("unknown entry kind: {}", code),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::File => "file",
            Self::Directory => "directory",
            Self::FileData => "filedata",
        }
    }
}

/// Server response to one entry descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    SendData,
    Error,
}

impl Verdict {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::SendData => "send-data",
            Self::Error => "error",
        }
    }
}

/// One file or directory to be synchronized.
#[derive(Debug, Clone)]
pub struct Entry {
    pub kind: EntryKind,
    /// Always relative to the synchronization root, never absolute. Reused
    /// verbatim by the server to build the destination path.
    pub rel_path: String,
    pub mode: u32,
    pub fingerprint: [u8; FINGERPRINT_LEN],
    pub size: u16,
}

impl Entry {
    /// Serialize to the fixed 144-byte wire layout.
    pub fn encode(&self) -> Result<[u8; ENTRY_LEN]> {
        if self.kind == EntryKind::Skip {
            bail!("skip entries are never transmitted");
        }
        let path = self.rel_path.as_bytes();
        if path.is_empty() || path.len() > MAXPATH {
            bail!(
                "path length {} outside 1..={} bytes: {}",
                path.len(),
                MAXPATH,
                self.rel_path
            );
        }
        if path.contains(&0) {
            bail!("path contains NUL: {}", self.rel_path);
        }
        let mut buf = [0u8; ENTRY_LEN];
        let mut off = 0;
        buf[off..off + KIND_LEN].copy_from_slice(&self.kind.to_wire().to_be_bytes());
        off += KIND_LEN;
        buf[off..off + path.len()].copy_from_slice(path);
        off += MAXPATH;
        // Permission bits only; lstat's file-type bits stay off the wire.
        buf[off..off + MODE_LEN].copy_from_slice(&(self.mode & 0o7777).to_be_bytes());
        off += MODE_LEN;
        buf[off..off + FINGERPRINT_LEN].copy_from_slice(&self.fingerprint);
        off += FINGERPRINT_LEN;
        buf[off..off + SIZE_LEN].copy_from_slice(&self.size.to_be_bytes());
        Ok(buf)
    }
}

pub fn decode_kind(field: &[u8]) -> Result<EntryKind> {
    EntryKind::from_wire(u16::from_be_bytes([field[0], field[1]]))
}

/// Decode the fixed-width path field: trailing NUL padding is stripped and
/// the remainder must be UTF-8.
pub fn decode_path(field: &[u8]) -> Result<String> {
    let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    if end == 0 {
        bail!("empty path field");
    }
    match std::str::from_utf8(&field[..end]) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => bail!("path field is not UTF-8"),
    }
}

pub fn decode_mode(field: &[u8]) -> u32 {
    u32::from_be_bytes([field[0], field[1], field[2], field[3]])
}

pub fn decode_size(field: &[u8]) -> u16 {
    u16::from_be_bytes([field[0], field[1]])
}

pub fn encode_verdict(v: Verdict) -> [u8; VERDICT_LEN] {
    let code: u16 = match v {
        Verdict::Ok => 0,
        Verdict::SendData => 1,
        Verdict::Error => 2,
    };
    code.to_be_bytes()
}

pub fn decode_verdict(buf: &[u8]) -> Result<Verdict> {
    match u16::from_be_bytes([buf[0], buf[1]]) {
        0 => Ok(Verdict::Ok),
        1 => Ok(Verdict::SendData),
        2 => Ok(Verdict::Error),
        code => bail!("unknown verdict code: {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry {
            kind: EntryKind::File,
            rel_path: "dir/a.txt".to_string(),
            mode: 0o100644,
            fingerprint: [1, 2, 3, 4, 5, 6, 7, 8],
            size: 513,
        }
    }

    #[test]
    fn encode_layout() {
        let buf = sample().encode().unwrap();
        assert_eq!(buf.len(), ENTRY_LEN);
        assert_eq!(ENTRY_LEN, 144);
        assert_eq!(decode_kind(&buf[..KIND_LEN]).unwrap(), EntryKind::File);
        let mut off = KIND_LEN;
        assert_eq!(decode_path(&buf[off..off + MAXPATH]).unwrap(), "dir/a.txt");
        off += MAXPATH;
        assert_eq!(decode_mode(&buf[off..off + MODE_LEN]), 0o644);
        off += MODE_LEN;
        assert_eq!(&buf[off..off + FINGERPRINT_LEN], &[1, 2, 3, 4, 5, 6, 7, 8]);
        off += FINGERPRINT_LEN;
        assert_eq!(decode_size(&buf[off..off + SIZE_LEN]), 513);
    }

    #[test]
    fn mode_keeps_special_bits_drops_file_type() {
        let mut e = sample();
        e.mode = 0o102755; // regular-file type bits plus setgid
        let buf = e.encode().unwrap();
        let off = KIND_LEN + MAXPATH;
        assert_eq!(decode_mode(&buf[off..off + MODE_LEN]), 0o2755);
    }

    #[test]
    fn path_exactly_maxpath_fits() {
        let mut e = sample();
        e.rel_path = "x".repeat(MAXPATH);
        let buf = e.encode().unwrap();
        assert_eq!(
            decode_path(&buf[KIND_LEN..KIND_LEN + MAXPATH]).unwrap(),
            e.rel_path
        );
    }

    #[test]
    fn path_too_long_rejected() {
        let mut e = sample();
        e.rel_path = "x".repeat(MAXPATH + 1);
        assert!(e.encode().is_err());
    }

    #[test]
    fn skip_never_encodes() {
        let mut e = sample();
        e.kind = EntryKind::Skip;
        assert!(e.encode().is_err());
    }

    #[test]
    fn unknown_codes_rejected() {
        assert!(EntryKind::from_wire(9).is_err());
        assert!(decode_verdict(&[0, 7]).is_err());
        assert!(decode_kind(&[0, 0]).is_err()); // Skip is not valid on the wire
    }

    #[test]
    fn verdict_round_trip() {
        for v in [Verdict::Ok, Verdict::SendData, Verdict::Error] {
            assert_eq!(decode_verdict(&encode_verdict(v)).unwrap(), v);
        }
    }

    #[test]
    fn integers_are_big_endian() {
        let buf = sample().encode().unwrap();
        assert_eq!(&buf[..KIND_LEN], &[0, 1]);
        let size_off = ENTRY_LEN - SIZE_LEN;
        assert_eq!(&buf[size_off..], &[2, 1]); // 513
    }
}
