//! Per-file payload transfer on a dedicated connection
//!
//! Payload never shares a socket with the tree walk: each transfer opens its
//! own connection, resends the descriptor with kind=FileData, and streams
//! the contents in MAXDATA-byte chunks. The byte count in the descriptor
//! bounds the payload, so the final short chunk needs no terminator record.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use crate::protocol::{decode_verdict, Entry, EntryKind, Verdict, MAXDATA, VERDICT_LEN};

/// Stream one file's contents to the server and wait for the final verdict.
/// Returns the number of payload bytes sent.
pub fn send_file(host: &str, port: u16, mut entry: Entry, source: &Path) -> Result<u64> {
    entry.kind = EntryKind::FileData;
    let mut stream = TcpStream::connect((host, port))
        .with_context(|| format!("connect {}:{} for transfer", host, port))?;
    stream.write_all(&entry.encode()?)?;

    let mut file =
        File::open(source).with_context(|| format!("open source {}", source.display()))?;
    let mut remaining = entry.size as usize;
    let mut buf = [0u8; MAXDATA];
    while remaining > 0 {
        let want = remaining.min(MAXDATA);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            // The descriptor promised more bytes than the file now has; the
            // server is still counting, so this connection is unrecoverable.
            bail!(
                "{} shrank during transfer ({} bytes short)",
                source.display(),
                remaining
            );
        }
        stream.write_all(&buf[..n])?;
        remaining -= n;
    }

    let mut reply = [0u8; VERDICT_LEN];
    stream
        .read_exact(&mut reply)
        .context("read transfer verdict")?;
    match decode_verdict(&reply)? {
        Verdict::Error => bail!("server rejected transfer of {}", source.display()),
        _ => Ok(entry.size as u64),
    }
}
