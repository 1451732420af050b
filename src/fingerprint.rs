//! Rolling XOR fingerprint used as a cheap content-difference signal

use anyhow::Result;
use std::io::Read;

/// Fingerprint width in bytes; both ends must agree on this out-of-band.
pub const FINGERPRINT_LEN: usize = 8;

/// Streaming fingerprint builder.
///
/// Byte `i` of the stream is XOR-ed into `acc[i % FINGERPRINT_LEN]`, with `i`
/// counting from the start of the stream (never reset per block). The result
/// is insensitive to many permutations and collides easily; it is only a fast
/// pre-filter, always paired with an exact size comparison.
pub struct XorFingerprint {
    acc: [u8; FINGERPRINT_LEN],
    pos: usize,
}

impl XorFingerprint {
    pub fn new() -> Self {
        Self {
            acc: [0u8; FINGERPRINT_LEN],
            pos: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.acc[self.pos] ^= b;
            self.pos = (self.pos + 1) % FINGERPRINT_LEN;
        }
    }

    pub fn finish(self) -> [u8; FINGERPRINT_LEN] {
        self.acc
    }
}

impl Default for XorFingerprint {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot fingerprint of an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> [u8; FINGERPRINT_LEN] {
    let mut fp = XorFingerprint::new();
    fp.update(data);
    fp.finish()
}

/// Fingerprint an entire reader (e.g. an open file) to EOF.
pub fn fingerprint_reader<R: Read>(reader: &mut R) -> Result<[u8; FINGERPRINT_LEN]> {
    let mut fp = XorFingerprint::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        fp.update(&buf[..n]);
    }
    Ok(fp.finish())
}

/// Byte-wise comparison. Returns the first differing index, or `None` when
/// the fingerprints match. Callers use `is_some()` as "content differs"; the
/// index itself is only for diagnostics.
pub fn first_mismatch(a: &[u8; FINGERPRINT_LEN], b: &[u8; FINGERPRINT_LEN]) -> Option<usize> {
    (0..FINGERPRINT_LEN).find(|&i| a[i] != b[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let data = b"Hello, World!";
        assert_eq!(fingerprint_bytes(data), fingerprint_bytes(data));
    }

    #[test]
    fn streaming_matches_oneshot() {
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let mut fp = XorFingerprint::new();
        // Split at a non-multiple of the accumulator width
        fp.update(&data[..13]);
        fp.update(&data[13..]);
        assert_eq!(fp.finish(), fingerprint_bytes(&data));
    }

    #[test]
    fn reader_matches_oneshot() {
        let data = vec![0xA5u8; 70_000];
        let mut cursor = std::io::Cursor::new(&data);
        assert_eq!(fingerprint_reader(&mut cursor).unwrap(), fingerprint_bytes(&data));
    }

    #[test]
    fn mismatch_index() {
        let a = fingerprint_bytes(b"aaaaaaaa");
        let mut b = a;
        b[3] ^= 0xFF;
        assert_eq!(first_mismatch(&a, &b), Some(3));
        assert_eq!(first_mismatch(&a, &a), None);
    }

    #[test]
    fn permutation_collision_is_expected() {
        // Swapping bytes that land in the same accumulator slot collides.
        let a = fingerprint_bytes(b"abcdefghXY");
        let b = fingerprint_bytes(b"XbcdefghaY");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_stream_is_all_zero() {
        assert_eq!(fingerprint_bytes(b""), [0u8; FINGERPRINT_LEN]);
    }
}
