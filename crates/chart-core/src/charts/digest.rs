//! SHA-256 digests of cached archives and parsing of `.sha256` sidecars.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const BUF_SIZE: usize = 64 * 1024;
const HEX_LEN: usize = 64;

/// Stream `path` through SHA-256 and return the lower-case hex digest.
pub fn digest_of(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Exact comparison of the file digest against `expected_hex`.
///
/// Case-sensitive: `expected_hex` must already be lower-case.
pub fn verify(path: &Path, expected_hex: &str) -> io::Result<bool> {
    Ok(digest_of(path)? == expected_hex)
}

/// Expected digest from a checksum sidecar body.
///
/// The first whitespace-delimited token of the first line is the digest; any
/// trailing tokens (usually the file name) are ignored. Returns `None` unless
/// the token is exactly 64 hex digits.
pub fn parse_sidecar(text: &str) -> Option<String> {
    let token = text.lines().next()?.split_whitespace().next()?;
    if token.len() != HEX_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(token.to_ascii_lowercase())
}
