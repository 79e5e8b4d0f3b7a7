//! Content-identity helpers.
//!
//! Every catalog entry is keyed by a "sha8": the first eight lowercase hex
//! characters of the SHA-256 of the asset's identity (normally the paired
//! audio track). Asset filenames carry the same sha8 as a suffix, e.g.
//! `run42_seg003_1f2e3d4c.mp4`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Length of the catalog key.
pub const SHA8_LEN: usize = 8;

/// Stream a file through SHA-256 and return the lowercase hex digest
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Derive the catalog key from a longer identity hash.
///
/// Returns `None` unless the input starts with at least eight hex characters.
pub fn sha8(identity: &str) -> Option<String> {
    let lowered = identity.trim().to_ascii_lowercase();
    let head = lowered.get(..SHA8_LEN)?;
    is_lower_hex(head).then(|| head.to_string())
}

/// Extract the sha8 suffix from a file name (`<anything>_<sha8>.<ext>` or `-<sha8>`)
pub fn sha8_suffix(file_name: &str) -> Option<&str> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    if stem.len() <= SHA8_LEN {
        return None;
    }
    let split = stem.len() - SHA8_LEN;
    if !stem.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = stem.split_at(split);
    let separated = head.ends_with('_') || head.ends_with('-');
    (separated && is_lower_hex(tail)).then_some(tail)
}

/// Catalog key for a file found on disk: its sha8 suffix, else its stem
pub fn key_for_file_name(file_name: &str) -> String {
    match sha8_suffix(file_name) {
        Some(suffix) => suffix.to_string(),
        None => Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name)
            .to_string(),
    }
}
