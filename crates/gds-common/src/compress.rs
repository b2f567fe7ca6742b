//! Transparent string compression
//!
//! Long string values are stored zlib-compressed. Compression only kicks in
//! above a configurable threshold and only when it actually shrinks the
//! payload.

use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

const COMPRESSION_LEVEL: u32 = 6;

/// Default size above which strings are compressed
pub const DEFAULT_THRESHOLD: usize = 4096;

/// Compress `s` if it is longer than `threshold` and the result is smaller
pub fn compress_string(s: &str, threshold: usize) -> Result<Option<Vec<u8>>> {
    if s.len() <= threshold {
        return Ok(None);
    }
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(s.len() / 2),
        Compression::new(COMPRESSION_LEVEL),
    );
    encoder
        .write_all(s.as_bytes())
        .map_err(|e| Error::Compression(e.to_string()))?;
    let out = encoder
        .finish()
        .map_err(|e| Error::Compression(e.to_string()))?;
    if out.len() >= s.len() {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Reverse [`compress_string`]
pub fn decompress_string(data: &[u8]) -> Result<String> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| Error::Compression(e.to_string()))?;
    Ok(out)
}
