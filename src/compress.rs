//! Snappy codec shim.
//!
//! The storage layer treats compression as a black box: the table layer
//! decides what gets compressed, and compaction only ever needs the decode
//! side so move notifications can hand listeners usable bytes.

use snap::raw::{Decoder, Encoder};

use crate::error::Result;

/// Compresses a payload. Used by callers that store compressed entries.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(Encoder::new().compress_vec(data)?)
}

/// Decompresses a stored payload into a fresh buffer.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(Decoder::new().decompress_vec(data)?)
}
