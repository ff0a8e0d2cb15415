//! LZ4 framing of stored values.
//!
//! Every value in the log starts with a flag byte. Values shorter than
//! [`COMPRESSION_THRESHOLD`] are kept as they are; larger ones are LZ4
//! compressed with their size prepended. Incompressible values fall back to
//! the raw form.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

pub const FLAG_RAW: u8 = 0x00;
pub const FLAG_LZ4: u8 = 0x01;

/// Smallest value worth compressing, in bytes.
pub const COMPRESSION_THRESHOLD: usize = 128;

pub(crate) fn encode_value(value: &[u8]) -> Vec<u8> {
    if value.len() >= COMPRESSION_THRESHOLD {
        let compressed = compress_prepend_size(value);
        if compressed.len() < value.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(FLAG_LZ4);
            out.extend_from_slice(&compressed);
            return out;
        }
    }
    let mut out = Vec::with_capacity(1 + value.len());
    out.push(FLAG_RAW);
    out.extend_from_slice(value);
    out
}

/// LZ4 cannot expand a block by more than this factor.
const MAX_EXPANSION: usize = 255;

/// `None` when the flag is unknown or the LZ4 block is malformed.
pub(crate) fn decode_value(stored: &[u8]) -> Option<Vec<u8>> {
    let (&flag, body) = stored.split_first()?;
    match flag {
        FLAG_RAW => Some(body.to_vec()),
        FLAG_LZ4 => {
            // Reject impossible sizes before the decoder allocates for them.
            let size: [u8; 4] = body.get(..4)?.try_into().ok()?;
            if u32::from_le_bytes(size) as usize > body.len() * MAX_EXPANSION {
                return None;
            }
            decompress_size_prepended(body).ok()
        }
        _ => None,
    }
}
