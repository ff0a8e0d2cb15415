//! Run-length coding of palette index streams.
//!
//! A run is 4 bytes on the wire: `length: u16 LE` then `index: u16 LE`.
//! Runs longer than `u16::MAX` are split.

/// Bytes per encoded run.
pub const RUN_BYTES: usize = 4;

/// Errors raised while expanding runs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RleError {
    /// The runs expand to a different element count than expected.
    #[error("run lengths sum to {actual}, expected {expected}")]
    LengthMismatch {
        /// Required element count.
        expected: usize,
        /// Element count the runs describe.
        actual: usize,
    },
    /// The byte stream is not a whole number of runs.
    #[error("run data length {0} is not a multiple of {RUN_BYTES}")]
    RaggedInput(usize),
    /// A run has length zero.
    #[error("zero-length run at position {0}")]
    EmptyRun(usize),
}

/// Append the run encoding of `indices` to `out`. Returns the run count.
pub fn encode_into(indices: &[u16], out: &mut Vec<u8>) -> usize {
    let mut runs = 0;
    for group in indices.chunk_by(|a, b| a == b) {
        let index = group[0];
        let mut remaining = group.len();
        while remaining > 0 {
            let len = remaining.min(u16::MAX as usize);
            out.extend_from_slice(&(len as u16).to_le_bytes());
            out.extend_from_slice(&index.to_le_bytes());
            remaining -= len;
            runs += 1;
        }
    }
    runs
}

/// Expand runs from `data` into `out`, which must be filled exactly.
pub fn decode_into(data: &[u8], out: &mut [u16]) -> Result<(), RleError> {
    if data.len() % RUN_BYTES != 0 {
        return Err(RleError::RaggedInput(data.len()));
    }

    let mut cursor = 0;
    for (run, bytes) in data.chunks_exact(RUN_BYTES).enumerate() {
        let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let index = u16::from_le_bytes([bytes[2], bytes[3]]);
        if len == 0 {
            return Err(RleError::EmptyRun(run));
        }
        let end = cursor + len;
        if end > out.len() {
            let total = data
                .chunks_exact(RUN_BYTES)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
                .sum();
            return Err(RleError::LengthMismatch {
                expected: out.len(),
                actual: total,
            });
        }
        out[cursor..end].fill(index);
        cursor = end;
    }

    if cursor != out.len() {
        return Err(RleError::LengthMismatch {
            expected: out.len(),
            actual: cursor,
        });
    }
    Ok(())
}
