//! Incremental MD5 over a file's content.

use md5::Context;

/// Running digest fed with bytes in the order they are written or read.
///
/// Hashing the reassembled content in one go yields the same value as
/// feeding it piecewise, whatever the piece boundaries were.
pub struct ChecksumAccumulator {
    context: Context,
    consumed: u64,
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self {
            context: Context::new(),
            consumed: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.context.consume(bytes);
        self.consumed += bytes.len() as u64;
    }

    /// Total number of bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Lowercase hex digest of everything fed.
    pub fn finalize(self) -> String {
        format!("{:x}", self.context.compute())
    }
}

/// One-shot digest, equal to feeding `bytes` through an accumulator.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}
