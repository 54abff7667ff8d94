//! Size-gated compression for values kept in text-only flat storage.
//!
//! Values below the threshold are stored as their direct JSON text. Larger
//! values are LZ4 block-compressed (the match dictionary starts empty on
//! every call) and carried as base64 text so both forms share one slot:
//!
//! ```text
//!   value ──serde_json──► text ──len < threshold──► stored as-is
//!                           │
//!                           └──len ≥ threshold──► lz4 ──► base64 ──► stored
//! ```
//!
//! Nothing in the stored text says which form it is. Readers try a direct
//! JSON parse first, then decompression followed by a parse; a value that
//! survives neither is reported as corrupted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Serialized length (in bytes) above which values are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Corrupted value: {0}")]
    Corrupted(String),
}

/// Compress text into base64-wrapped LZ4.
///
/// Exact inverse of [`decompress`] for every input, including the empty
/// string. Incompressible input grows by roughly a third.
pub fn compress(text: &str) -> String {
    STANDARD.encode(lz4_flex::compress_prepend_size(text.as_bytes()))
}

/// Reverse [`compress`].
pub fn decompress(encoded: &str) -> Result<String, CodecError> {
    let packed = STANDARD
        .decode(encoded)
        .map_err(|e| CodecError::Corrupted(format!("base64: {e}")))?;
    let raw = lz4_flex::decompress_size_prepended(&packed)
        .map_err(|e| CodecError::Corrupted(format!("lz4: {e}")))?;
    String::from_utf8(raw).map_err(|e| CodecError::Corrupted(format!("utf-8: {e}")))
}

/// Typed encode/decode with a compression threshold.
#[derive(Debug, Clone, Copy)]
pub struct ValueCodec {
    threshold: usize,
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl ValueCodec {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Serialize `value`, compressing when the JSON text reaches the threshold.
    ///
    /// If compression would not shrink the text the direct form is kept.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CodecError> {
        let json =
            serde_json::to_string(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
        if json.len() < self.threshold {
            return Ok(json);
        }
        let packed = compress(&json);
        if packed.len() < json.len() {
            Ok(packed)
        } else {
            Ok(json)
        }
    }

    /// Decode a stored value: direct parse first, then decompress and parse.
    pub fn decode<T: DeserializeOwned>(&self, stored: &str) -> Result<T, CodecError> {
        let direct_err = match serde_json::from_str(stored) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let text = decompress(stored).map_err(|e| {
            CodecError::Corrupted(format!("not JSON ({direct_err}) and not compressed ({e})"))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| CodecError::Corrupted(format!("decompressed value is not valid: {e}")))
    }

    /// Decode, degrading to `default` on corruption.
    ///
    /// `key` only labels the log line.
    pub fn decode_or<T: DeserializeOwned>(&self, key: &str, stored: &str, default: T) -> T {
        match self.decode(stored) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Discarding corrupted value at '{key}': {e}");
                default
            }
        }
    }
}
