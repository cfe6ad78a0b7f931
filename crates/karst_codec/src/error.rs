//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// NaN floats have no canonical representation.
    #[error("NaN floats cannot be encoded")]
    NanForbidden,

    /// A map contains the same key twice.
    #[error("duplicate map key: {key}")]
    DuplicateMapKey {
        /// Display form of the offending key.
        key: String,
    },

    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Input continued past the end of the encoded value.
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },

    /// The input is valid in shape but not in canonical form.
    #[error("non-canonical encoding: {message}")]
    NonCanonical {
        /// Description of the canonicality violation.
        message: String,
    },

    /// The input starts with a tag byte this format does not define.
    #[error("unknown tag byte 0x{tag:02x}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// Text payload is not valid UTF-8.
    #[error("invalid UTF-8 in text value")]
    InvalidUtf8,

    /// A declared length exceeds the decoder's safety limit.
    #[error("declared size {claimed} exceeds limit {max_allowed}")]
    SizeLimitExceeded {
        /// Length claimed by the input.
        claimed: u64,
        /// Maximum the decoder accepts.
        max_allowed: u64,
    },

    /// Containers are nested deeper than the decoder allows.
    #[error("nesting depth exceeds limit {max_allowed}")]
    DepthLimitExceeded {
        /// Maximum nesting depth the decoder accepts.
        max_allowed: usize,
    },
}

impl CodecError {
    /// Create a non-canonical encoding error.
    pub fn non_canonical(message: impl Into<String>) -> Self {
        Self::NonCanonical {
            message: message.into(),
        }
    }

    /// Create a duplicate map key error.
    pub fn duplicate_map_key(key: impl Into<String>) -> Self {
        Self::DuplicateMapKey { key: key.into() }
    }
}
