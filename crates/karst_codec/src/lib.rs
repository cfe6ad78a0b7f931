//! # Karst Codec
//!
//! Canonical value encoding for karstdb.
//!
//! Stored objects and metadata are dynamic [`Value`]s serialized with a
//! deterministic, tag-framed binary encoding: equal values always encode
//! to identical bytes, so encoded payloads are safe to compare, hash and
//! index.
//!
//! ## Canonical rules
//!
//! - Integers and lengths use the minimal width (1, 2, 4 or 8 bytes)
//! - Map keys are emitted in canonical order, duplicates rejected
//! - NaN is rejected; negative zero normalizes to zero
//! - Text must be UTF-8
//!
//! ## Usage
//!
//! ```
//! use karst_codec::{from_bytes, to_canonical_bytes, Value};
//!
//! let value = Value::map(vec![
//!     (Value::from("title"), Value::from("caves")),
//!     (Value::from("depth"), Value::Integer(312)),
//! ]);
//!
//! let bytes = to_canonical_bytes(&value).unwrap();
//! assert_eq!(from_bytes(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::{from_bytes, ValueDecoder};
pub use encoder::{to_canonical_bytes, ValueEncoder};
pub use error::{CodecError, CodecResult};
pub use value::Value;

/// Trait for types that can be encoded to canonical bytes.
pub trait Encode {
    /// Encode this value to canonical bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from canonical bytes.
pub trait Decode: Sized {
    /// Decode this value from canonical bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_bytes(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_bytes(bytes)
    }
}
