//! Canonical value decoder.

use crate::encoder::{
    unzigzag, TAG_ARRAY, TAG_BYTES, TAG_FALSE, TAG_FLOAT, TAG_INTEGER, TAG_MAP, TAG_NULL,
    TAG_TEXT, TAG_TRUE,
};
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Maximum element count accepted for arrays and maps.
///
/// Guards allocation against hostile length prefixes.
const MAX_CONTAINER_ELEMENTS: u64 = 4 * 1024 * 1024;

/// Maximum byte/text payload length accepted.
const MAX_PAYLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// Maximum container nesting depth accepted.
///
/// The decoder recurses per nesting level; deep inputs must not be able
/// to exhaust the stack.
const MAX_DEPTH: usize = 128;

/// Decode a single value from canonical bytes.
///
/// # Errors
///
/// Returns an error if the input is truncated, malformed, non-canonical,
/// or continues past the end of the value.
pub fn from_bytes(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = ValueDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A canonical value decoder.
///
/// Rejects everything [`crate::ValueEncoder`] would not produce:
/// oversized widths, unsorted or duplicate map keys, NaN and negative
/// zero floats, and unknown tags.
pub struct ValueDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ValueDecoder<'a> {
    /// Create a new decoder over the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        self.decode_at(0)
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get the remaining unconsumed bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn decode_at(&mut self, depth: usize) -> CodecResult<Value> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthLimitExceeded {
                max_allowed: MAX_DEPTH,
            });
        }

        let tag = self.read_byte()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FLOAT => self.decode_float(),
            _ => {
                let class = tag & 0xf0;
                let width = tag & 0x03;
                // Bits 2-3 of a width-tagged byte are never set
                if tag & 0x0c != 0 {
                    return Err(CodecError::UnknownTag { tag });
                }
                match class {
                    TAG_INTEGER => {
                        let z = self.read_uint(width)?;
                        Ok(Value::Integer(unzigzag(z)))
                    }
                    TAG_BYTES => {
                        let len = self.read_length(width, MAX_PAYLOAD_BYTES)?;
                        Ok(Value::Bytes(self.read_bytes(len)?.to_vec()))
                    }
                    TAG_TEXT => {
                        let len = self.read_length(width, MAX_PAYLOAD_BYTES)?;
                        let raw = self.read_bytes(len)?;
                        let text =
                            std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                        Ok(Value::Text(text.to_string()))
                    }
                    TAG_ARRAY => {
                        let len = self.read_length(width, MAX_CONTAINER_ELEMENTS)?;
                        let mut items = Vec::with_capacity(len.min(1024));
                        for _ in 0..len {
                            items.push(self.decode_at(depth + 1)?);
                        }
                        Ok(Value::Array(items))
                    }
                    TAG_MAP => {
                        let len = self.read_length(width, MAX_CONTAINER_ELEMENTS)?;
                        self.decode_map_entries(len, depth)
                    }
                    _ => Err(CodecError::UnknownTag { tag }),
                }
            }
        }
    }

    fn decode_map_entries(&mut self, len: usize, depth: usize) -> CodecResult<Value> {
        let mut pairs = Vec::with_capacity(len.min(1024));
        let mut prev_key: Option<Value> = None;

        for _ in 0..len {
            let key = self.decode_at(depth + 1)?;
            if let Some(ref prev) = prev_key {
                match prev.cmp_canonical(&key) {
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => {
                        return Err(CodecError::duplicate_map_key(format!("{prev:?}")));
                    }
                    std::cmp::Ordering::Greater => {
                        return Err(CodecError::non_canonical(
                            "map keys not in canonical order",
                        ));
                    }
                }
            }
            let value = self.decode_at(depth + 1)?;
            prev_key = Some(key.clone());
            pairs.push((key, value));
        }

        Ok(Value::Map(pairs))
    }

    fn decode_float(&mut self) -> CodecResult<Value> {
        let raw = self.read_bytes(8)?;
        let bits = u64::from_le_bytes(raw.try_into().map_err(|_| CodecError::UnexpectedEof)?);
        let f = f64::from_bits(bits);
        if f.is_nan() {
            return Err(CodecError::NanForbidden);
        }
        if bits == (-0.0f64).to_bits() {
            return Err(CodecError::non_canonical("negative zero float"));
        }
        Ok(Value::Float(f))
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        if self.pos >= self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a width-coded unsigned integer, enforcing minimal width.
    fn read_uint(&mut self, width: u8) -> CodecResult<u64> {
        match width {
            0 => Ok(u64::from(self.read_byte()?)),
            1 => {
                let raw = self.read_bytes(2)?;
                let v = u16::from_le_bytes([raw[0], raw[1]]);
                if u8::try_from(v).is_ok() {
                    return Err(CodecError::non_canonical("width not minimal"));
                }
                Ok(u64::from(v))
            }
            2 => {
                let raw = self.read_bytes(4)?;
                let v = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if u16::try_from(v).is_ok() {
                    return Err(CodecError::non_canonical("width not minimal"));
                }
                Ok(u64::from(v))
            }
            3 => {
                let raw = self.read_bytes(8)?;
                let v = u64::from_le_bytes(
                    raw.try_into().map_err(|_| CodecError::UnexpectedEof)?,
                );
                if u32::try_from(v).is_ok() {
                    return Err(CodecError::non_canonical("width not minimal"));
                }
                Ok(v)
            }
            _ => unreachable!("width codes are two bits"),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_length(&mut self, width: u8, max: u64) -> CodecResult<usize> {
        let len = self.read_uint(width)?;
        if len > max {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: max,
            });
        }
        Ok(len as usize)
    }
}
