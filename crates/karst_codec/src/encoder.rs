//! Canonical value encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Tag byte for null.
pub(crate) const TAG_NULL: u8 = 0x00;
/// Tag byte for boolean false.
pub(crate) const TAG_FALSE: u8 = 0x01;
/// Tag byte for boolean true.
pub(crate) const TAG_TRUE: u8 = 0x02;
/// Tag class for integers (low two bits carry the width code).
pub(crate) const TAG_INTEGER: u8 = 0x10;
/// Tag byte for floats.
pub(crate) const TAG_FLOAT: u8 = 0x20;
/// Tag class for byte strings.
pub(crate) const TAG_BYTES: u8 = 0x30;
/// Tag class for text strings.
pub(crate) const TAG_TEXT: u8 = 0x40;
/// Tag class for arrays.
pub(crate) const TAG_ARRAY: u8 = 0x50;
/// Tag class for maps.
pub(crate) const TAG_MAP: u8 = 0x60;

/// Encode a value to canonical bytes.
///
/// The encoding is deterministic: equal values always produce identical
/// bytes. Widths are minimal, map keys are emitted in canonical order,
/// NaN is rejected and negative zero is normalized to zero.
///
/// # Errors
///
/// Returns an error if the value contains a NaN float or a map with
/// duplicate keys.
pub fn to_canonical_bytes(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = ValueEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// A canonical value encoder.
///
/// Values are framed with a tag byte whose high nibble selects the type
/// and whose low two bits select the width of the following
/// little-endian integer (1, 2, 4 or 8 bytes). Integers are
/// zigzag-encoded; byte, text, array and map tags are followed by their
/// length, then their payload.
pub struct ValueEncoder {
    buffer: Vec<u8>,
}

impl ValueEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encode a value, appending it to the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error on NaN floats and duplicate map keys.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => {
                self.buffer.push(TAG_NULL);
                Ok(())
            }
            Value::Bool(b) => {
                self.buffer.push(if *b { TAG_TRUE } else { TAG_FALSE });
                Ok(())
            }
            Value::Integer(n) => {
                self.write_tagged(TAG_INTEGER, zigzag(*n));
                Ok(())
            }
            Value::Float(f) => self.encode_float(*f),
            Value::Bytes(b) => {
                self.write_tagged(TAG_BYTES, b.len() as u64);
                self.buffer.extend_from_slice(b);
                Ok(())
            }
            Value::Text(s) => {
                self.write_tagged(TAG_TEXT, s.len() as u64);
                self.buffer.extend_from_slice(s.as_bytes());
                Ok(())
            }
            Value::Array(items) => {
                self.write_tagged(TAG_ARRAY, items.len() as u64);
                for item in items {
                    self.encode(item)?;
                }
                Ok(())
            }
            Value::Map(pairs) => self.encode_map(pairs),
        }
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn encode_float(&mut self, f: f64) -> CodecResult<()> {
        if f.is_nan() {
            return Err(CodecError::NanForbidden);
        }
        // Negative zero normalizes to zero so equal numbers encode equally
        let f = if f == 0.0 { 0.0 } else { f };
        self.buffer.push(TAG_FLOAT);
        self.buffer.extend_from_slice(&f.to_bits().to_le_bytes());
        Ok(())
    }

    fn encode_map(&mut self, pairs: &[(Value, Value)]) -> CodecResult<()> {
        // Keys are sorted here rather than trusting construction order,
        // so hand-built Value::Map values still encode canonically.
        let mut sorted: Vec<&(Value, Value)> = pairs.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp_canonical(&b.0));

        for window in sorted.windows(2) {
            if window[0].0.cmp_canonical(&window[1].0) == std::cmp::Ordering::Equal {
                return Err(CodecError::duplicate_map_key(format!("{:?}", window[0].0)));
            }
        }

        self.write_tagged(TAG_MAP, sorted.len() as u64);
        for (key, value) in sorted {
            self.encode(key)?;
            self.encode(value)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_tagged(&mut self, tag_class: u8, value: u64) {
        if u8::try_from(value).is_ok() {
            self.buffer.push(tag_class);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(tag_class | 1);
            self.buffer.extend_from_slice(&(value as u16).to_le_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(tag_class | 2);
            self.buffer.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            self.buffer.push(tag_class | 3);
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    }
}

impl Default for ValueEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a signed integer onto the unsigned line, small magnitudes first.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn unzigzag(z: u64) -> i64 {
    ((z >> 1) as i64) ^ -((z & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_null_and_bools() {
        assert_eq!(to_canonical_bytes(&Value::Null).unwrap(), vec![0x00]);
        assert_eq!(to_canonical_bytes(&Value::Bool(false)).unwrap(), vec![0x01]);
        assert_eq!(to_canonical_bytes(&Value::Bool(true)).unwrap(), vec![0x02]);
    }

    #[test]
    fn encode_small_integers() {
        // zigzag: 0 -> 0, -1 -> 1, 1 -> 2
        assert_eq!(
            to_canonical_bytes(&Value::Integer(0)).unwrap(),
            vec![0x10, 0x00]
        );
        assert_eq!(
            to_canonical_bytes(&Value::Integer(-1)).unwrap(),
            vec![0x10, 0x01]
        );
        assert_eq!(
            to_canonical_bytes(&Value::Integer(1)).unwrap(),
            vec![0x10, 0x02]
        );
    }

    #[test]
    fn encode_wider_integers() {
        // zigzag(255) = 510 needs two bytes
        assert_eq!(
            to_canonical_bytes(&Value::Integer(255)).unwrap(),
            vec![0x11, 0xfe, 0x01]
        );
        // zigzag(65536) = 131072 needs four bytes
        assert_eq!(
            to_canonical_bytes(&Value::Integer(65536)).unwrap(),
            vec![0x12, 0x00, 0x00, 0x02, 0x00]
        );
    }

    #[test]
    fn encode_float() {
        let bytes = to_canonical_bytes(&Value::Float(1.5)).unwrap();
        assert_eq!(bytes[0], 0x20);
        assert_eq!(bytes.len(), 9);
        assert_eq!(
            f64::from_bits(u64::from_le_bytes(bytes[1..9].try_into().unwrap())),
            1.5
        );
    }

    #[test]
    fn negative_zero_normalizes() {
        let pos = to_canonical_bytes(&Value::Float(0.0)).unwrap();
        let neg = to_canonical_bytes(&Value::Float(-0.0)).unwrap();
        assert_eq!(pos, neg);
    }

    #[test]
    fn nan_is_rejected() {
        assert_eq!(
            to_canonical_bytes(&Value::Float(f64::NAN)),
            Err(CodecError::NanForbidden)
        );
    }

    #[test]
    fn encode_bytes_and_text() {
        assert_eq!(
            to_canonical_bytes(&Value::Bytes(vec![])).unwrap(),
            vec![0x30, 0x00]
        );
        assert_eq!(
            to_canonical_bytes(&Value::Bytes(vec![9, 8])).unwrap(),
            vec![0x30, 0x02, 9, 8]
        );
        assert_eq!(
            to_canonical_bytes(&Value::from("ab")).unwrap(),
            vec![0x40, 0x02, b'a', b'b']
        );
    }

    #[test]
    fn encode_array() {
        assert_eq!(
            to_canonical_bytes(&Value::Array(vec![])).unwrap(),
            vec![0x50, 0x00]
        );
        assert_eq!(
            to_canonical_bytes(&Value::Array(vec![Value::Integer(1), Value::Null])).unwrap(),
            vec![0x50, 0x02, 0x10, 0x02, 0x00]
        );
    }

    #[test]
    fn map_encodes_sorted_regardless_of_input_order() {
        let forward = Value::Map(vec![
            (Value::from("a"), Value::Integer(1)),
            (Value::from("b"), Value::Integer(2)),
        ]);
        let backward = Value::Map(vec![
            (Value::from("b"), Value::Integer(2)),
            (Value::from("a"), Value::Integer(1)),
        ]);

        assert_eq!(
            to_canonical_bytes(&forward).unwrap(),
            to_canonical_bytes(&backward).unwrap()
        );
    }

    #[test]
    fn duplicate_map_keys_rejected() {
        let map = Value::Map(vec![
            (Value::from("k"), Value::Integer(1)),
            (Value::from("k"), Value::Integer(2)),
        ]);
        assert!(matches!(
            to_canonical_bytes(&map),
            Err(CodecError::DuplicateMapKey { .. })
        ));
    }

    #[test]
    fn zigzag_roundtrip_extremes() {
        for n in [0, 1, -1, i64::MAX, i64::MIN, 42, -42] {
            assert_eq!(unzigzag(zigzag(n)), n);
        }
    }
}
