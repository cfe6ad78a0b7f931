//! Dynamic value type for stored objects.

use std::cmp::Ordering;

/// A dynamic value.
///
/// This is the shape every stored object and metadata payload takes before
/// serialization. Floats are allowed (application objects routinely carry
/// them) but NaN is rejected at encode time because it has no canonical
/// representation.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// 64-bit float. NaN cannot be encoded.
    Float(f64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of key-value pairs, kept sorted in canonical key order.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Create a map value with keys sorted into canonical order.
    ///
    /// Duplicate keys are kept here and rejected by the encoder, so a
    /// caller that builds maps through this constructor and encodes them
    /// gets the error at the encode site.
    pub fn map(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp_canonical(&b.0));
        Value::Map(pairs)
    }

    /// Compare two values in canonical order.
    ///
    /// Canonical order sorts by type rank first (null, bool, integer,
    /// float, bytes, text, array, map), then naturally within a type.
    /// Byte and text payloads compare length-first, then bytewise, so
    /// sorted keys decode with a cheap streaming check.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => cmp_len_first(a, b),
            (Value::Text(a), Value::Text(b)) => cmp_len_first(a.as_bytes(), b.as_bytes()),
            (Value::Array(a), Value::Array(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => {
                    for (av, bv) in a.iter().zip(b.iter()) {
                        let ord = av.cmp_canonical(bv);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                }
                ord => ord,
            },
            (Value::Map(a), Value::Map(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => {
                    for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                        let key_ord = ak.cmp_canonical(bk);
                        if key_ord != Ordering::Equal {
                            return key_ord;
                        }
                        let val_ord = av.cmp_canonical(bv);
                        if val_ord != Ordering::Equal {
                            return val_ord;
                        }
                    }
                    Ordering::Equal
                }
                ord => ord,
            },
            // Unreachable: type ranks matched above
            _ => Ordering::Equal,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Float(_) => 3,
            Value::Bytes(_) => 4,
            Value::Text(_) => 5,
            Value::Array(_) => 6,
            Value::Map(_) => 7,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float, if it is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a text key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

fn cmp_len_first(a: &[u8], b: &[u8]) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            // Bitwise equality keeps Eq lawful and distinguishes -0.0 from 0.0
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_are_sorted() {
        let map = Value::map(vec![
            (Value::from("z"), Value::Integer(1)),
            (Value::from("a"), Value::Integer(2)),
            (Value::from("m"), Value::Integer(3)),
        ]);

        let pairs = map.as_map().unwrap();
        assert_eq!(pairs[0].0, Value::from("a"));
        assert_eq!(pairs[1].0, Value::from("m"));
        assert_eq!(pairs[2].0, Value::from("z"));
    }

    #[test]
    fn text_keys_sort_length_first() {
        let map = Value::map(vec![
            (Value::from("abc"), Value::Integer(1)),
            (Value::from("a"), Value::Integer(2)),
            (Value::from("zb"), Value::Integer(3)),
        ]);

        let pairs = map.as_map().unwrap();
        assert_eq!(pairs[0].0, Value::from("a"));
        assert_eq!(pairs[1].0, Value::from("zb"));
        assert_eq!(pairs[2].0, Value::from("abc"));
    }

    #[test]
    fn mixed_type_keys_sort_by_rank() {
        let map = Value::map(vec![
            (Value::from("a"), Value::Null),
            (Value::Integer(7), Value::Null),
            (Value::Null, Value::Null),
        ]);

        let pairs = map.as_map().unwrap();
        assert_eq!(pairs[0].0, Value::Null);
        assert_eq!(pairs[1].0, Value::Integer(7));
        assert_eq!(pairs[2].0, Value::from("a"));
    }

    #[test]
    fn integer_ordering_is_numeric() {
        let mut values = vec![
            Value::Integer(10),
            Value::Integer(-3),
            Value::Integer(0),
            Value::Integer(-100),
        ];
        values.sort_by(Value::cmp_canonical);

        assert_eq!(values[0], Value::Integer(-100));
        assert_eq!(values[1], Value::Integer(-3));
        assert_eq!(values[2], Value::Integer(0));
        assert_eq!(values[3], Value::Integer(10));
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn value_accessors() {
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(true).is_null());

        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_bool(), None);

        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));

        assert_eq!(Value::from("hello").as_text(), Some("hello"));
        assert_eq!(
            Value::Bytes(vec![1, 2, 3]).as_bytes(),
            Some(&[1, 2, 3][..])
        );
    }

    #[test]
    fn map_get() {
        let map = Value::map(vec![
            (Value::from("name"), Value::from("karst")),
            (Value::from("age"), Value::Integer(30)),
        ]);

        assert_eq!(map.get("name"), Some(&Value::from("karst")));
        assert_eq!(map.get("age"), Some(&Value::Integer(30)));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i64), Value::Integer(42));
        assert_eq!(Value::from(42i32), Value::Integer(42));
        assert_eq!(Value::from(42u32), Value::Integer(42));
        assert_eq!(Value::from(1.25f64), Value::Float(1.25));
        assert_eq!(Value::from("hi"), Value::Text("hi".to_string()));
        assert_eq!(Value::from(vec![1u8, 2, 3]), Value::Bytes(vec![1, 2, 3]));
        assert_eq!(Value::from(()), Value::Null);
    }
}
