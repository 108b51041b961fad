//! MessagePack value model.
//!
//! A [`Value`] is the decoded form of one self-describing MessagePack
//! item. Integers live in the signed 64-bit domain: the decoder folds the
//! unsigned wire forms back into `i64`.
//!
//! Maps are ordered pair lists. Two maps are equal when they hold the same
//! entries in any order; map keys are identified bit for bit, so `0.0` and
//! `-0.0` are distinct keys and a NaN key matches the same NaN.

use core::cmp::Ordering;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// A decoded MessagePack value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    /// Key/value pairs. Keys are unique after decoding; a repeated key on
    /// the wire overwrites the earlier entry.
    Map(Vec<(Value, Value)>),
    /// Application-defined extension: signed type tag plus opaque payload.
    Ext(i8, Vec<u8>),
}

impl Value {
    /// Builds a map value, overwriting earlier entries on key collision.
    pub fn map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        Value::Map(dedup_entries(entries.into_iter().collect()))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer value as `u32`, if it fits.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|n| u32::try_from(n).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(f) => Some(*f as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a map entry by key.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Ext(..) => "ext",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => maps_equal(a, b),
            (Value::Ext(ta, a), Value::Ext(tb, b)) => ta == tb && a == b,
            _ => false,
        }
    }
}

/// Order-insensitive entry comparison.
fn maps_equal(a: &[(Value, Value)], b: &[(Value, Value)]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let a = sorted_entries(a);
    let b = sorted_entries(b);
    a.iter().zip(b.iter()).all(|(x, y)| x.0 == y.0 && x.1 == y.1)
}

fn sorted_entries(entries: &[(Value, Value)]) -> Vec<&(Value, Value)> {
    let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
    sorted.sort_by(|x, y| key_cmp(&x.0, &y.0).then_with(|| key_cmp(&x.1, &y.1)));
    sorted
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Nil => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 2,
        Value::Float32(_) => 3,
        Value::Float64(_) => 4,
        Value::String(_) => 5,
        Value::Binary(_) => 6,
        Value::Array(_) => 7,
        Value::Map(_) => 8,
        Value::Ext(..) => 9,
    }
}

/// Total order used to identify map keys. Floats compare by bit pattern.
fn key_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Float32(x), Value::Float32(y)) => x.to_bits().cmp(&y.to_bits()),
        (Value::Float64(x), Value::Float64(y)) => x.to_bits().cmp(&y.to_bits()),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(p, q)| key_cmp(p, q))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Map(x), Value::Map(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(p, q)| key_cmp(&p.0, &q.0).then_with(|| key_cmp(&p.1, &q.1)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Ext(tx, x), Value::Ext(ty, y)) => tx.cmp(ty).then_with(|| x.cmp(y)),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Collapses repeated keys: the first occurrence keeps its position and
/// takes the value of the last occurrence.
///
/// Sorts an index by key, so a map with `n` entries costs `O(n log n)`.
pub(crate) fn dedup_entries(entries: Vec<(Value, Value)>) -> Vec<(Value, Value)> {
    if entries.len() < 2 {
        return entries;
    }
    let (keys, mut values): (Vec<Value>, Vec<Option<Value>>) =
        entries.into_iter().map(|(k, v)| (k, Some(v))).unzip();

    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| key_cmp(&keys[a], &keys[b]).then(a.cmp(&b)));

    let mut keep = vec![true; keys.len()];
    let mut start = 0;
    while start < order.len() {
        let first = order[start];
        let mut end = start + 1;
        while end < order.len() && key_cmp(&keys[first], &keys[order[end]]).is_eq() {
            end += 1;
        }
        if end - start > 1 {
            values[first] = values[order[end - 1]].take();
            for &dup in &order[start + 1..end] {
                keep[dup] = false;
            }
        }
        start = end;
    }

    keys.into_iter()
        .zip(values)
        .zip(keep)
        .filter_map(|((key, value), keep)| if keep { value.map(|v| (key, v)) } else { None })
        .collect()
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Integer(n as i64)
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float32(f)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(String::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_map_overwrites_on_collision() {
        let map = Value::map(vec![
            (Value::from("a"), Value::from(1)),
            (Value::from("b"), Value::from(2)),
            (Value::from("a"), Value::from(3)),
        ]);

        let entries = map.as_map().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(map.get(&Value::from("a")), Some(&Value::Integer(3)));
        assert_eq!(map.get(&Value::from("b")), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_map_dedup_keeps_first_position() {
        let map = Value::map(vec![
            (Value::from(3), Value::from("c")),
            (Value::from(1), Value::from("a")),
            (Value::from(3), Value::from("x")),
            (Value::from(2), Value::from("b")),
            (Value::from(3), Value::from("z")),
        ]);

        let keys: Vec<i64> = map.as_map().unwrap().iter().filter_map(|(k, _)| k.as_i64()).collect();
        assert_eq!(keys, vec![3, 1, 2]);
        assert_eq!(map.get(&Value::from(3)), Some(&Value::from("z")));
    }

    #[test]
    fn test_maps_equal_in_any_order() {
        let a = Value::Map(vec![
            (Value::from("x"), Value::from(1)),
            (Value::from("y"), Value::Array(vec![Value::Nil])),
        ]);
        let b = Value::Map(vec![
            (Value::from("y"), Value::Array(vec![Value::Nil])),
            (Value::from("x"), Value::from(1)),
        ]);
        assert_eq!(a, b);
        assert_eq!(Value::Array(vec![a.clone()]), Value::Array(vec![b]));

        let c = Value::Map(vec![
            (Value::from("x"), Value::from(2)),
            (Value::from("y"), Value::Array(vec![Value::Nil])),
        ]);
        assert_ne!(a, c);
        assert_ne!(a, Value::Map(vec![(Value::from("x"), Value::from(1))]));
    }

    #[test]
    fn test_float_keys_are_bitwise() {
        let map = Value::map(vec![
            (Value::Float64(0.0), Value::from(1)),
            (Value::Float64(-0.0), Value::from(2)),
            (Value::Float64(f64::NAN), Value::from(3)),
            (Value::Float64(f64::NAN), Value::from(4)),
        ]);
        let entries = map.as_map().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].1, Value::from(4));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from(7u32).as_u32(), Some(7));
        assert_eq!(Value::from(-1).as_u32(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(None::<i32>), Value::Nil);
        assert_eq!(Value::Float32(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Ext(-1, vec![0]).kind_name(), "ext");
    }
}
