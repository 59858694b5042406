//! Key comparators for encoded index keys.

use std::cmp::Ordering;

/// Total order over encoded keys, injected into a tree at creation or open time.
pub trait KeyCompare: Clone + Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Orders native-endian signed integers of 4 or 8 bytes.
///
/// Keys of any other length fall back to bytewise order after all integers,
/// which keeps the order total for malformed input.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerKeyCompare;

impl IntegerKeyCompare {
    #[inline]
    fn decode(key: &[u8]) -> Option<i64> {
        match key.len() {
            4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(key);
                Some(i32::from_ne_bytes(raw) as i64)
            }
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(key);
                Some(i64::from_ne_bytes(raw))
            }
            _ => None,
        }
    }
}

impl KeyCompare for IntegerKeyCompare {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (Self::decode(a), Self::decode(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }
}

/// Orders native-endian `f64` keys using IEEE 754 total order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatKeyCompare;

impl FloatKeyCompare {
    #[inline]
    fn decode(key: &[u8]) -> Option<f64> {
        if key.len() != 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(key);
        Some(f64::from_ne_bytes(raw))
    }
}

impl KeyCompare for FloatKeyCompare {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (Self::decode(a), Self::decode(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }
}

/// Orders keys bytewise, shorter prefix first.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKeyCompare;

impl KeyCompare for StringKeyCompare {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Encodes an integer key in the layout [`IntegerKeyCompare`] expects.
pub fn int_key(value: i64) -> [u8; 8] {
    value.to_ne_bytes()
}

/// Encodes a float key in the layout [`FloatKeyCompare`] expects.
pub fn float_key(value: f64) -> [u8; 8] {
    value.to_ne_bytes()
}
