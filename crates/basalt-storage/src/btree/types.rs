//! Slot encodings for B+Tree inner and leaf pages.
//!
//! Inner slot: `[child pgid][strict upper bound key]`, the key length is implied
//! by the slot length.
//!
//! Leaf slot: `[key_len: pgoff][key][value]`, the value length is implied by
//! the slot length. All integers are native-endian.

use crate::compare::KeyCompare;
use basalt_buffer::SlotOrder;
use basalt_common::{PageId, PgOff, PGID_SIZE, PGOFF_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;

/// A decoded inner slot borrowing from the raw slot bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerSlot<'a> {
    /// Child covering keys below `bound` (and at or above the previous bound).
    pub child: PageId,
    /// Strict upper bound of the child's key range.
    pub bound: &'a [u8],
}

impl<'a> InnerSlot<'a> {
    /// Serialized size of an inner slot with a bound of `bound_len` bytes.
    #[inline]
    pub fn size(bound_len: usize) -> usize {
        PGID_SIZE + bound_len
    }

    #[inline]
    pub fn parse(slot: &'a [u8]) -> Self {
        Self {
            child: PageId::from_ne_slice(slot),
            bound: &slot[PGID_SIZE..],
        }
    }

    pub fn encode(child: PageId, bound: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::size(bound.len()));
        buf.put_slice(&child.to_ne_bytes());
        buf.put_slice(bound);
        buf.freeze()
    }
}

/// A decoded leaf slot borrowing from the raw slot bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSlot<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> LeafSlot<'a> {
    /// Serialized size of a leaf slot.
    #[inline]
    pub fn size(key_len: usize, value_len: usize) -> usize {
        PGOFF_SIZE + key_len + value_len
    }

    #[inline]
    pub fn parse(slot: &'a [u8]) -> Self {
        let key_len = PgOff::from_ne_bytes([slot[0], slot[1]]) as usize;
        Self {
            key: &slot[PGOFF_SIZE..PGOFF_SIZE + key_len],
            value: &slot[PGOFF_SIZE + key_len..],
        }
    }

    pub fn encode(key: &[u8], value: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::size(key.len(), value.len()));
        buf.put_slice(&(key.len() as PgOff).to_ne_bytes());
        buf.put_slice(key);
        buf.put_slice(value);
        buf.freeze()
    }
}

/// Orders inner slots by their bound.
#[derive(Debug, Clone)]
pub struct InnerOrder<C>(pub C);

impl<C: KeyCompare> SlotOrder for InnerOrder<C> {
    #[inline]
    fn cmp_slot_key(&self, slot: &[u8], key: &[u8]) -> Ordering {
        self.0.compare(InnerSlot::parse(slot).bound, key)
    }
}

/// Orders leaf slots by their key.
#[derive(Debug, Clone)]
pub struct LeafOrder<C>(pub C);

impl<C: KeyCompare> SlotOrder for LeafOrder<C> {
    #[inline]
    fn cmp_slot_key(&self, slot: &[u8], key: &[u8]) -> Ordering {
        self.0.compare(LeafSlot::parse(slot).key, key)
    }
}
