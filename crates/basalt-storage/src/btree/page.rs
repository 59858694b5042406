//! Typed views over the meta, inner and leaf pages of a B+Tree.

use super::constants::{
    INNER_SPECIAL_SIZE, LEAF_NEXT_OFFSET, LEAF_PREV_OFFSET, LEAF_SPECIAL_SIZE,
    META_HEIGHT_OFFSET, META_ROOT_OFFSET, META_TUPLE_COUNT_OFFSET,
};
use super::types::{InnerOrder, InnerSlot, LeafOrder, LeafSlot};
use crate::compare::KeyCompare;
use basalt_buffer::{PlainPage, SortedPage};
use basalt_common::{PageId, Result};
use bytes::Bytes;

/// The plain meta page: height, root page id and live tuple count.
pub(crate) struct MetaPage {
    page: PlainPage,
}

impl MetaPage {
    pub fn new(page: PlainPage) -> Self {
        Self { page }
    }

    pub fn init(&self, root: PageId) {
        self.set_height(0);
        self.set_root(root);
        self.set_tuple_count(0);
    }

    pub fn height(&self) -> u8 {
        self.page.read_u8(META_HEIGHT_OFFSET)
    }

    pub fn set_height(&self, height: u8) {
        self.page.write_u8(META_HEIGHT_OFFSET, height);
    }

    pub fn root(&self) -> PageId {
        self.page.read_page_id(META_ROOT_OFFSET)
    }

    pub fn set_root(&self, root: PageId) {
        self.page.write_page_id(META_ROOT_OFFSET, root);
    }

    pub fn tuple_count(&self) -> u64 {
        self.page.read_u64(META_TUPLE_COUNT_OFFSET)
    }

    pub fn set_tuple_count(&self, count: u64) {
        self.page.write_u64(META_TUPLE_COUNT_OFFSET, count);
    }
}

/// Inner page: slots of `(child, strict upper bound)` plus the right-most child
/// in the special area.
pub(crate) struct InnerNode<C> {
    page: SortedPage<InnerOrder<C>>,
}

impl<C: KeyCompare> InnerNode<C> {
    pub fn new(page: SortedPage<InnerOrder<C>>) -> Self {
        Self { page }
    }

    pub fn init(&self) {
        self.page.init(INNER_SPECIAL_SIZE);
    }

    pub fn id(&self) -> PageId {
        self.page.id()
    }

    pub fn slot_count(&self) -> usize {
        self.page.slot_count()
    }

    /// Returns `(child, bound)` of slot `index`.
    pub fn slot(&self, index: usize) -> (PageId, Bytes) {
        let raw = self.page.slot(index);
        let child = InnerSlot::parse(&raw).child;
        (child, raw.slice(InnerSlot::size(0)..))
    }

    pub fn bounds(&self) -> Vec<Bytes> {
        (0..self.slot_count()).map(|i| self.slot(i).1).collect()
    }

    pub fn special(&self) -> PageId {
        self.page.read_special_page_id(0)
    }

    pub fn set_special(&self, child: PageId) {
        self.page.write_special_page_id(0, child);
    }

    /// Child at position `index`; `slot_count()` selects the special child.
    pub fn child(&self, index: usize) -> PageId {
        if index >= self.slot_count() {
            self.special()
        } else {
            self.slot(index).0
        }
    }

    /// All children left to right, special last.
    pub fn children(&self) -> Vec<PageId> {
        (0..=self.slot_count()).map(|i| self.child(i)).collect()
    }

    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.page.upper_bound(key)
    }

    /// Points slot `index` at a different child, keeping its bound.
    pub fn set_child(&self, index: usize, child: PageId) -> Result<()> {
        let (_, bound) = self.slot(index);
        self.page.replace(index, &InnerSlot::encode(child, &bound))
    }

    pub fn is_insertable(&self, slot: &[u8]) -> bool {
        self.page.is_insertable(slot)
    }

    pub fn insert_slot(&self, index: usize, slot: &[u8]) -> Result<()> {
        self.page.insert_before(index, slot)
    }

    pub fn delete(&self, index: usize) {
        self.page.delete(index);
    }

    pub fn split_insert(&self, right: &InnerNode<C>, slot: &[u8], index: usize) -> Result<()> {
        self.page.split_insert(&right.page, slot, index)
    }
}

/// Leaf page: `(key, value)` slots plus `(prev, next)` sibling links in the special area.
pub(crate) struct LeafNode<C> {
    page: SortedPage<LeafOrder<C>>,
}

impl<C: KeyCompare> LeafNode<C> {
    pub fn new(page: SortedPage<LeafOrder<C>>) -> Self {
        Self { page }
    }

    pub fn init(&self) {
        self.page.init(LEAF_SPECIAL_SIZE);
    }

    pub fn id(&self) -> PageId {
        self.page.id()
    }

    pub fn slot_count(&self) -> usize {
        self.page.slot_count()
    }

    /// Returns `(key, value)` of slot `index`.
    pub fn entry(&self, index: usize) -> (Bytes, Bytes) {
        let raw = self.page.slot(index);
        let slot = LeafSlot::parse(&raw);
        let key_end = LeafSlot::size(slot.key.len(), 0);
        (raw.slice(LeafSlot::size(0, 0)..key_end), raw.slice(key_end..))
    }

    pub fn key(&self, index: usize) -> Bytes {
        self.entry(index).0
    }

    pub fn keys(&self) -> Vec<Bytes> {
        (0..self.slot_count()).map(|i| self.key(i)).collect()
    }

    pub fn prev(&self) -> PageId {
        self.page.read_special_page_id(LEAF_PREV_OFFSET)
    }

    pub fn set_prev(&self, id: PageId) {
        self.page.write_special_page_id(LEAF_PREV_OFFSET, id);
    }

    pub fn next(&self) -> PageId {
        self.page.read_special_page_id(LEAF_NEXT_OFFSET)
    }

    pub fn set_next(&self, id: PageId) {
        self.page.write_special_page_id(LEAF_NEXT_OFFSET, id);
    }

    pub fn find(&self, key: &[u8]) -> Option<usize> {
        self.page.find(key)
    }

    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.page.lower_bound(key)
    }

    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.page.upper_bound(key)
    }

    pub fn is_insertable(&self, slot: &[u8]) -> bool {
        self.page.is_insertable(slot)
    }

    pub fn insert_slot(&self, index: usize, slot: &[u8]) -> Result<()> {
        self.page.insert_before(index, slot)
    }

    pub fn replace(&self, index: usize, slot: &[u8]) -> Result<()> {
        self.page.replace(index, slot)
    }

    pub fn delete(&self, index: usize) {
        self.page.delete(index);
    }

    pub fn split_insert(&self, right: &LeafNode<C>, slot: &[u8], index: usize) -> Result<()> {
        self.page.split_insert(&right.page, slot, index)
    }
}
