//! Page-based B+Tree index.

use super::constants::{INNER_SPECIAL_SIZE, LEAF_SPECIAL_SIZE, MAX_HEIGHT};
use super::iter::Iter;
use super::page::{InnerNode, LeafNode, MetaPage};
use super::types::{InnerOrder, InnerSlot, LeafOrder, LeafSlot};
use crate::compare::KeyCompare;
use basalt_buffer::{max_slot_size, PageStore};
use basalt_common::{BasaltError, PageId, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Ordered key-value index stored entirely in pages of a [`PageStore`].
///
/// The tree owns nothing but its meta page id and comparator. Inner pages route
/// a key to the first slot whose bound is greater than it, or to the special
/// right-most child. Leaves form a doubly linked list in key order.
///
/// Deletion only collapses nodes that become empty. Underfull non-empty nodes
/// are never merged or rebalanced, unlike textbook B+Trees, so a tree that
/// shrinks keeps its height until it is emptied completely.
///
/// The tree does no locking of its own. Mutations take `&mut self`; callers
/// sharing a tree across threads wrap it in a mutex and serialize access
/// through the lock manager.
pub struct BPlusTree<C: KeyCompare> {
    store: Arc<PageStore>,
    meta: PageId,
    cmp: C,
}

impl<C: KeyCompare> BPlusTree<C> {
    /// Creates an empty tree: a meta page and an empty root leaf.
    pub fn create(store: Arc<PageStore>, cmp: C) -> Result<Self> {
        let meta = store.allocate()?;
        let tree = Self { store, meta, cmp };
        let root = tree.alloc_leaf()?;
        tree.meta_page()?.init(root.id());
        debug!(meta = %meta, root = %root.id(), "b+tree created");
        Ok(tree)
    }

    /// Reattaches to an existing tree through its meta page.
    pub fn open(store: Arc<PageStore>, meta: PageId, cmp: C) -> Result<Self> {
        if !store.contains(meta) {
            return Err(BasaltError::PageNotFound { page_id: meta.0 });
        }
        Ok(Self { store, meta, cmp })
    }

    pub fn meta_page_id(&self) -> PageId {
        self.meta
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub fn comparator(&self) -> &C {
        &self.cmp
    }

    /// Number of inner levels above the leaves (0 = the root is a leaf).
    pub fn height(&self) -> Result<u8> {
        Ok(self.meta_page()?.height())
    }

    /// Number of live keys.
    pub fn tuple_num(&self) -> Result<u64> {
        Ok(self.meta_page()?.tuple_count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tuple_num()? == 0)
    }

    pub(crate) fn meta_page(&self) -> Result<MetaPage> {
        Ok(MetaPage::new(self.store.plain(self.meta)?))
    }

    pub(crate) fn inner(&self, id: PageId) -> Result<InnerNode<C>> {
        Ok(InnerNode::new(
            self.store.sorted(id, InnerOrder(self.cmp.clone()))?,
        ))
    }

    pub(crate) fn leaf(&self, id: PageId) -> Result<LeafNode<C>> {
        Ok(LeafNode::new(
            self.store.sorted(id, LeafOrder(self.cmp.clone()))?,
        ))
    }

    fn alloc_inner(&self) -> Result<InnerNode<C>> {
        let node = self.inner(self.store.allocate()?)?;
        node.init();
        Ok(node)
    }

    fn alloc_leaf(&self) -> Result<LeafNode<C>> {
        let node = self.leaf(self.store.allocate()?)?;
        node.init();
        Ok(node)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        self.store.free(id)
    }

    /// Root and height read together from the meta page.
    pub(crate) fn root_and_height(&self) -> Result<(PageId, usize)> {
        let meta = self.meta_page()?;
        let height = meta.height() as usize;
        if height >= MAX_HEIGHT {
            return Err(BasaltError::BTreeCorrupted(format!(
                "height {} exceeds limit {}",
                height, MAX_HEIGHT
            )));
        }
        Ok((meta.root(), height))
    }

    fn child_checked(inner: &InnerNode<C>, index: usize) -> Result<PageId> {
        let child = inner.child(index);
        if child.is_none() {
            return Err(BasaltError::BTreeCorrupted(format!(
                "inner page {} has no child at position {}",
                inner.id(),
                index
            )));
        }
        Ok(child)
    }

    /// Page ids from the root down to the leaf responsible for `key`.
    fn descend(&self, key: &[u8]) -> Result<Vec<PageId>> {
        let (mut id, height) = self.root_and_height()?;
        let mut path = Vec::with_capacity(height + 1);
        for _ in 0..height {
            path.push(id);
            let inner = self.inner(id)?;
            id = Self::child_checked(&inner, inner.upper_bound(key))?;
        }
        path.push(id);
        Ok(path)
    }

    fn leaf_for(&self, key: &[u8]) -> Result<LeafNode<C>> {
        let path = self.descend(key)?;
        self.leaf(path[path.len() - 1])
    }

    /// Descends along the first (`leftmost`) or special child of every inner page.
    fn edge_leaf(&self, leftmost: bool) -> Result<LeafNode<C>> {
        let (mut id, height) = self.root_and_height()?;
        for _ in 0..height {
            let inner = self.inner(id)?;
            let index = if leftmost { 0 } else { inner.slot_count() };
            id = Self::child_checked(&inner, index)?;
        }
        self.leaf(id)
    }

    /// Rejects entries too large for a split to place.
    fn check_entry_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let page_size = self.store.page_size();
        let leaf_max = max_slot_size(page_size, LEAF_SPECIAL_SIZE);
        let inner_max = max_slot_size(page_size, INNER_SPECIAL_SIZE);

        let leaf_size = LeafSlot::size(key.len(), value.len());
        if leaf_size > leaf_max {
            return Err(BasaltError::KeyTooLarge {
                size: leaf_size,
                max: leaf_max,
            });
        }
        let inner_size = InnerSlot::size(key.len());
        if inner_size > inner_max {
            return Err(BasaltError::KeyTooLarge {
                size: inner_size,
                max: inner_max,
            });
        }
        Ok(())
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let leaf = self.leaf_for(key)?;
        Ok(leaf.find(key).map(|index| leaf.entry(index).1))
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.leaf_for(key)?.find(key).is_some())
    }

    /// Inserts a new key. Returns false, changing nothing, if the key exists.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_entry_size(key, value)?;
        let path = self.descend(key)?;
        let leaf = self.leaf(path[path.len() - 1])?;
        if leaf.find(key).is_some() {
            return Ok(false);
        }

        let meta = self.meta_page()?;
        let slot = LeafSlot::encode(key, value);
        let pos = leaf.upper_bound(key);
        if leaf.is_insertable(&slot) {
            leaf.insert_slot(pos, &slot)?;
            meta.set_tuple_count(meta.tuple_count() + 1);
            return Ok(true);
        }

        // Split the leaf and splice the new right sibling into the chain
        let right = self.alloc_leaf()?;
        leaf.split_insert(&right, &slot, pos)?;
        meta.set_tuple_count(meta.tuple_count() + 1);
        let next = leaf.next();
        right.set_prev(leaf.id());
        right.set_next(next);
        if next.is_some() {
            self.leaf(next)?.set_prev(right.id());
        }
        leaf.set_next(right.id());
        debug!(
            left = %leaf.id(),
            right = %right.id(),
            left_slots = leaf.slot_count(),
            right_slots = right.slot_count(),
            "leaf split"
        );

        let mut separator = right.key(0);
        let mut new_child = right.id();
        drop(right);
        drop(leaf);

        for &inner_id in path[..path.len() - 1].iter().rev() {
            let inner = self.inner(inner_id)?;
            let pos = inner.upper_bound(key);
            let new_slot = if pos == inner.slot_count() {
                // The split child was the special one: the right half takes its place
                let old_special = inner.special();
                inner.set_special(new_child);
                InnerSlot::encode(old_special, &separator)
            } else {
                // (child, bound) becomes (child, separator), (new_child, bound)
                let (old_child, _) = inner.slot(pos);
                inner.set_child(pos, new_child)?;
                InnerSlot::encode(old_child, &separator)
            };

            if inner.is_insertable(&new_slot) {
                inner.insert_slot(pos, &new_slot)?;
                return Ok(true);
            }

            let right = self.alloc_inner()?;
            inner.split_insert(&right, &new_slot, pos)?;
            right.set_special(inner.special());
            // The left page's last child becomes its special child; its bound
            // separates the two halves one level up.
            let last = inner.slot_count() - 1;
            let (last_child, last_bound) = inner.slot(last);
            inner.set_special(last_child);
            inner.delete(last);
            debug!(
                left = %inner.id(),
                right = %right.id(),
                "inner split"
            );

            separator = last_bound;
            new_child = right.id();
        }

        // Propagation ran past the root: grow the tree by one level
        let old_root = meta.root();
        let root = self.alloc_inner()?;
        root.set_special(new_child);
        root.insert_slot(0, &InnerSlot::encode(old_root, &separator))?;
        let height = meta.height() + 1;
        meta.set_root(root.id());
        meta.set_height(height);
        debug!(root = %root.id(), height, "b+tree root split");
        Ok(true)
    }

    /// Replaces the value of an existing key. Returns false if the key is absent.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_entry_size(key, value)?;
        {
            let leaf = self.leaf_for(key)?;
            let index = match leaf.find(key) {
                Some(index) => index,
                None => return Ok(false),
            };
            match leaf.replace(index, &LeafSlot::encode(key, value)) {
                Ok(()) => return Ok(true),
                Err(BasaltError::PageFull { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        // The larger value does not fit in place: the leaf still holds other
        // keys, so deleting never collapses it and the insert splits as usual.
        self.delete(key)?;
        self.insert(key, value)
    }

    /// Removes `key`. Returns false if the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let path = self.descend(key)?;
        let leaf_id = path[path.len() - 1];
        let leaf = self.leaf(leaf_id)?;
        let index = match leaf.find(key) {
            Some(index) => index,
            None => return Ok(false),
        };
        leaf.delete(index);

        let meta = self.meta_page()?;
        meta.set_tuple_count(meta.tuple_count().saturating_sub(1));

        // A root leaf may be empty; any other leaf must go
        if leaf.slot_count() > 0 || path.len() == 1 {
            return Ok(true);
        }

        let (prev, next) = (leaf.prev(), leaf.next());
        if prev.is_some() {
            self.leaf(prev)?.set_next(next);
        }
        if next.is_some() {
            self.leaf(next)?.set_prev(prev);
        }
        drop(leaf);
        self.free_page(leaf_id)?;
        debug!(leaf = %leaf_id, "empty leaf collapsed");

        for &inner_id in path[..path.len() - 1].iter().rev() {
            let inner = self.inner(inner_id)?;
            let pos = inner.upper_bound(key);
            let count = inner.slot_count();

            if pos != count {
                // Neighbour to the right absorbs the freed child's range
                inner.delete(pos);
                return Ok(true);
            }
            if count == 0 {
                // Only the special child existed and it is gone
                drop(inner);
                self.free_page(inner_id)?;
                debug!(inner = %inner_id, "empty inner page collapsed");
                continue;
            }
            let (last_child, _) = inner.slot(count - 1);
            inner.set_special(last_child);
            inner.delete(count - 1);
            return Ok(true);
        }

        // Every page on the path collapsed: start over with an empty root leaf
        let root = self.alloc_leaf()?;
        meta.set_root(root.id());
        meta.set_height(0);
        meta.set_tuple_count(0);
        debug!(root = %root.id(), "b+tree reset to empty leaf");
        Ok(true)
    }

    /// Removes `key` and returns its value.
    pub fn take(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let value = match self.get(key)? {
            Some(value) => value,
            None => return Ok(None),
        };
        self.delete(key)?;
        Ok(Some(value))
    }

    /// Largest key in the tree.
    pub fn max_key(&self) -> Result<Option<Bytes>> {
        let leaf = self.edge_leaf(false)?;
        let count = leaf.slot_count();
        Ok((count > 0).then(|| leaf.key(count - 1)))
    }

    /// Cursor at the smallest key.
    pub fn begin(&self) -> Result<Iter<'_, C>> {
        Iter::new(self, self.edge_leaf(true)?, 0)
    }

    /// Cursor at the first key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iter<'_, C>> {
        let leaf = self.leaf_for(key)?;
        let pos = leaf.lower_bound(key);
        Iter::new(self, leaf, pos)
    }

    /// Cursor at the first key > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iter<'_, C>> {
        let leaf = self.leaf_for(key)?;
        let pos = leaf.upper_bound(key);
        Iter::new(self, leaf, pos)
    }

    /// Number of leaves on the leaf chain.
    pub fn leaf_count(&self) -> Result<usize> {
        let mut count = 1;
        let mut next = self.edge_leaf(true)?.next();
        while next.is_some() {
            count += 1;
            next = self.leaf(next)?.next();
        }
        Ok(count)
    }

    /// Frees every page of the tree, the meta page last.
    pub fn destroy(self) -> Result<()> {
        let (root, height) = self.root_and_height()?;
        self.destroy_subtree(root, height)?;
        self.free_page(self.meta)?;
        debug!(meta = %self.meta, "b+tree destroyed");
        Ok(())
    }

    fn destroy_subtree(&self, id: PageId, level: usize) -> Result<()> {
        if level > 0 {
            let children = self.inner(id)?.children();
            for child in children {
                if child.is_some() {
                    self.destroy_subtree(child, level - 1)?;
                }
            }
        }
        self.free_page(id)
    }
}

impl<C: KeyCompare + std::fmt::Debug> std::fmt::Debug for BPlusTree<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("meta", &self.meta)
            .field("cmp", &self.cmp)
            .finish()
    }
}
