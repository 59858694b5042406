//! Forward cursor over the leaf chain.

use super::index::BPlusTree;
use super::page::LeafNode;
use crate::compare::KeyCompare;
use basalt_common::{BasaltError, Result};
use bytes::Bytes;

/// Cursor positioned on one entry of a tree, or past the end.
///
/// The cursor pins the leaf it points into. It is invalidated by any
/// mutation of the tree, which the borrow on the tree enforces.
pub struct Iter<'a, C: KeyCompare> {
    tree: &'a BPlusTree<C>,
    leaf: Option<LeafNode<C>>,
    pos: usize,
    /// Error hit while stepping to the next leaf, reported by `Iterator::next`.
    pending: Option<BasaltError>,
}

impl<'a, C: KeyCompare> Iter<'a, C> {
    pub(crate) fn new(tree: &'a BPlusTree<C>, leaf: LeafNode<C>, pos: usize) -> Result<Self> {
        let mut iter = Self {
            tree,
            leaf: Some(leaf),
            pos,
            pending: None,
        };
        iter.normalize()?;
        Ok(iter)
    }

    /// Moves off exhausted leaves so the cursor rests on an entry or at the end.
    fn normalize(&mut self) -> Result<()> {
        while let Some(leaf) = &self.leaf {
            if self.pos < leaf.slot_count() {
                return Ok(());
            }
            let next = leaf.next();
            self.leaf = if next.is_some() {
                Some(self.tree.leaf(next)?)
            } else {
                None
            };
            self.pos = 0;
        }
        Ok(())
    }

    /// Returns true once the cursor has moved past the largest key.
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Entry under the cursor.
    pub fn cur(&self) -> Option<(Bytes, Bytes)> {
        self.leaf.as_ref().map(|leaf| leaf.entry(self.pos))
    }

    /// Steps to the next entry. A no-op at the end.
    pub fn advance(&mut self) -> Result<()> {
        if self.leaf.is_some() {
            self.pos += 1;
            self.normalize()?;
        }
        Ok(())
    }
}

impl<C: KeyCompare> Iterator for Iter<'_, C> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            self.leaf = None;
            return Some(Err(e));
        }
        let entry = self.cur()?;
        if let Err(e) = self.advance() {
            self.pending = Some(e);
        }
        Some(Ok(entry))
    }
}
