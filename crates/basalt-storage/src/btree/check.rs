//! Structural checks and a debug rendering of a tree.

use super::index::BPlusTree;
use crate::compare::KeyCompare;
use basalt_common::{BasaltError, PageId, Result};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt::Write;

/// Half-open key range `[lower, upper)` a subtree must stay within.
struct Range {
    lower: Option<Bytes>,
    upper: Option<Bytes>,
}

impl<C: KeyCompare> BPlusTree<C> {
    /// Verifies key order across the whole tree.
    ///
    /// Checks that leaf keys are strictly increasing and lie within the range
    /// their ancestors route to them, that inner bounds are strictly increasing,
    /// and that the leaf chain links agree in both directions. Returns
    /// `BTreeCorrupted` describing the first violation found.
    pub fn check_key_order(&self) -> Result<()> {
        let (root, height) = self.root_and_height()?;
        let mut leaves = Vec::new();
        self.check_subtree(
            root,
            height,
            &Range {
                lower: None,
                upper: None,
            },
            &mut leaves,
        )?;
        self.check_leaf_chain(&leaves)?;

        let mut count = 0u64;
        for &id in &leaves {
            count += self.leaf(id)?.slot_count() as u64;
        }
        let recorded = self.tuple_num()?;
        if count != recorded {
            return Err(corrupted(format!(
                "tuple count {} disagrees with {} leaf entries",
                recorded, count
            )));
        }
        Ok(())
    }

    fn in_range(&self, key: &[u8], range: &Range) -> bool {
        let cmp = self.comparator();
        let above = range
            .lower
            .as_ref()
            .map_or(true, |lower| cmp.compare(key, lower) != Ordering::Less);
        let below = range
            .upper
            .as_ref()
            .map_or(true, |upper| cmp.compare(key, upper) == Ordering::Less);
        above && below
    }

    fn check_subtree(
        &self,
        id: PageId,
        level: usize,
        range: &Range,
        leaves: &mut Vec<PageId>,
    ) -> Result<()> {
        let cmp = self.comparator();

        if level == 0 {
            let keys = self.leaf(id)?.keys();
            for pair in keys.windows(2) {
                if cmp.compare(&pair[0], &pair[1]) != Ordering::Less {
                    return Err(corrupted(format!("leaf {} keys out of order", id)));
                }
            }
            if let Some(key) = keys.iter().find(|key| !self.in_range(key, range)) {
                return Err(corrupted(format!(
                    "leaf {} key {:?} outside its routed range",
                    id,
                    key.as_ref()
                )));
            }
            leaves.push(id);
            return Ok(());
        }

        let (children, bounds) = {
            let inner = self.inner(id)?;
            (inner.children(), inner.bounds())
        };
        for pair in bounds.windows(2) {
            if cmp.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(corrupted(format!("inner {} bounds out of order", id)));
            }
        }
        // Bounds may sit on the range edges after collapses, so they are only
        // checked loosely against the enclosing range.
        for bound in &bounds {
            let below_lower = range
                .lower
                .as_ref()
                .is_some_and(|lower| cmp.compare(bound, lower) == Ordering::Less);
            let above_upper = range
                .upper
                .as_ref()
                .is_some_and(|upper| cmp.compare(bound, upper) == Ordering::Greater);
            if below_lower || above_upper {
                return Err(corrupted(format!(
                    "inner {} bound {:?} outside its routed range",
                    id,
                    bound.as_ref()
                )));
            }
        }

        for (i, &child) in children.iter().enumerate() {
            if child.is_none() {
                return Err(corrupted(format!("inner {} missing child {}", id, i)));
            }
            let child_range = Range {
                lower: if i == 0 {
                    range.lower.clone()
                } else {
                    Some(bounds[i - 1].clone())
                },
                upper: bounds.get(i).cloned().or_else(|| range.upper.clone()),
            };
            self.check_subtree(child, level - 1, &child_range, leaves)?;
        }
        Ok(())
    }

    /// Compares the chain reached through `next` links with the in-order leaves.
    fn check_leaf_chain(&self, leaves: &[PageId]) -> Result<()> {
        for (i, &id) in leaves.iter().enumerate() {
            let leaf = self.leaf(id)?;
            let expected_prev = if i == 0 { PageId::NONE } else { leaves[i - 1] };
            let expected_next = leaves.get(i + 1).copied().unwrap_or(PageId::NONE);
            if leaf.prev() != expected_prev || leaf.next() != expected_next {
                return Err(corrupted(format!(
                    "leaf {} links ({}, {}) expected ({}, {})",
                    id,
                    leaf.prev(),
                    leaf.next(),
                    expected_prev,
                    expected_next
                )));
            }
        }
        Ok(())
    }

    /// Renders the tree level by level, formatting keys with `fmt_key`.
    pub fn render(&self, fmt_key: impl Fn(&[u8]) -> String) -> Result<String> {
        let (root, height) = self.root_and_height()?;
        let mut out = String::new();
        self.render_node(root, height, 0, &fmt_key, &mut out)?;
        Ok(out)
    }

    fn render_node(
        &self,
        id: PageId,
        level: usize,
        depth: usize,
        fmt_key: &impl Fn(&[u8]) -> String,
        out: &mut String,
    ) -> Result<()> {
        let indent = "  ".repeat(depth);
        if level == 0 {
            let keys: Vec<String> = self.leaf(id)?.keys().iter().map(|k| fmt_key(k)).collect();
            let _ = writeln!(out, "{}leaf {} [{}]", indent, id, keys.join(", "));
            return Ok(());
        }

        let (children, bounds) = {
            let inner = self.inner(id)?;
            (inner.children(), inner.bounds())
        };
        let bounds: Vec<String> = bounds.iter().map(|b| fmt_key(b)).collect();
        let _ = writeln!(out, "{}inner {} |{}|", indent, id, bounds.join("|"));
        for child in children {
            self.render_node(child, level - 1, depth + 1, fmt_key, out)?;
        }
        Ok(())
    }
}

fn corrupted(reason: String) -> BasaltError {
    BasaltError::BTreeCorrupted(reason)
}

#[cfg(test)]
mod tests {
    use crate::btree::BPlusTree;
    use crate::compare::{int_key, IntegerKeyCompare, KeyCompare, StringKeyCompare};
    use basalt_buffer::PageStore;
    use basalt_common::BasaltError;
    use std::cmp::Ordering;
    use std::sync::Arc;

    /// Integer order reversed, used to read a valid tree as a corrupted one.
    #[derive(Clone)]
    struct Reversed;

    impl KeyCompare for Reversed {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            IntegerKeyCompare.compare(b, a)
        }
    }

    fn int_tree(n: i64) -> BPlusTree<IntegerKeyCompare> {
        let store = Arc::new(PageStore::in_memory(128).unwrap());
        let mut tree = BPlusTree::create(store, IntegerKeyCompare).unwrap();
        for i in 0..n {
            tree.insert(&int_key(i), b"v").unwrap();
        }
        tree
    }

    #[test]
    fn test_check_key_order_valid_tree() {
        int_tree(0).check_key_order().unwrap();
        int_tree(3).check_key_order().unwrap();
        int_tree(300).check_key_order().unwrap();
    }

    #[test]
    fn test_check_key_order_detects_bad_leaf_order() {
        let tree = int_tree(2);
        let store = Arc::clone(tree.store());
        let reversed = BPlusTree::open(store, tree.meta_page_id(), Reversed).unwrap();
        assert!(matches!(
            reversed.check_key_order(),
            Err(BasaltError::BTreeCorrupted(_))
        ));
    }

    #[test]
    fn test_render_shows_levels() {
        let store = Arc::new(PageStore::in_memory(128).unwrap());
        let mut tree = BPlusTree::create(store, StringKeyCompare).unwrap();
        for key in ["d", "a", "c", "b", "f", "e", "h", "g"] {
            tree.insert(key.as_bytes(), b"a-much-longer-value!").unwrap();
        }
        let text = tree
            .render(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap();
        assert!(text.starts_with("inner "));
        assert!(text.contains("  leaf "));
        assert!(text.contains("[a, b"));
        assert!(text.contains("g, h]"));
    }
}
