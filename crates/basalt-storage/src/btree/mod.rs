//! Page-based B+Tree.
//!
//! A tree is addressed by its meta page, which records the height, the root
//! page id and the number of live keys. Inner pages hold `(child, bound)` slots
//! where each child covers the keys below its bound, plus a special right-most
//! child covering everything at or above the last bound. Leaves hold
//! `(key, value)` slots and link to their neighbours for ordered scans.
//!
//! Keys are compared through a [`KeyCompare`](crate::compare::KeyCompare)
//! supplied when the tree is created or opened.

mod check;
mod constants;
mod index;
mod iter;
mod page;
mod types;

pub use constants::MAX_HEIGHT;
pub use index::BPlusTree;
pub use iter::Iter;
pub use types::{InnerSlot, LeafSlot};
