//! Index storage for Basalt.
//!
//! This crate provides:
//! - Key comparators for integer, float and string keys
//! - A page-based B+Tree with ordered cursors and a consistency checker
//! - Named tables, each backed by one tree, and the registry that owns them

pub mod compare;
mod btree;
mod table;

pub use btree::{BPlusTree, InnerSlot, Iter, LeafSlot, MAX_HEIGHT};
pub use compare::{
    float_key, int_key, FloatKeyCompare, IntegerKeyCompare, KeyCompare, StringKeyCompare,
};
pub use table::{Table, TableIndex, Tables};
