//! B+Tree page layout constants.

use basalt_common::PGID_SIZE;

/// Meta page offset of the tree height (1 byte, 0 = root is a leaf).
pub const META_HEIGHT_OFFSET: usize = 0;

/// Meta page offset of the root page id.
pub const META_ROOT_OFFSET: usize = 4;

/// Meta page offset of the live tuple count (8 bytes).
pub const META_TUPLE_COUNT_OFFSET: usize = 8;

/// Inner page special area: right-most child page id.
pub const INNER_SPECIAL_SIZE: usize = PGID_SIZE;

/// Leaf page special area: previous and next leaf page ids.
pub const LEAF_SPECIAL_SIZE: usize = 2 * PGID_SIZE;

pub const LEAF_PREV_OFFSET: usize = 0;
pub const LEAF_NEXT_OFFSET: usize = PGID_SIZE;

/// Maximum tree height. The height is stored in one byte, and any tree that
/// can address its pages through u32 ids stays far below this.
pub const MAX_HEIGHT: usize = 32;
