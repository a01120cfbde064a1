//! KeystoneDB index structures.
//!
//! Five disk-resident indexes over the append-only record log: AVL and
//! B+Tree on fixed-slot node files, extendible hash, ISAM with overflow
//! chaining, and a 3D R-tree. All variants share one contract (insert,
//! search, delete, update, compaction) and are dispatched through the
//! [`registry`] module's [`AnyIndex`].

pub mod avl;
pub mod btree;
pub mod hash;
pub mod isam;
pub mod registry;
pub mod rtree;

pub use avl::AvlIndex;
pub use btree::BPlusTreeIndex;
pub use hash::ExtendibleHashIndex;
pub use isam::IsamIndex;
pub use registry::{create_index, load_index, AnyIndex, IndexType};
pub use rtree::RTreeIndex;
