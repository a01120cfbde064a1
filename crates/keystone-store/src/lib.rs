//! KeystoneDB storage primitives.
//!
//! Two building blocks shared by the index structures: the append-only
//! record log ([`RecordStore`]) and the fixed-slot node file ([`SlotFile`]).

pub mod log;
pub mod slot;

pub use log::{RecordStore, StoreConfig};
pub use slot::{SlotFile, NULL_SLOT};
