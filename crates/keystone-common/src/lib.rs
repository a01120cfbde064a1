//! KeystoneDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all KeystoneDB
//! components.

pub mod config;
pub mod error;
pub mod geom;
pub mod key;
pub mod record;

pub use config::{BTreeConfig, HashConfig, IndexOptions, IsamConfig, RTreeConfig};
pub use error::{KeystoneError, Result};
pub use geom::{BoundingBox, Sphere};
pub use key::Key;
pub use record::{Position, Record, Value};
