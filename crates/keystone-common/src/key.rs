//! Index key model.

use crate::error::{KeystoneError, Result};
use crate::geom::BoundingBox;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A key handed to the registry dispatch surface. Scalar indexes take
/// integers; the R-tree takes bounding boxes. Each index variant accepts
/// exactly one kind and rejects the other with a type error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Spatial(BoundingBox),
}

impl Key {
    pub fn kind(&self) -> &'static str {
        match self {
            Key::Int(_) => "integer",
            Key::Spatial(_) => "spatial",
        }
    }

    /// Unwraps an integer key or reports the mismatch.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Key::Int(v) => Ok(*v),
            other => Err(KeystoneError::KeyTypeMismatch {
                expected: "integer",
                actual: other.kind(),
            }),
        }
    }

    /// Unwraps a spatial key or reports the mismatch.
    pub fn as_spatial(&self) -> Result<BoundingBox> {
        match self {
            Key::Spatial(b) => Ok(*b),
            other => Err(KeystoneError::KeyTypeMismatch {
                expected: "spatial",
                actual: other.kind(),
            }),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<BoundingBox> for Key {
    fn from(b: BoundingBox) -> Self {
        Key::Spatial(b)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v}"),
            Key::Spatial(b) => write!(f, "box({:?}..{:?})", b.min, b.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_key_accessors() {
        let key = Key::from(42i64);
        assert_eq!(key.kind(), "integer");
        assert_eq!(key.as_int().unwrap(), 42);
        assert!(matches!(
            key.as_spatial(),
            Err(KeystoneError::KeyTypeMismatch { expected: "spatial", actual: "integer" })
        ));
    }

    #[test]
    fn test_spatial_key_accessors() {
        let bbox = BoundingBox::point([1.0, 2.0, 3.0]);
        let key = Key::from(bbox);
        assert_eq!(key.kind(), "spatial");
        assert!(key.as_spatial().unwrap().same_extent(&bbox));
        assert!(key.as_int().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Key::Int(-5).to_string(), "-5");
        assert!(Key::Spatial(BoundingBox::point([0.0; 3]))
            .to_string()
            .starts_with("box("));
    }
}
