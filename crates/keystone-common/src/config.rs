//! Configuration structures for the index engine.

use crate::error::{KeystoneError, Result};
use serde::{Deserialize, Serialize};

/// B+Tree configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Order M of the tree: maximum number of children per internal node.
    /// Every node holds at most M - 1 keys.
    pub order: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self { order: 4 }
    }
}

impl BTreeConfig {
    /// Rejects orders too small to split meaningfully.
    pub fn validate(&self) -> Result<()> {
        if self.order < 3 {
            return Err(KeystoneError::InvalidParameter {
                name: "order".to_string(),
                value: self.order.to_string(),
            });
        }
        Ok(())
    }
}

/// Extendible hash configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HashConfig {
    /// Maximum number of entries per bucket before a split.
    pub bucket_capacity: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self { bucket_capacity: 4 }
    }
}

impl HashConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 {
            return Err(KeystoneError::InvalidParameter {
                name: "bucket_capacity".to_string(),
                value: self.bucket_capacity.to_string(),
            });
        }
        Ok(())
    }
}

/// ISAM configuration. Both factors are fixed at build time; only a
/// reorganize rebuilds the structure with new ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IsamConfig {
    /// Maximum number of entries per data page.
    pub data_block_factor: usize,
    /// Maximum number of entries per index page.
    pub index_block_factor: usize,
}

impl Default for IsamConfig {
    fn default() -> Self {
        Self {
            data_block_factor: 5,
            index_block_factor: 7,
        }
    }
}

impl IsamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_block_factor == 0 {
            return Err(KeystoneError::InvalidParameter {
                name: "data_block_factor".to_string(),
                value: self.data_block_factor.to_string(),
            });
        }
        if self.index_block_factor < 2 {
            return Err(KeystoneError::InvalidParameter {
                name: "index_block_factor".to_string(),
                value: self.index_block_factor.to_string(),
            });
        }
        Ok(())
    }
}

/// R-tree configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RTreeConfig {
    /// Maximum number of entries per node before a quadratic split.
    pub max_children: usize,
}

impl Default for RTreeConfig {
    fn default() -> Self {
        Self { max_children: 8 }
    }
}

impl RTreeConfig {
    /// Minimum entries per node, 40% of the maximum, at least one.
    pub fn min_children(&self) -> usize {
        ((self.max_children * 2) / 5).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_children < 2 {
            return Err(KeystoneError::InvalidParameter {
                name: "max_children".to_string(),
                value: self.max_children.to_string(),
            });
        }
        Ok(())
    }
}

/// Aggregate options handed to the registry when creating an index.
/// Each variant reads only its own section.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexOptions {
    pub btree: BTreeConfig,
    pub hash: HashConfig,
    pub isam: IsamConfig,
    pub rtree: RTreeConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btree_config_defaults() {
        let config = BTreeConfig::default();
        assert_eq!(config.order, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_btree_config_rejects_tiny_order() {
        let config = BTreeConfig { order: 2 };
        assert!(config.validate().is_err());
        let config = BTreeConfig { order: 3 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hash_config_defaults() {
        let config = HashConfig::default();
        assert_eq!(config.bucket_capacity, 4);
        assert!(config.validate().is_ok());
        assert!(HashConfig { bucket_capacity: 0 }.validate().is_err());
    }

    #[test]
    fn test_isam_config_defaults() {
        let config = IsamConfig::default();
        assert_eq!(config.data_block_factor, 5);
        assert_eq!(config.index_block_factor, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_isam_config_rejects_zero_factors() {
        let config = IsamConfig {
            data_block_factor: 0,
            index_block_factor: 7,
        };
        assert!(config.validate().is_err());

        let config = IsamConfig {
            data_block_factor: 5,
            index_block_factor: 1,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rtree_min_children() {
        assert_eq!(RTreeConfig { max_children: 8 }.min_children(), 3);
        assert_eq!(RTreeConfig { max_children: 4 }.min_children(), 1);
        assert_eq!(RTreeConfig { max_children: 5 }.min_children(), 2);
        assert_eq!(RTreeConfig { max_children: 2 }.min_children(), 1);
    }

    #[test]
    fn test_rtree_config_validate() {
        assert!(RTreeConfig { max_children: 1 }.validate().is_err());
        assert!(RTreeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_index_options_serde_roundtrip() {
        let original = IndexOptions {
            btree: BTreeConfig { order: 8 },
            hash: HashConfig { bucket_capacity: 16 },
            isam: IsamConfig {
                data_block_factor: 10,
                index_block_factor: 12,
            },
            rtree: RTreeConfig { max_children: 6 },
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: IndexOptions = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.btree.order, deserialized.btree.order);
        assert_eq!(original.hash.bucket_capacity, deserialized.hash.bucket_capacity);
        assert_eq!(
            original.isam.data_block_factor,
            deserialized.isam.data_block_factor
        );
        assert_eq!(original.rtree.max_children, deserialized.rtree.max_children);
    }
}
