//! Index registry: name-based creation and loading of the five index
//! variants behind one dispatch surface.
//!
//! [`AnyIndex`] is a closed enum rather than a trait object so each
//! variant keeps its concrete extras (`bulk_load`, `search_box`) while the
//! shared contract dispatches on a [`Key`]. Operations a variant cannot
//! answer are `Unsupported` errors, not silent fallbacks.

use crate::avl::AvlIndex;
use crate::btree::BPlusTreeIndex;
use crate::hash::ExtendibleHashIndex;
use crate::isam::IsamIndex;
use crate::rtree::RTreeIndex;
use keystone_common::{
    BoundingBox, IndexOptions, Key, KeystoneError, Record, Result, Sphere,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// The index variants the registry can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Avl,
    BTree,
    Hash,
    Isam,
    RTree,
}

impl IndexType {
    pub const ALL: [IndexType; 5] = [
        IndexType::Avl,
        IndexType::BTree,
        IndexType::Hash,
        IndexType::Isam,
        IndexType::RTree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Avl => "avl",
            IndexType::BTree => "btree",
            IndexType::Hash => "hash",
            IndexType::Isam => "isam",
            IndexType::RTree => "rtree",
        }
    }

    /// Extension of the variant's primary structure file.
    fn extension(&self) -> &'static str {
        match self {
            IndexType::Avl => "avl",
            IndexType::BTree => "bpt",
            IndexType::Hash => "ehx",
            IndexType::Isam => "isam",
            IndexType::RTree => "rtx",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexType {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "avl" => Ok(IndexType::Avl),
            "btree" | "bplustree" | "b+tree" => Ok(IndexType::BTree),
            "hash" | "extendiblehash" => Ok(IndexType::Hash),
            "isam" => Ok(IndexType::Isam),
            "rtree" => Ok(IndexType::RTree),
            _ => Err(KeystoneError::UnknownIndexType(s.to_string())),
        }
    }
}

fn index_path(dir: &Path, name: &str, ty: IndexType) -> PathBuf {
    dir.join(format!("{name}.{}", ty.extension()))
}

fn data_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.jsonl"))
}

/// Opens an index, creating its backing files when they do not exist yet.
pub fn create_index(
    ty: IndexType,
    dir: impl AsRef<Path>,
    name: &str,
    options: IndexOptions,
) -> Result<AnyIndex> {
    let dir = dir.as_ref();
    let index_path = index_path(dir, name, ty);
    let data_path = data_path(dir, name);
    info!(%ty, name, "opening index");

    let index = match ty {
        IndexType::Avl => AnyIndex::Avl(AvlIndex::open(index_path, data_path)?),
        IndexType::BTree => {
            AnyIndex::BTree(BPlusTreeIndex::open(index_path, data_path, options.btree)?)
        }
        IndexType::Hash => {
            AnyIndex::Hash(ExtendibleHashIndex::open(index_path, data_path, options.hash)?)
        }
        IndexType::Isam => AnyIndex::Isam(IsamIndex::open(index_path, data_path, options.isam)?),
        IndexType::RTree => {
            AnyIndex::RTree(RTreeIndex::open(index_path, data_path, options.rtree)?)
        }
    };
    Ok(index)
}

/// Opens an existing index; missing backing files are an error rather than
/// an empty index.
pub fn load_index(
    ty: IndexType,
    dir: impl AsRef<Path>,
    name: &str,
    options: IndexOptions,
) -> Result<AnyIndex> {
    let dir = dir.as_ref();
    let primary = match ty {
        // ISAM splits its structure over derived files.
        IndexType::Isam => {
            let mut os = index_path(dir, name, ty).into_os_string();
            os.push(".pages");
            PathBuf::from(os)
        }
        _ => index_path(dir, name, ty),
    };
    if !primary.exists() {
        return Err(KeystoneError::IndexNotFound(name.to_string()));
    }
    create_index(ty, dir, name, options)
}

/// A live index of any variant. Scalar variants take [`Key::Int`], the
/// R-tree takes [`Key::Spatial`]; the wrong kind is a `KeyTypeMismatch`.
pub enum AnyIndex {
    Avl(AvlIndex),
    BTree(BPlusTreeIndex),
    Hash(ExtendibleHashIndex),
    Isam(IsamIndex),
    RTree(RTreeIndex),
}

impl AnyIndex {
    pub fn index_type(&self) -> IndexType {
        match self {
            AnyIndex::Avl(_) => IndexType::Avl,
            AnyIndex::BTree(_) => IndexType::BTree,
            AnyIndex::Hash(_) => IndexType::Hash,
            AnyIndex::Isam(_) => IndexType::Isam,
            AnyIndex::RTree(_) => IndexType::RTree,
        }
    }

    fn unsupported(&self, op: &'static str) -> KeystoneError {
        KeystoneError::Unsupported {
            op,
            index: self.index_type().as_str(),
        }
    }

    /// Inserts a key and record. `Ok(false)` reports a duplicate key; the
    /// structure and the record log are untouched.
    pub fn insert(&mut self, key: &Key, record: &Record) -> Result<bool> {
        match self {
            AnyIndex::Avl(index) => index.insert(key.as_int()?, record),
            AnyIndex::BTree(index) => index.insert(key.as_int()?, record),
            AnyIndex::Hash(index) => index.insert(key.as_int()?, record),
            AnyIndex::Isam(index) => index.insert(key.as_int()?, record),
            AnyIndex::RTree(index) => index.insert(&key.as_spatial()?, record),
        }
    }

    pub fn search(&self, key: &Key) -> Result<Option<Record>> {
        match self {
            AnyIndex::Avl(index) => index.search(key.as_int()?),
            AnyIndex::BTree(index) => index.search(key.as_int()?),
            AnyIndex::Hash(index) => index.search(key.as_int()?),
            AnyIndex::Isam(index) => index.search(key.as_int()?),
            AnyIndex::RTree(index) => index.search(&key.as_spatial()?),
        }
    }

    /// Records with `low <= key <= high` in key order. Hash and R-tree
    /// have no key order to scan.
    pub fn range_search(&self, low: &Key, high: &Key) -> Result<Vec<Record>> {
        match self {
            AnyIndex::Avl(index) => index.range_search(low.as_int()?, high.as_int()?),
            AnyIndex::BTree(index) => index.range_search(low.as_int()?, high.as_int()?),
            AnyIndex::Isam(index) => index.range_search(low.as_int()?, high.as_int()?),
            AnyIndex::Hash(_) | AnyIndex::RTree(_) => Err(self.unsupported("range_search")),
        }
    }

    /// Spatial containment query; R-tree only.
    pub fn search_box(&self, query: &BoundingBox) -> Result<Vec<Record>> {
        match self {
            AnyIndex::RTree(index) => index.search_box(query),
            _ => Err(self.unsupported("search_box")),
        }
    }

    /// Spatial radius query; R-tree only.
    pub fn search_sphere(&self, query: &Sphere) -> Result<Vec<Record>> {
        match self {
            AnyIndex::RTree(index) => index.search_sphere(query),
            _ => Err(self.unsupported("search_sphere")),
        }
    }

    /// Removes a key. `Ok(false)` reports a miss.
    pub fn delete(&mut self, key: &Key) -> Result<bool> {
        match self {
            AnyIndex::Avl(index) => index.delete(key.as_int()?),
            AnyIndex::BTree(index) => index.delete(key.as_int()?),
            AnyIndex::Hash(index) => index.delete(key.as_int()?),
            AnyIndex::Isam(index) => index.delete(key.as_int()?),
            AnyIndex::RTree(index) => index.delete(&key.as_spatial()?),
        }
    }

    /// Replaces the record under an existing key. `Ok(false)` reports a
    /// miss.
    pub fn update(&mut self, key: &Key, record: &Record) -> Result<bool> {
        match self {
            AnyIndex::Avl(index) => index.update(key.as_int()?, record),
            AnyIndex::BTree(index) => index.update(key.as_int()?, record),
            AnyIndex::Hash(index) => index.update(key.as_int()?, record),
            AnyIndex::Isam(index) => index.update(key.as_int()?, record),
            AnyIndex::RTree(index) => index.update(&key.as_spatial()?, record),
        }
    }

    /// Rewrites the variant's record log with only live records.
    pub fn compact_data_file(&mut self) -> Result<()> {
        match self {
            AnyIndex::Avl(index) => index.compact_data_file(),
            AnyIndex::BTree(index) => index.compact_data_file(),
            AnyIndex::Hash(index) => index.compact_data_file(),
            AnyIndex::Isam(index) => index.compact_data_file(),
            AnyIndex::RTree(index) => index.compact_data_file(),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        match self {
            AnyIndex::Avl(index) => index.len(),
            AnyIndex::BTree(index) => index.len(),
            AnyIndex::Hash(index) => Ok(index.len()),
            AnyIndex::Isam(index) => Ok(index.len()),
            AnyIndex::RTree(index) => Ok(index.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes the index structure and its record log from disk.
    pub fn destroy(self) -> Result<()> {
        match self {
            AnyIndex::Avl(index) => index.destroy(),
            AnyIndex::BTree(index) => index.destroy(),
            AnyIndex::Hash(index) => index.destroy(),
            AnyIndex::Isam(index) => index.destroy(),
            AnyIndex::RTree(index) => index.destroy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(id: i64) -> Record {
        Record::new().with("id", id)
    }

    #[test]
    fn test_index_type_parse_and_display() {
        for ty in IndexType::ALL {
            assert_eq!(ty.as_str().parse::<IndexType>().unwrap(), ty);
            assert_eq!(ty.to_string(), ty.as_str());
        }
        assert_eq!("B+Tree".parse::<IndexType>().unwrap(), IndexType::BTree);
        assert!(matches!(
            "bitmap".parse::<IndexType>(),
            Err(KeystoneError::UnknownIndexType(_))
        ));
    }

    #[test]
    fn test_scalar_contract_through_every_variant() {
        for ty in [IndexType::Avl, IndexType::BTree, IndexType::Hash, IndexType::Isam] {
            let dir = tempdir().unwrap();
            let mut index =
                create_index(ty, dir.path(), "users", IndexOptions::default()).unwrap();

            for id in [5i64, 3, 8, 1] {
                assert!(index.insert(&Key::Int(id), &row(id)).unwrap(), "{ty}");
            }
            assert!(!index.insert(&Key::Int(3), &row(99)).unwrap(), "{ty}");
            assert_eq!(index.search(&Key::Int(8)).unwrap(), Some(row(8)), "{ty}");
            assert!(index.delete(&Key::Int(5)).unwrap(), "{ty}");
            assert_eq!(index.search(&Key::Int(5)).unwrap(), None, "{ty}");
            assert!(index.update(&Key::Int(8), &row(80)).unwrap(), "{ty}");
            assert_eq!(index.search(&Key::Int(8)).unwrap(), Some(row(80)), "{ty}");
            index.compact_data_file().unwrap();
            assert_eq!(index.len().unwrap(), 3, "{ty}");
        }
    }

    #[test]
    fn test_key_type_mismatch() {
        let dir = tempdir().unwrap();
        let mut avl = create_index(IndexType::Avl, dir.path(), "a", IndexOptions::default())
            .unwrap();
        let spatial = Key::Spatial(BoundingBox::point([1.0, 2.0, 3.0]));
        assert!(matches!(
            avl.insert(&spatial, &row(1)),
            Err(KeystoneError::KeyTypeMismatch { expected: "integer", .. })
        ));

        let mut rtree = create_index(IndexType::RTree, dir.path(), "r", IndexOptions::default())
            .unwrap();
        assert!(matches!(
            rtree.insert(&Key::Int(1), &row(1)),
            Err(KeystoneError::KeyTypeMismatch { expected: "spatial", .. })
        ));
    }

    #[test]
    fn test_unsupported_operations() {
        let dir = tempdir().unwrap();
        let hash = create_index(IndexType::Hash, dir.path(), "h", IndexOptions::default())
            .unwrap();
        assert!(matches!(
            hash.range_search(&Key::Int(0), &Key::Int(10)),
            Err(KeystoneError::Unsupported { op: "range_search", index: "hash" })
        ));
        assert!(matches!(
            hash.search_box(&BoundingBox::point([0.0; 3])),
            Err(KeystoneError::Unsupported { op: "search_box", .. })
        ));

        let rtree = create_index(IndexType::RTree, dir.path(), "r", IndexOptions::default())
            .unwrap();
        assert!(matches!(
            rtree.range_search(&Key::Int(0), &Key::Int(10)),
            Err(KeystoneError::Unsupported { op: "range_search", index: "rtree" })
        ));
    }

    #[test]
    fn test_load_requires_existing_files() {
        let dir = tempdir().unwrap();
        for ty in IndexType::ALL {
            assert!(
                matches!(
                    load_index(ty, dir.path(), "ghost", IndexOptions::default()),
                    Err(KeystoneError::IndexNotFound(_))
                ),
                "{ty}"
            );
        }

        create_index(IndexType::BTree, dir.path(), "users", IndexOptions::default())
            .unwrap();
        let loaded =
            load_index(IndexType::BTree, dir.path(), "users", IndexOptions::default()).unwrap();
        assert!(loaded.is_empty().unwrap());
    }

    #[test]
    fn test_destroy_removes_files() {
        let dir = tempdir().unwrap();
        let mut index =
            create_index(IndexType::Isam, dir.path(), "users", IndexOptions::default()).unwrap();
        index.insert(&Key::Int(1), &row(1)).unwrap();
        index.destroy().unwrap();
        assert!(matches!(
            load_index(IndexType::Isam, dir.path(), "users", IndexOptions::default()),
            Err(KeystoneError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_spatial_queries_through_registry() {
        let dir = tempdir().unwrap();
        let mut index =
            create_index(IndexType::RTree, dir.path(), "places", IndexOptions::default()).unwrap();
        for (name, x, y) in [("a", 1.0, 1.0), ("b", 2.0, 2.0), ("c", 9.0, 9.0)] {
            let key = Key::Spatial(BoundingBox::point([x, y, 0.0]));
            index.insert(&key, &Record::new().with("name", name)).unwrap();
        }
        let hits = index
            .search_box(&BoundingBox::new([0.0, 0.0, 0.0], [3.0, 3.0, 0.0]))
            .unwrap();
        assert_eq!(hits.len(), 2);
        let hits = index
            .search_sphere(&Sphere::new([9.0, 9.0, 0.0], 0.5))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
