//! Named-object directory: ordered map from name to segment location.
//!
//! The directory never stores pointers. Entries carry offsets and element
//! counts so they stay valid across sessions regardless of where the
//! segment lands in the address space. Locking is the kernel's job; the
//! directory itself is a plain data structure.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How an object was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// User-supplied name.
    Named,
    /// Keyed by the compile-time type identity; one per type per region.
    Unique,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Lookup key. The type identity string for unique objects.
    pub name: String,
    /// Byte offset of the object within the data segment.
    pub offset: u64,
    /// Element count (1 for a scalar, n for an array).
    pub length: usize,
    /// Compile-time type identity recorded at construction.
    pub type_name: String,
    /// Registration kind.
    pub kind: ObjectKind,
    /// Free-form per-object description.
    #[serde(default)]
    pub description: String,
}

/// Ordered mapping from byte-string name to `(offset, length, kind)`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDirectory {
    entries: BTreeMap<String, ObjectEntry>,
}

impl ObjectDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry by name.
    #[inline]
    pub fn find(&self, name: &str) -> Option<&ObjectEntry> {
        self.entries.get(name)
    }

    /// Mutable lookup by name.
    #[inline]
    pub fn find_mut(&mut self, name: &str) -> Option<&mut ObjectEntry> {
        self.entries.get_mut(name)
    }

    /// Find the entry whose allocation starts at `offset`.
    pub fn find_by_offset(&self, offset: u64) -> Option<&ObjectEntry> {
        self.entries.values().find(|e| e.offset == offset)
    }

    /// Mutable variant of [`find_by_offset`].
    ///
    /// [`find_by_offset`]: ObjectDirectory::find_by_offset
    pub fn find_by_offset_mut(&mut self, offset: u64) -> Option<&mut ObjectEntry> {
        self.entries.values_mut().find(|e| e.offset == offset)
    }

    /// Register an entry. Returns false (and leaves the directory untouched)
    /// if the name is already present.
    pub fn insert(&mut self, entry: ObjectEntry) -> bool {
        if self.entries.contains_key(&entry.name) {
            return false;
        }
        self.entries.insert(entry.name.clone(), entry);
        true
    }

    /// Remove and return the entry for `name`.
    pub fn erase(&mut self, name: &str) -> Option<ObjectEntry> {
        self.entries.remove(name)
    }

    /// Iterate entries of one kind in name order.
    pub fn iter_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.values().filter(move |e| e.kind == kind)
    }

    /// Number of entries of one kind.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.iter_kind(kind).count()
    }

    /// Total number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the directory to `path`.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Reconstruct a directory persisted with [`serialize`].
    ///
    /// [`serialize`]: ObjectDirectory::serialize
    pub fn deserialize(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, offset: u64, kind: ObjectKind) -> ObjectEntry {
        ObjectEntry {
            name: name.to_string(),
            offset,
            length: 1,
            type_name: "i32".to_string(),
            kind,
            description: String::new(),
        }
    }

    #[test]
    fn test_insert_find_erase() {
        let mut dir = ObjectDirectory::new();
        assert!(dir.insert(entry("counter", 0, ObjectKind::Named)));
        assert!(dir.insert(entry("flags", 64, ObjectKind::Named)));

        assert_eq!(dir.find("counter").unwrap().offset, 0);
        assert!(dir.find("missing").is_none());

        // Name collision leaves the original untouched.
        let mut dup = entry("counter", 128, ObjectKind::Named);
        dup.type_name = "u64".to_string();
        assert!(!dir.insert(dup));
        assert_eq!(dir.find("counter").unwrap().offset, 0);
        assert_eq!(dir.find("counter").unwrap().type_name, "i32");

        let erased = dir.erase("counter").unwrap();
        assert_eq!(erased.offset, 0);
        assert!(dir.find("counter").is_none());
        assert!(dir.erase("counter").is_none());
    }

    #[test]
    fn test_empty_string_is_a_valid_name() {
        let mut dir = ObjectDirectory::new();
        assert!(dir.insert(entry("", 0, ObjectKind::Named)));
        assert!(dir.find("").is_some());
        assert!(!dir.insert(entry("", 64, ObjectKind::Named)));
    }

    #[test]
    fn test_kind_filtered_iteration() {
        let mut dir = ObjectDirectory::new();
        dir.insert(entry("a", 0, ObjectKind::Named));
        dir.insert(entry("b", 64, ObjectKind::Named));
        dir.insert(entry("core::num::Wrapping<u32>", 128, ObjectKind::Unique));

        assert_eq!(dir.count(ObjectKind::Named), 2);
        assert_eq!(dir.count(ObjectKind::Unique), 1);

        let named: Vec<_> = dir.iter_kind(ObjectKind::Named).map(|e| e.name.as_str()).collect();
        assert_eq!(named, ["a", "b"]);
    }

    #[test]
    fn test_find_by_offset() {
        let mut dir = ObjectDirectory::new();
        dir.insert(entry("a", 0, ObjectKind::Named));
        dir.insert(entry("b", 4096, ObjectKind::Named));

        assert_eq!(dir.find_by_offset(4096).unwrap().name, "b");
        assert!(dir.find_by_offset(17).is_none());
    }

    #[test]
    fn test_serialize_roundtrip_identity() {
        let mut dir = ObjectDirectory::new();
        dir.insert(entry("a", 0, ObjectKind::Named));
        let mut u = entry("std::string::String", 64, ObjectKind::Unique);
        u.description = "the singleton".to_string();
        u.length = 7;
        dir.insert(u);

        let path = std::env::temp_dir().join(format!(
            "duraheap-dir-roundtrip-{}",
            std::process::id()
        ));
        dir.serialize(&path).unwrap();
        let restored = ObjectDirectory::deserialize(&path).unwrap();
        assert_eq!(dir, restored);

        std::fs::remove_file(&path).unwrap();
    }
}
