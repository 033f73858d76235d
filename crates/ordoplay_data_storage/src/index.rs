// SPDX-License-Identifier: MIT OR Apache-2.0
//! Identity index: maps external identity hashes to rows.

use crate::row::RowHandle;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Hash identifying a row from outside the storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexHash(pub u64);

impl IndexHash {
    /// Hash any hashable identity
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl fmt::Display for IndexHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Forward and reverse identity maps
#[derive(Debug, Default)]
pub(crate) struct RowIndex {
    rows: HashMap<IndexHash, RowHandle>,
    hashes: HashMap<RowHandle, Vec<IndexHash>>,
}

impl RowIndex {
    pub fn find(&self, hash: IndexHash) -> Option<RowHandle> {
        self.rows.get(&hash).copied()
    }

    pub fn insert(&mut self, hash: IndexHash, row: RowHandle) {
        if let Some(previous) = self.rows.insert(hash, row) {
            if previous == row {
                return;
            }
            self.forget_hash(previous, hash);
        }
        self.hashes.entry(row).or_default().push(hash);
    }

    /// Move the row registered under `original` to `hash`
    pub fn reindex(&mut self, original: IndexHash, hash: IndexHash, row: RowHandle) {
        if let Some(previous) = self.rows.remove(&original) {
            self.forget_hash(previous, original);
        }
        self.insert(hash, row);
    }

    pub fn remove(&mut self, hash: IndexHash) -> Option<RowHandle> {
        let row = self.rows.remove(&hash)?;
        self.forget_hash(row, hash);
        Some(row)
    }

    /// Drop every hash pointing at `row`
    pub fn remove_row(&mut self, row: RowHandle) -> usize {
        let Some(hashes) = self.hashes.remove(&row) else {
            return 0;
        };
        for hash in &hashes {
            self.rows.remove(hash);
        }
        hashes.len()
    }

    pub fn hashes(&self, row: RowHandle) -> &[IndexHash] {
        self.hashes.get(&row).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    fn forget_hash(&mut self, row: RowHandle, hash: IndexHash) {
        if let Some(hashes) = self.hashes.get_mut(&row) {
            hashes.retain(|existing| *existing != hash);
            if hashes.is_empty() {
                self.hashes.remove(&row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowSlots;

    #[test]
    fn test_reverse_map_follows_forward_map() {
        let mut slots = RowSlots::default();
        let (a, b) = (slots.reserve(), slots.reserve());
        let mut index = RowIndex::default();
        index.insert(IndexHash(1), a);
        index.insert(IndexHash(2), a);
        index.insert(IndexHash(2), b);
        assert_eq!(index.hashes(a), &[IndexHash(1)]);
        assert_eq!(index.find(IndexHash(2)), Some(b));

        index.reindex(IndexHash(1), IndexHash(3), a);
        assert_eq!(index.find(IndexHash(1)), None);
        assert_eq!(index.find(IndexHash(3)), Some(a));

        assert_eq!(index.remove_row(b), 1);
        assert_eq!(index.find(IndexHash(2)), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(IndexHash::of(&42_u64), IndexHash::of(&42_u64));
        assert_ne!(IndexHash::of(&42_u64), IndexHash::of(&43_u64));
    }
}
