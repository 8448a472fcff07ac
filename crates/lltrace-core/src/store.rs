//! Frame-indexed storage.
//!
//! Each key owns a vector of `(effective_frame, value)` pairs kept in
//! non-decreasing frame order, so "the value as of frame N" is a binary search.
//! Inserts happen only on the authoritative pass, in frame order; an insert
//! older than the newest entry for its key is refused.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::StoreError;

/// Time-ordered values for a single key
#[derive(Debug, Clone)]
pub struct FrameIndexedSeries<T> {
    entries: Vec<(u32, T)>,
}

impl<T> Default for FrameIndexedSeries<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> FrameIndexedSeries<T> {
    /// Create an empty series
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value effective from `frame`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfOrderInsert` if `frame` precedes the newest entry.
    pub fn push(&mut self, frame: u32, value: T) -> Result<(), StoreError> {
        if let Some(&(last, _)) = self.entries.last() {
            if frame < last {
                return Err(StoreError::OutOfOrderInsert {
                    last,
                    attempted: frame,
                });
            }
        }
        self.entries.push((frame, value));
        Ok(())
    }

    fn position_at_or_before(&self, frame: u32) -> Option<usize> {
        self.entries
            .partition_point(|&(effective, _)| effective <= frame)
            .checked_sub(1)
    }

    /// Most recent entry whose effective frame is `<= frame`
    #[must_use]
    pub fn at_or_before(&self, frame: u32) -> Option<(u32, &T)> {
        self.position_at_or_before(frame)
            .map(|i| (self.entries[i].0, &self.entries[i].1))
    }

    /// Mutable access to the most recent entry whose effective frame is `<= frame`
    pub fn at_or_before_mut(&mut self, frame: u32) -> Option<(u32, &mut T)> {
        let i = self.position_at_or_before(frame)?;
        let (effective, value) = &mut self.entries[i];
        Some((*effective, value))
    }

    /// Newest entry
    #[must_use]
    pub fn latest(&self) -> Option<(u32, &T)> {
        self.entries.last().map(|(frame, value)| (*frame, value))
    }

    /// Mutable access to the newest entry
    pub fn latest_mut(&mut self) -> Option<(u32, &mut T)> {
        self.entries
            .last_mut()
            .map(|(frame, value)| (*frame, value))
    }

    /// Entries in effective-frame order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries.iter().map(|(frame, value)| (*frame, value))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the series is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keyed collection of [`FrameIndexedSeries`]
#[derive(Debug, Clone)]
pub struct FrameIndexedStore<K, T> {
    series: HashMap<K, FrameIndexedSeries<T>>,
}

impl<K, T> Default for FrameIndexedStore<K, T> {
    fn default() -> Self {
        Self {
            series: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, T> FrameIndexedStore<K, T> {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `key`, effective from `frame`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfOrderInsert` when `frame` precedes the newest
    /// entry for `key`; the value is dropped.
    pub fn upsert(&mut self, key: K, frame: u32, value: T) -> Result<(), StoreError> {
        self.series.entry(key).or_default().push(frame, value)
    }

    /// Value for `key` as of `frame`
    #[must_use]
    pub fn lookup_at_or_before(&self, key: &K, frame: u32) -> Option<(u32, &T)> {
        self.series.get(key)?.at_or_before(frame)
    }

    /// Mutable value for `key` as of `frame`
    pub fn lookup_at_or_before_mut(&mut self, key: &K, frame: u32) -> Option<(u32, &mut T)> {
        self.series.get_mut(key)?.at_or_before_mut(frame)
    }

    /// Newest value for `key`
    #[must_use]
    pub fn latest(&self, key: &K) -> Option<(u32, &T)> {
        self.series.get(key)?.latest()
    }

    /// All entries for `key`
    #[must_use]
    pub fn series(&self, key: &K) -> Option<&FrameIndexedSeries<T>> {
        self.series.get(key)
    }

    /// Iterate over every key and its series
    pub fn iter(&self) -> impl Iterator<Item = (&K, &FrameIndexedSeries<T>)> {
        self.series.iter()
    }

    /// Iterate mutably over every key and its series
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut FrameIndexedSeries<T>)> {
        self.series.iter_mut()
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_at_or_before() {
        let mut store = FrameIndexedStore::new();
        store.upsert("a", 10, 1).unwrap();
        store.upsert("a", 20, 2).unwrap();
        store.upsert("a", 30, 3).unwrap();

        assert_eq!(store.lookup_at_or_before(&"a", 5), None);
        assert_eq!(store.lookup_at_or_before(&"a", 10), Some((10, &1)));
        assert_eq!(store.lookup_at_or_before(&"a", 25), Some((20, &2)));
        assert_eq!(store.lookup_at_or_before(&"a", u32::MAX), Some((30, &3)));
        assert_eq!(store.lookup_at_or_before(&"b", 25), None);
    }

    #[test]
    fn test_out_of_order_insert_rejected() {
        let mut store = FrameIndexedStore::new();
        store.upsert(1u32, 20, "x").unwrap();
        assert_eq!(
            store.upsert(1u32, 10, "y"),
            Err(StoreError::OutOfOrderInsert {
                last: 20,
                attempted: 10
            })
        );
        assert_eq!(store.series(&1).unwrap().len(), 1);
    }

    #[test]
    fn test_equal_frame_insert_allowed() {
        let mut series = FrameIndexedSeries::new();
        series.push(5, 'a').unwrap();
        series.push(5, 'b').unwrap();
        assert_eq!(series.at_or_before(5), Some((5, &'b')));
    }

    #[test]
    fn test_mutable_lookup() {
        let mut store = FrameIndexedStore::new();
        store.upsert(0u8, 1, vec![1]).unwrap();
        if let Some((_, v)) = store.lookup_at_or_before_mut(&0, 9) {
            v.push(2);
        }
        assert_eq!(store.latest(&0), Some((1, &vec![1, 2])));
    }
}
