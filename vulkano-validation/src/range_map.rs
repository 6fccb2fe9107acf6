// The storage layout of this map comes from the rangemap crate, which is licensed under either of
// - Apache License, Version 2.0 (https://github.com/jeffparsons/rangemap/blob/master/LICENSE-APACHE
//   or http://www.apache.org/licenses/LICENSE-2.0)
// - MIT (https://github.com/jeffparsons/rangemap/blob/master/LICENSE-MIT or http://opensource.org/licenses/MIT)
// at your option.
//
// The following changes were made:
// - The range start is used as the key and the end is stored in the value (in `Entry`).
// - Insertion splits at the bounds of the new range and then coalesces with its neighbours.
// - Iteration over a range clips the returned ranges to the queried range.
// - `gaps`, `update` and `merge_from` were added, removal was dropped.

use smallvec::SmallVec;
use std::{
    cmp,
    collections::{btree_map, BTreeMap},
    fmt::{Debug, Error as FmtError, Formatter},
    iter::{FromIterator, FusedIterator},
    ops::{Bound, Range},
};

/// A map whose keys are stored as (half-open) ranges bounded
/// inclusively below and exclusively above `(start..end)`.
///
/// Stored ranges never overlap. Adjacent ranges that map to the same value are coalesced into a
/// single range, so two maps holding the same mapping always have the same entries.
#[derive(Clone, PartialEq, Eq)]
pub struct RangeMap<K, V> {
    // Stores the range start in the key and the range end in the corresponding value.
    btm: BTreeMap<K, Entry<K, V>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry<K, V> {
    end: K,
    value: V,
}

impl<K, V> Default for RangeMap<K, V>
where
    K: Ord + Clone,
    V: Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RangeMap<K, V>
where
    K: Ord + Clone,
    V: Eq + Clone,
{
    /// Makes a new empty `RangeMap`.
    #[inline]
    pub fn new() -> Self {
        RangeMap {
            btm: BTreeMap::new(),
        }
    }

    /// Returns the number of stored ranges.
    #[inline]
    pub fn len(&self) -> usize {
        self.btm.len()
    }

    /// Returns `true` if no range is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.btm.is_empty()
    }

    /// Removes all ranges.
    #[inline]
    pub fn clear(&mut self) {
        self.btm.clear();
    }

    /// Returns a reference to the value corresponding to the given key,
    /// if the key is covered by any range in the map.
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.get_key_value(key).map(|(_range, value)| value)
    }

    /// Returns the range-value pair (as a pair of references) corresponding
    /// to the given key, if the key is covered by any range in the map.
    #[inline]
    pub fn get_key_value(&self, key: &K) -> Option<(Range<K>, &V)> {
        self.btm
            // The only stored range that could contain the given key is the
            // last stored range whose start is less than or equal to this key.
            .range((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(_start, Entry { end, value: _ })| end > key)
            .map(|(start, Entry { end, value })| (start.clone()..end.clone(), value))
    }

    /// Gets an iterator over all pairs of key range and value,
    /// ordered by key range.
    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.btm.iter(),
        }
    }

    /// Insert a pair of key range and value into the map.
    ///
    /// Any stored range that overlaps the inserted range is cut back to the part outside of it.
    /// If the inserted range ends up immediately adjacent to a stored range _mapping to the same
    /// value_, then the two are coalesced into a single range.
    ///
    /// # Panics
    ///
    /// Panics if range `start >= end`.
    pub fn insert(&mut self, range: Range<K>, value: V) {
        // Empty ranges don't represent anything meaningful in this structure.
        assert!(range.start < range.end);

        self.split_at(&range.start);
        self.split_at(&range.end);

        let covered: SmallVec<[K; 8]> = self
            .btm
            .range((Bound::Included(&range.start), Bound::Excluded(&range.end)))
            .map(|(start, _)| start.clone())
            .collect();

        for start in covered {
            self.btm.remove(&start);
        }

        let Range { mut start, mut end } = range;

        // Coalesce with the range that ends where the new one starts.
        let preceding = self
            .btm
            .range((Bound::Unbounded, Bound::Excluded(&start)))
            .next_back()
            .filter(|(_, entry)| entry.end == start && entry.value == value)
            .map(|(prev_start, _)| prev_start.clone());

        if let Some(prev_start) = preceding {
            self.btm.remove(&prev_start);
            start = prev_start;
        }

        // Coalesce with the range that starts where the new one ends.
        if self.btm.get(&end).is_some_and(|entry| entry.value == value) {
            if let Some(next) = self.btm.remove(&end) {
                end = next.end;
            }
        }

        self.btm.insert(start, Entry { end, value });
    }

    /// Splits a range in two at the provided key.
    ///
    /// Does nothing if no range exists at the key, or if the key is at a range boundary.
    pub fn split_at(&mut self, key: &K) {
        // Find a range that contains the key, but doesn't start or end with the key.
        let bounds = (Bound::Unbounded, Bound::Excluded(key.clone()));

        if let Some((_start, entry)) = self
            .btm
            .range_mut(bounds)
            .next_back()
            .filter(|(_start, Entry { end, value: _ })| end > key)
        {
            let second_half_entry = entry.clone();
            // Adjust the end of the range.
            entry.end = key.clone();
            // Insert the second half of the range.
            self.btm.insert(key.clone(), second_half_entry);
        }
    }

    /// Gets an iterator over all pairs of key range and value, where the key range overlaps with
    /// the provided range. The returned key ranges are clipped to the provided range.
    pub fn range(&self, range: &Range<K>) -> RangeIter<'_, K, V> {
        let start = self
            .get_key_value(&range.start)
            .map_or(range.start.clone(), |(k, _v)| k.start);

        RangeIter {
            inner: self
                .btm
                .range((Bound::Included(start), Bound::Excluded(range.end.clone()))),
            bounds: range.clone(),
        }
    }

    /// Returns the parts of the provided range that are not covered by any stored range, in
    /// ascending order.
    pub fn gaps(&self, range: &Range<K>) -> SmallVec<[Range<K>; 4]> {
        let mut gaps = SmallVec::new();
        let mut cursor = range.start.clone();

        for (covered, _) in self.range(range) {
            if cursor < covered.start {
                gaps.push(cursor..covered.start.clone());
            }

            cursor = covered.end;
        }

        if cursor < range.end {
            gaps.push(cursor..range.end.clone());
        }

        gaps
    }

    /// Replaces the value of every part of the provided range with the result of `f`.
    ///
    /// `f` is called once for each stored range overlapping `range`, with its value, and once for
    /// each gap in `range`, with `None`.
    pub fn update(&mut self, range: Range<K>, mut f: impl FnMut(Option<&V>) -> V) {
        if range.start >= range.end {
            return;
        }

        let mut pieces: SmallVec<[(Range<K>, Option<V>); 4]> = self
            .range(&range)
            .map(|(piece, value)| (piece, Some(value.clone())))
            .collect();
        pieces.extend(self.gaps(&range).into_iter().map(|gap| (gap, None)));

        for (piece, value) in pieces {
            let new_value = f(value.as_ref());
            self.insert(piece, new_value);
        }
    }

    /// Folds all ranges of `other` into this map, in ascending order, converting each value
    /// with `f`. Where both maps cover a key, the value from `other` wins.
    pub fn merge_from<W>(&mut self, other: &RangeMap<K, W>, mut f: impl FnMut(&W) -> V)
    where
        W: Eq + Clone,
    {
        for (range, value) in other.iter() {
            self.insert(range, f(value));
        }
    }
}

/// An iterator over the entries of a `RangeMap`, ordered by key range.
///
/// The iterator element type is `(Range<K>, &'a V)`.
///
/// This `struct` is created by the [`iter`] method on [`RangeMap`]. See its
/// documentation for more.
///
/// [`iter`]: RangeMap::iter
pub struct Iter<'a, K, V> {
    inner: btree_map::Iter<'a, K, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: 'a + Clone,
    V: 'a,
{
    type Item = (Range<K>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(start, Entry { end, value })| (start.clone()..end.clone(), value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a, K, V> FusedIterator for Iter<'a, K, V> where K: Ord + Clone {}
impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> where K: Ord + Clone {}

/// An iterator over entries of a `RangeMap` whose range overlaps with a specified range.
///
/// The iterator element type is `(Range<K>, &'a V)`, with the range clipped to the specified
/// range.
///
/// This `struct` is created by the [`range`] method on [`RangeMap`]. See its
/// documentation for more.
///
/// [`range`]: RangeMap::range
pub struct RangeIter<'a, K, V> {
    inner: btree_map::Range<'a, K, Entry<K, V>>,
    bounds: Range<K>,
}

impl<'a, K, V> FusedIterator for RangeIter<'a, K, V> where K: Ord + Clone {}

impl<'a, K, V> Iterator for RangeIter<'a, K, V>
where
    K: 'a + Ord + Clone,
    V: 'a,
{
    type Item = (Range<K>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let bounds = &self.bounds;

        self.inner.next().map(|(start, Entry { end, value })| {
            let start = cmp::max(start, &bounds.start).clone();
            let end = cmp::min(end, &bounds.end).clone();
            (start..end, value)
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

// We can't just derive this automatically, because that would
// expose irrelevant (and private) implementation details.
// Instead implement it in the same way that the underlying BTreeMap does.
impl<K: Debug, V: Debug> Debug for RangeMap<K, V>
where
    K: Ord + Clone,
    V: Eq + Clone,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(Range<K>, V)> for RangeMap<K, V>
where
    K: Ord + Clone,
    V: Eq + Clone,
{
    fn from_iter<T: IntoIterator<Item = (Range<K>, V)>>(iter: T) -> Self {
        let mut range_map = RangeMap::new();
        range_map.extend(iter);
        range_map
    }
}

impl<K, V> Extend<(Range<K>, V)> for RangeMap<K, V>
where
    K: Ord + Clone,
    V: Eq + Clone,
{
    fn extend<T: IntoIterator<Item = (Range<K>, V)>>(&mut self, iter: T) {
        iter.into_iter().for_each(move |(k, v)| {
            self.insert(k, v);
        })
    }
}
