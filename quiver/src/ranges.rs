// Copyright (C) 2018-2019, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Ordered sets of non-overlapping integer ranges.
//!
//! Backs the acknowledgement, symbol-acknowledgement and recovered-packet
//! bookkeeping. Adjacent ranges are merged on insertion, so the set always
//! holds the minimal number of intervals covering the inserted values.

use std::ops::Range;

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::Bound;

use crate::Error;
use crate::Result;

/// An ordered set of non-overlapping `u64` ranges.
///
/// The set holds at most `capacity` disjoint intervals; inserting a value
/// that would create one more fails with [`Error::TooManyRanges`].
#[derive(Clone, PartialEq, Eq, PartialOrd)]
pub struct RangeSet {
    inner: BTreeMap<u64, u64>,

    capacity: usize,
}

impl RangeSet {
    /// Creates an empty set holding at most `capacity` disjoint ranges.
    pub fn new(capacity: usize) -> Self {
        RangeSet {
            inner: BTreeMap::default(),
            capacity,
        }
    }

    /// Inserts all values of `item` into the set, merging with existing
    /// ranges where they overlap or touch.
    pub fn insert(&mut self, item: Range<u64>) -> Result<()> {
        let mut start = item.start;
        let mut end = item.end;

        // Check if preceding existing range overlaps or is adjacent to the
        // new one.
        if let Some(r) = self.prev_to(start) {
            if range_touches(&r, &item) {
                if item.start >= r.start && item.end <= r.end {
                    // Fully covered, nothing to do.
                    return Ok(());
                }

                self.inner.remove(&r.start);

                start = std::cmp::min(start, r.start);
                end = std::cmp::max(end, r.end);
            }
        }

        // Check if following existing ranges overlap or touch the new one.
        while let Some(r) = self.next_to(start) {
            if !range_touches(&r, &(start..end)) {
                break;
            }

            self.inner.remove(&r.start);

            start = std::cmp::min(start, r.start);
            end = std::cmp::max(end, r.end);
        }

        if self.inner.len() >= self.capacity {
            return Err(Error::TooManyRanges);
        }

        self.inner.insert(start, end);

        Ok(())
    }

    /// Inserts a single value.
    pub fn push_item(&mut self, item: u64) -> Result<()> {
        self.insert(item..item + 1)
    }

    /// Removes all values lower than or equal to `largest`.
    pub fn remove_until(&mut self, largest: u64) {
        let ranges: Vec<Range<u64>> = self
            .inner
            .range((Bound::Unbounded, Bound::Included(&largest)))
            .map(|(&s, &e)| (s..e))
            .collect();

        for r in ranges {
            self.inner.remove(&r.start);

            if r.end > largest + 1 {
                self.inner.insert(largest + 1, r.end);
            }
        }
    }

    /// Returns whether `item` is covered by the set.
    pub fn contains(&self, item: u64) -> bool {
        match self.prev_to(item) {
            Some(r) => r.contains(&item),
            None => false,
        }
    }

    /// The smallest value in the set.
    pub fn first(&self) -> Option<u64> {
        self.flatten().next()
    }

    /// The largest value in the set.
    pub fn last(&self) -> Option<u64> {
        self.flatten().next_back()
    }

    /// The number of disjoint ranges in the set.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over the ranges in ascending order. The iterator is
    /// double-ended, so `rev()` yields ranges highest-first for ACK
    /// serialization.
    pub fn iter(&self) -> Iter {
        Iter {
            inner: self.inner.iter(),
        }
    }

    /// Iterates over the individual values in the set.
    pub fn flatten(&self) -> Flatten {
        Flatten {
            inner: self.inner.iter(),
            next: 0,
            end: 0,
        }
    }

    fn prev_to(&self, item: u64) -> Option<Range<u64>> {
        self.inner
            .range((Bound::Unbounded, Bound::Included(item)))
            .map(|(&s, &e)| (s..e))
            .next_back()
    }

    fn next_to(&self, item: u64) -> Option<Range<u64>> {
        self.inner
            .range((Bound::Included(item), Bound::Unbounded))
            .map(|(&s, &e)| (s..e))
            .next()
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

// A `RangeSet` with a single range is equivalent to a plain `Range`, which
// makes test assertions terser.
impl PartialEq<Range<u64>> for RangeSet {
    fn eq(&self, other: &Range<u64>) -> bool {
        if self.inner.len() != 1 {
            return false;
        }

        let (&start, &end) = self.inner.iter().next().unwrap();

        (start..end) == *other
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ranges: Vec<Range<u64>> = self
            .iter()
            .map(|mut r| {
                r.end -= 1;
                r
            })
            .collect();

        write!(f, "{ranges:?}")
    }
}

/// Iterator over the disjoint ranges of a [`RangeSet`].
pub struct Iter<'a> {
    inner: btree_map::Iter<'a, u64, u64>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.inner.next()?;
        Some(start..end)
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.inner.next_back()?;
        Some(start..end)
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Iterator over the individual values of a [`RangeSet`].
pub struct Flatten<'a> {
    inner: btree_map::Iter<'a, u64, u64>,
    next: u64,
    end: u64,
}

impl<'a> Iterator for Flatten<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.next == self.end {
            let (&start, &end) = self.inner.next()?;

            self.next = start;
            self.end = end;
        }

        let next = self.next;
        self.next += 1;

        Some(next)
    }
}

impl<'a> DoubleEndedIterator for Flatten<'a> {
    fn next_back(&mut self) -> Option<u64> {
        if self.next == self.end {
            let (&start, &end) = self.inner.next_back()?;

            self.next = start;
            self.end = end;
        }

        self.end -= 1;

        Some(self.end)
    }
}

// Overlapping or exactly adjacent, i.e. merging would produce one range.
fn range_touches(r: &Range<u64>, other: &Range<u64>) -> bool {
    other.start <= r.end && r.start <= other.end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_non_overlapping() {
        let mut r = RangeSet::default();
        assert_eq!(r.len(), 0);
        let empty: &[u64] = &[];
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &empty);

        r.insert(4..7).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[4, 5, 6]);

        r.insert(9..12).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[4, 5, 6, 9, 10, 11]);
    }

    #[test]
    fn insert_contained() {
        let mut r = RangeSet::default();

        r.insert(4..7).unwrap();
        r.insert(9..12).unwrap();

        r.insert(4..7).unwrap();
        r.insert(4..6).unwrap();
        r.insert(5..6).unwrap();
        r.insert(10..11).unwrap();
        r.insert(9..11).unwrap();

        assert_eq!(r.len(), 2);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[4, 5, 6, 9, 10, 11]);
    }

    #[test]
    fn insert_overlapping() {
        let mut r = RangeSet::default();

        r.insert(3..6).unwrap();
        r.insert(9..12).unwrap();
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[3, 4, 5, 9, 10, 11]);

        r.insert(5..7).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            3, 4, 5, 6, 9, 10, 11
        ]);

        r.insert(10..15).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            3, 4, 5, 6, 9, 10, 11, 12, 13, 14
        ]);

        r.insert(6..10).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14
        ]);
    }

    #[test]
    fn insert_overlapping_multi() {
        let mut r = RangeSet::default();

        r.insert(3..6).unwrap();
        r.insert(10..11).unwrap();
        r.insert(13..14).unwrap();
        r.insert(16..20).unwrap();
        assert_eq!(r.len(), 4);

        r.insert(4..17).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19
        ]);
    }

    #[test]
    fn push_item_merges_adjacent() {
        let mut r = RangeSet::default();

        r.push_item(4).unwrap();
        r.push_item(5).unwrap();
        r.push_item(6).unwrap();
        assert_eq!(r.len(), 1);

        r.push_item(9).unwrap();
        assert_eq!(r.len(), 2);

        r.push_item(8).unwrap();
        r.push_item(7).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[4, 5, 6, 7, 8, 9]);

        // Duplicates are a no-op.
        r.push_item(5).unwrap();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn capacity() {
        let mut r = RangeSet::new(3);

        r.push_item(10).unwrap();
        r.push_item(13).unwrap();
        r.push_item(16).unwrap();

        // A fourth disjoint range exceeds the capacity.
        assert_eq!(r.push_item(1), Err(Error::TooManyRanges));

        // Merging inserts still succeed at capacity.
        r.push_item(11).unwrap();
        r.push_item(12).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            10, 11, 12, 13, 16
        ]);
    }

    #[test]
    fn remove_until() {
        let mut r = RangeSet::default();

        r.insert(3..6).unwrap();
        r.insert(9..11).unwrap();
        r.insert(13..14).unwrap();
        r.insert(16..20).unwrap();

        r.remove_until(2);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            3, 4, 5, 9, 10, 13, 16, 17, 18, 19
        ]);

        r.remove_until(4);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[
            5, 9, 10, 13, 16, 17, 18, 19
        ]);

        r.remove_until(10);
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[13, 16, 17, 18, 19]);

        r.remove_until(20);

        let empty: &[u64] = &[];
        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &empty);
    }

    #[test]
    fn contains() {
        let mut r = RangeSet::default();

        r.insert(4..7).unwrap();
        r.insert(9..12).unwrap();

        assert!(!r.contains(3));
        assert!(r.contains(4));
        assert!(r.contains(6));
        assert!(!r.contains(7));
        assert!(!r.contains(8));
        assert!(r.contains(9));
        assert!(r.contains(11));
        assert!(!r.contains(12));
    }

    #[test]
    fn descending_ranges() {
        let mut r = RangeSet::default();

        r.insert(4..7).unwrap();
        r.insert(9..12).unwrap();
        r.insert(15..16).unwrap();

        let desc: Vec<Range<u64>> = r.iter().rev().collect();
        assert_eq!(desc, vec![15..16, 9..12, 4..7]);
    }

    #[test]
    fn flatten_rev() {
        let mut r = RangeSet::default();

        r.insert(4..7).unwrap();
        r.insert(9..12).unwrap();

        assert_eq!(&r.flatten().collect::<Vec<u64>>(), &[4, 5, 6, 9, 10, 11]);
        assert_eq!(&r.flatten().rev().collect::<Vec<u64>>(), &[
            11, 10, 9, 6, 5, 4
        ]);
    }

    #[test]
    fn first_last() {
        let mut r = RangeSet::default();
        assert_eq!(r.first(), None);
        assert_eq!(r.last(), None);

        r.insert(10..11).unwrap();
        r.insert(13..14).unwrap();
        r.insert(3..6).unwrap();

        assert_eq!(r.first(), Some(3));
        assert_eq!(r.last(), Some(13));
    }

    #[test]
    fn eq_range() {
        let mut r = RangeSet::default();
        assert_ne!(r, 0..0);

        r.insert(3..6).unwrap();
        assert_eq!(r, 3..6);

        r.insert(9..12).unwrap();
        assert_ne!(r, 3..6);
    }
}
