//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Rowmap.
//
// Rowmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rowmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rowmap. If not, see <http://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Bound::{Excluded, Included, Unbounded};

use super::model::{Seqnum, Uid};

/// A set of 32-bit message identifiers (UIDs or sequence numbers).
///
/// Internally, this is maintained as a minimal sorted set of inclusive
/// ranges keyed by their start. It does not maintain information on the
/// original fragmentation, ordering, or duplication of its inputs. All
/// operations are logarithmic lookups plus linear merging over the range
/// count.
///
/// The `Display` format puts this into minimal RFC 3501 sequence-set wire
/// format. Note that IMAP has no way to represent an empty sequence set;
/// `Display` produces an empty string in that case, which is invalid on the
/// wire.
#[derive(Clone, PartialEq, Eq)]
pub struct IdSet<T> {
    parts: BTreeMap<u32, u32>,
    _t: PhantomData<T>,
}

impl<T> IdSet<T> {
    /// Create a new, empty set.
    pub fn new() -> Self {
        IdSet {
            parts: BTreeMap::new(),
            _t: PhantomData,
        }
    }

    /// Return whether this set is empty.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Return the number of elements in this set.
    pub fn count(&self) -> usize {
        self.parts
            .iter()
            .map(|(start, end)| (end - start + 1) as usize)
            .sum()
    }

    /// Return the ranges of the set as `(start, end)` inclusive pairs.
    pub fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.parts.iter().map(|(&start, &end)| (start, end))
    }

    /// Return the smallest element, raw.
    pub fn smallest(&self) -> Option<u32> {
        self.parts.keys().next().copied()
    }

    /// Return the largest element, raw.
    pub fn largest(&self) -> Option<u32> {
        self.parts.values().next_back().copied()
    }

    fn insert_raw(&mut self, start_incl: u32, mut end_incl: u32) {
        // If this range overlaps or abuts any later ranges, fuse them.
        loop {
            let following = self
                .parts
                .range((Excluded(start_incl), Unbounded))
                .next()
                .map(|(&start, &end)| (start, end));

            if let Some((following_start, following_end)) = following {
                if following_start - 1 <= end_incl {
                    end_incl = end_incl.max(following_end);
                    self.parts.remove(&following_start);
                    continue;
                }
            }

            break;
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(end_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((preceding_start, preceding_end)) = preceding {
            if preceding_end >= start_incl.saturating_sub(1) {
                // Overlap with the new range
                if start_incl < preceding_start {
                    self.parts.remove(&preceding_start);
                    self.parts.insert(start_incl, end_incl.max(preceding_end));
                } else {
                    self.parts
                        .insert(preceding_start, end_incl.max(preceding_end));
                }
                return;
            }
        }

        // No overlap
        self.parts.insert(start_incl, end_incl);
    }

    fn remove_raw(&mut self, lo: u32, hi: u32) {
        // Find every range touching [lo, hi] and split the survivors back
        // in.
        let affected: Vec<(u32, u32)> = self
            .parts
            .range((Unbounded, Included(hi)))
            .rev()
            .take_while(|&(_, &end)| end >= lo)
            .map(|(&start, &end)| (start, end))
            .collect();

        for (start, end) in affected {
            self.parts.remove(&start);
            if start < lo {
                self.parts.insert(start, lo - 1);
            }
            if end > hi {
                self.parts.insert(hi + 1, end);
            }
        }
    }

    fn contains_raw(&self, v: u32) -> bool {
        self.parts
            .range(..=v)
            .next_back()
            .filter(|&(_, &end)| end >= v)
            .is_some()
    }

    /// Return the `i`-th smallest element (1-indexed), raw.
    pub fn value(&self, i: usize) -> Option<u32> {
        if 0 == i {
            return None;
        }

        let mut remaining = i as u64 - 1;
        for (&start, &end) in &self.parts {
            let extent = (end - start) as u64 + 1;
            if remaining < extent {
                return Some(start + remaining as u32);
            }
            remaining -= extent;
        }

        None
    }

    /// Return the 1-based rank of `n` within the set, or 0 if absent.
    pub fn index_raw(&self, n: u32) -> usize {
        let mut preceding = 0usize;
        for (&start, &end) in &self.parts {
            if n < start {
                return 0;
            }
            if n <= end {
                return preceding + (n - start) as usize + 1;
            }
            preceding += (end - start) as usize + 1;
        }

        0
    }

    /// Return the intersection of this set and `other`.
    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = Self::new();
        let mut rhs = other.ranges().peekable();

        for (a_start, a_end) in self.ranges() {
            while let Some(&(b_start, b_end)) = rhs.peek() {
                let start = a_start.max(b_start);
                let end = a_end.min(b_end);
                if start <= end {
                    out.insert_raw(start, end);
                }

                // Whichever range ends first cannot intersect anything
                // further.
                if b_end <= a_end {
                    rhs.next();
                } else {
                    break;
                }
            }
        }

        out
    }

    /// Output every element as a comma-separated plain list, without range
    /// notation.
    pub fn csl(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        for (start, end) in self.ranges() {
            for v in start..=end {
                if !out.is_empty() {
                    out.push(',');
                }
                let _ = write!(out, "{}", v);
            }
        }

        out
    }
}

impl<T: TryFrom<u32> + Into<u32> + PartialOrd + Send + Sync> IdSet<T> {
    /// Create a set containing just the given item.
    pub fn just(item: T) -> Self {
        let mut this = IdSet::new();
        this.add(item);
        this
    }

    /// Create a set containing a single, simple range.
    pub fn range(start: T, end: T) -> Self {
        let mut this = IdSet::new();
        this.add_range(start, end);
        this
    }

    /// Add a single item.
    pub fn add(&mut self, item: T) {
        let item: u32 = item.into();
        self.insert_raw(item, item);
    }

    /// Add the given inclusive range, which must be in the correct order.
    pub fn add_range(&mut self, start_incl: T, end_incl: T) {
        let start_incl: u32 = start_incl.into();
        let end_incl: u32 = end_incl.into();
        assert!(end_incl >= start_incl);
        self.insert_raw(start_incl, end_incl);
    }

    /// Remove a single item, if present.
    pub fn remove(&mut self, item: T) {
        let item: u32 = item.into();
        self.remove_raw(item, item);
    }

    /// Remove every element of `other`.
    pub fn remove_set(&mut self, other: &Self) {
        for (start, end) in other.ranges() {
            self.remove_raw(start, end);
        }
    }

    /// Return whether the given item is present.
    pub fn contains(&self, v: T) -> bool {
        self.contains_raw(v.into())
    }

    /// Return whether every element of `other` is present.
    pub fn contains_set(&self, other: &Self) -> bool {
        other.ranges().all(|(start, end)| {
            self.parts
                .range(..=start)
                .next_back()
                .map_or(false, |(_, &e)| e >= end)
        })
    }

    /// Return the 1-based rank of `n`, or 0 if absent.
    pub fn index(&self, n: T) -> usize {
        self.index_raw(n.into())
    }

    /// Return an iterator of the items in this set, in strictly ascending
    /// order. Values not representable as `T` are silently skipped.
    pub fn items(&self) -> impl Iterator<Item = T> + '_ {
        self.parts
            .iter()
            .flat_map(|(&start, &end)| start..=end)
            .filter_map(|v| T::try_from(v).ok())
    }

    /// Parse the RFC 3501 form of the sequence set.
    ///
    /// `splat` is used as the value of elements which specify `*`.
    pub fn parse(raw: &str, splat: T) -> Option<Self> {
        fn do_parse(r: &str, splat: u32) -> Option<u32> {
            if "*" == r {
                Some(splat)
            } else {
                r.parse().ok().filter(|&v| v > 0)
            }
        }

        let splat = splat.into();

        let mut this = Self::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = do_parse(only, splat)?;
                    this.insert_raw(only, only);
                },
                (Some(start), Some(end), None) => {
                    let start = do_parse(start, splat)?;
                    let end = do_parse(end, splat)?;
                    // RFC 3501 allows the endpoints to be in either order
                    this.insert_raw(start.min(end), end.max(start));
                },
                _ => return None,
            }
        }

        Some(this)
    }
}

impl<T> fmt::Display for IdSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for IdSet<Seqnum> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Seqnum {}]", self)
    }
}

impl fmt::Debug for IdSet<Uid> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Uid {}]", self)
    }
}

impl<T> Default for IdSet<T> {
    fn default() -> Self {
        IdSet::new()
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn uids(raw: &str) -> IdSet<Uid> {
        IdSet::parse(raw, Uid::MAX).unwrap()
    }

    #[test]
    fn parsing_and_merging() {
        assert_eq!("1", uids("1").to_string());
        assert_eq!("1:2", uids("2:1").to_string());
        assert_eq!("1,3,5", uids("3,1,5").to_string());
        assert_eq!("1:4", uids("1,2:3,4").to_string());
        assert_eq!("1:4", uids("1:4,2:3").to_string());
        assert_eq!("9:10", IdSet::parse("9:*", Uid::u(10)).unwrap().to_string());
        assert_eq!(None, IdSet::<Uid>::parse("", Uid::MAX));
        assert_eq!(None, IdSet::<Uid>::parse("1:2:3", Uid::MAX));
        assert_eq!(None, IdSet::<Uid>::parse("0", Uid::MAX));
    }

    #[test]
    fn removal() {
        let mut set = uids("1:10");
        set.remove(Uid::u(5));
        assert_eq!("1:4,6:10", set.to_string());

        set.remove(Uid::u(1));
        assert_eq!("2:4,6:10", set.to_string());

        set.remove(Uid::u(10));
        assert_eq!("2:4,6:9", set.to_string());

        set.remove_set(&uids("3:8"));
        assert_eq!("2,9", set.to_string());

        set.remove(Uid::u(100));
        assert_eq!("2,9", set.to_string());
    }

    #[test]
    fn ranks_and_values() {
        let set = uids("2:3,5,7:9");
        assert_eq!(6, set.count());
        assert_eq!(Some(2), set.smallest());
        assert_eq!(Some(9), set.largest());

        assert_eq!(Some(2), set.value(1));
        assert_eq!(Some(3), set.value(2));
        assert_eq!(Some(5), set.value(3));
        assert_eq!(Some(7), set.value(4));
        assert_eq!(Some(9), set.value(6));
        assert_eq!(None, set.value(7));
        assert_eq!(None, set.value(0));

        assert_eq!(1, set.index(Uid::u(2)));
        assert_eq!(3, set.index(Uid::u(5)));
        assert_eq!(6, set.index(Uid::u(9)));
        assert_eq!(0, set.index(Uid::u(4)));
        assert_eq!(0, set.index(Uid::u(100)));
    }

    #[test]
    fn containment() {
        let set = uids("2:3,5,7:9");
        assert!(set.contains(Uid::u(2)));
        assert!(set.contains(Uid::u(8)));
        assert!(!set.contains(Uid::u(6)));
        assert!(set.contains_set(&uids("2,7:8")));
        assert!(!set.contains_set(&uids("2:5")));
    }

    #[test]
    fn intersections() {
        assert_eq!(
            "3,5,7",
            uids("1:5,7").intersection(&uids("3,5:8")).to_string(),
        );
        assert_eq!("", uids("1:3").intersection(&uids("4:6")).to_string());
        assert_eq!(
            "1:3",
            uids("1:3").intersection(&uids("1:100")).to_string(),
        );
    }

    #[test]
    fn csl_output() {
        assert_eq!("2,3,5", uids("2:3,5").csl());
        assert_eq!("", IdSet::<Uid>::new().csl());
    }

    proptest! {
        #[test]
        fn idset_properties(
            ranges in prop::collection::vec((1u32..30, 1u32..=10), 1..=5),
            removals in prop::collection::vec(1u32..45, 0..=8),
        ) {
            let mut expected = Vec::new();
            let mut set = IdSet::<Uid>::new();

            for &(start, extent) in &ranges {
                set.add_range(Uid::u(start), Uid::u(start + extent));
                expected.extend(start..=start + extent);
            }

            expected.sort();
            expected.dedup();

            for &r in &removals {
                set.remove(Uid::u(r));
                expected.retain(|&v| v != r);
            }

            let actual: Vec<u32> =
                set.items().map(|u: Uid| u.0.get()).collect();
            prop_assert_eq!(&expected, &actual);
            prop_assert_eq!(expected.len(), set.count());

            for i in 1..50 {
                prop_assert_eq!(
                    expected.contains(&i),
                    set.contains(Uid::u(i)),
                    "bad contains result for {}",
                    i,
                );
                prop_assert_eq!(
                    expected.iter().position(|&v| v == i)
                        .map(|p| p + 1).unwrap_or(0),
                    set.index(Uid::u(i)),
                    "bad index result for {}",
                    i,
                );
            }

            for (rank, &v) in expected.iter().enumerate() {
                prop_assert_eq!(Some(v), set.value(rank + 1));
            }

            // It can be stringified and parsed back into the same value
            if !set.is_empty() {
                prop_assert_eq!(
                    &set,
                    &IdSet::parse(&set.to_string(), Uid::MAX).unwrap(),
                );
            }
        }
    }
}
