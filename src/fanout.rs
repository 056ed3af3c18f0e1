//! Fan-out storage.
//!
//! Every union object (dentry, inode, open file) carries a dense array of
//! lower objects, one slot per branch, of which only a contiguous range
//! `[start..=end]` is populated. Non-directories occupy exactly one slot;
//! directories may have interior gaps but never at the endpoints. The
//! sentinel `-1` start/end marks a negative object.
//!
//! Accessors and setters here are the only way the ranges and slots are
//! touched, so the invariants are maintained (and checked, in debug builds)
//! in one place.

use smallvec::SmallVec;

/// Sentinel branch index of a negative fan-out.
pub(crate) const B_NONE: i32 = -1;

/// Inline slot capacity; unions wider than this spill to the heap.
const INLINE_BRANCHES: usize = 4;

/// A contiguous fan-out over branch indices, generic in the slot payload.
#[derive(Debug)]
pub(crate) struct Fanout<T> {
    start: i32,
    end: i32,
    opaque: i32,
    slots: SmallVec<[Option<T>; INLINE_BRANCHES]>,
}

impl<T> Fanout<T> {
    /// An empty (negative) fan-out sized to the current branch count.
    pub(crate) fn new(branch_count: usize) -> Fanout<T> {
        let mut slots = SmallVec::with_capacity(branch_count);
        slots.resize_with(branch_count, || None);
        Fanout {
            start: B_NONE,
            end: B_NONE,
            opaque: B_NONE,
            slots,
        }
    }

    pub(crate) fn start(&self) -> i32 {
        self.start
    }

    pub(crate) fn end(&self) -> i32 {
        self.end
    }

    pub(crate) fn opaque(&self) -> i32 {
        self.opaque
    }

    pub(crate) fn set_start(&mut self, index: i32) {
        debug_assert!(index >= B_NONE && index < self.slots.len() as i32);
        self.start = index;
    }

    pub(crate) fn set_end(&mut self, index: i32) {
        debug_assert!(index >= B_NONE && index < self.slots.len() as i32);
        self.end = index;
    }

    pub(crate) fn set_opaque(&mut self, index: i32) {
        self.opaque = index;
    }

    /// Number of slots (== branch count at last rebuild).
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_positive(&self) -> bool {
        self.start >= 0
    }

    /// The populated branch index range, if any.
    pub(crate) fn range(&self) -> Option<std::ops::RangeInclusive<usize>> {
        if self.start >= 0 && self.end >= self.start {
            Some(self.start as usize..=self.end as usize)
        } else {
            None
        }
    }

    /// The range limited by the opaque stop, for child scans.
    pub(crate) fn scan_range(&self) -> Option<std::ops::RangeInclusive<usize>> {
        let range = self.range()?;
        if self.opaque >= 0 && (self.opaque as usize) < *range.end() {
            Some(*range.start()..=self.opaque as usize)
        } else {
            Some(range)
        }
    }

    pub(crate) fn lower(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn lower_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(|slot| slot.as_mut())
    }

    /// The slot at `start`, which is non-null for every positive fan-out.
    pub(crate) fn first_lower(&self) -> Option<&T> {
        if self.start < 0 {
            return None;
        }
        self.lower(self.start as usize)
    }

    /// Installs or clears a slot, returning the previous occupant.
    pub(crate) fn set_lower(&mut self, index: usize, value: Option<T>) -> Option<T> {
        debug_assert!(index < self.slots.len());
        std::mem::replace(&mut self.slots[index], value)
    }

    /// Installs a slot and widens the range to cover it.
    pub(crate) fn install(&mut self, index: usize, value: T) {
        self.set_lower(index, Some(value));
        let index = index as i32;
        if self.start < 0 || index < self.start {
            self.start = index;
        }
        if self.end < 0 || index > self.end {
            self.end = index;
        }
    }

    /// Iterates populated slots with their branch indices.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }

    /// Drops every slot and resets the ranges, resizing to a (possibly
    /// changed) branch count. Used when an object goes stale.
    pub(crate) fn reset(&mut self, branch_count: usize) {
        self.slots.clear();
        self.slots.resize_with(branch_count, || None);
        self.start = B_NONE;
        self.end = B_NONE;
        self.opaque = B_NONE;
    }

    /// Advances `start` to the first populated slot, dropping leading
    /// empties. Used after partial lookups turn a sparse scan positive.
    pub(crate) fn update_start(&mut self) {
        if self.start < 0 {
            return;
        }
        for index in self.start as usize..=self.end as usize {
            if self.slots[index].is_some() {
                self.start = index as i32;
                return;
            }
        }
        self.start = B_NONE;
        self.end = B_NONE;
    }

    /// Moves every populated slot out, for teardown.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.start = B_NONE;
        self.end = B_NONE;
        self.opaque = B_NONE;
        self.slots.iter_mut().filter_map(|slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_until_populated() {
        let mut f: Fanout<u32> = Fanout::new(3);
        assert!(!f.is_positive());
        assert_eq!(f.range(), None);

        f.set_lower(1, Some(7));
        f.set_start(1);
        f.set_end(1);
        assert!(f.is_positive());
        assert_eq!(f.range(), Some(1..=1));
        assert_eq!(f.first_lower(), Some(&7));
    }

    #[test]
    fn scan_range_stops_at_opaque() {
        let mut f: Fanout<u32> = Fanout::new(4);
        f.set_lower(0, Some(1));
        f.set_lower(2, Some(3));
        f.set_start(0);
        f.set_end(3);
        assert_eq!(f.scan_range(), Some(0..=3));
        f.set_opaque(2);
        assert_eq!(f.scan_range(), Some(0..=2));
    }

    #[test]
    fn update_start_skips_gaps() {
        let mut f: Fanout<u32> = Fanout::new(4);
        f.set_start(0);
        f.set_end(3);
        f.set_lower(2, Some(9));
        f.update_start();
        assert_eq!(f.start(), 2);

        let mut empty: Fanout<u32> = Fanout::new(2);
        empty.set_start(0);
        empty.set_end(1);
        empty.update_start();
        assert!(!empty.is_positive());
    }

    #[test]
    fn reset_resizes() {
        let mut f: Fanout<u32> = Fanout::new(2);
        f.set_lower(0, Some(5));
        f.set_start(0);
        f.set_end(0);
        f.reset(5);
        assert_eq!(f.len(), 5);
        assert!(!f.is_positive());
        assert!(f.lower(0).is_none());
    }
}
