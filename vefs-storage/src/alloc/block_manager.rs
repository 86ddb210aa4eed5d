//! Generic free-id pool over contiguous id ranges.
//!
//! The pool starts out empty; ids become allocatable through `dealloc_*`
//! calls. Free ranges are kept in a map ordered by their last id, so every
//! operation is logarithmic in the number of ranges and adjacent ranges
//! merge on deallocation.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::error::{ErrorKind, Result};
use crate::id::SectorId;
use crate::util::{BitsetMut, BitsetRef};

/// Id types the block manager can hand out.
pub trait BlockIndex: Copy + Eq {
    fn into_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;
}

impl BlockIndex for u64 {
    fn into_raw(self) -> u64 {
        self
    }

    fn from_raw(raw: u64) -> Self {
        raw
    }
}

impl BlockIndex for SectorId {
    fn into_raw(self) -> u64 {
        self.get()
    }

    fn from_raw(raw: u64) -> Self {
        SectorId::new(raw)
    }
}

/// Free-range pool; see the module docs.
pub struct BlockManager<I: BlockIndex> {
    // last id of the range -> first id of the range, both inclusive
    free: BTreeMap<u64, u64>,
    _marker: PhantomData<I>,
}

impl<I: BlockIndex> Default for BlockManager<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: BlockIndex> BlockManager<I> {
    pub fn new() -> Self {
        BlockManager {
            free: BTreeMap::new(),
            _marker: PhantomData,
        }
    }

    /// Allocates the smallest free id.
    pub fn alloc_one(&mut self) -> Result<I> {
        let (&last, &first) = self
            .free
            .iter()
            .next()
            .ok_or(ErrorKind::ResourceExhausted)?;
        self.free.remove(&last);
        if first < last {
            self.free.insert(last, first + 1);
        }
        Ok(I::from_raw(first))
    }

    /// Fills `ids` front to back; returns how many were served.
    pub fn alloc_multiple(&mut self, ids: &mut [I]) -> Result<usize> {
        let mut served = 0;
        while served < ids.len() {
            match self.alloc_one() {
                Ok(id) => {
                    ids[served] = id;
                    served += 1;
                }
                Err(err) if err.kind() == ErrorKind::ResourceExhausted => break,
                Err(err) => return Err(err),
            }
        }
        Ok(served)
    }

    /// Allocates `num` contiguous ids, returning the first.
    pub fn alloc_contiguous(&mut self, num: u64) -> Result<I> {
        if num == 0 {
            return Err(ErrorKind::InvalidArgument.into());
        }
        let found = self
            .free
            .iter()
            .find(|(&last, &first)| last - first + 1 >= num)
            .map(|(&last, &first)| (last, first));
        let (last, first) = found.ok_or(ErrorKind::ResourceExhausted)?;
        self.free.remove(&last);
        if first + num <= last {
            self.free.insert(last, first + num);
        }
        Ok(I::from_raw(first))
    }

    /// Grows the caller-owned range `[begin, end]` by `num` ids, absorbing
    /// free neighbours. Returns the new begin.
    pub fn extend(&mut self, begin: I, end: I, num: u64) -> Result<I> {
        let begin = begin.into_raw();
        let end = end.into_raw();

        // a free range starting right after `end` is keyed at or above it
        let successor = self
            .free
            .range(end + 1..)
            .next()
            .map(|(&last, &first)| (last, first))
            .filter(|&(_, first)| first == end + 1);

        if let Some((last, first)) = successor {
            let available = last - first + 1;
            if available >= num {
                self.free.remove(&last);
                if available > num {
                    self.free.insert(last, first + num);
                }
                return Ok(I::from_raw(begin));
            }
        }

        let remaining = match successor {
            Some((last, first)) => num - (last - first + 1),
            None => num,
        };
        let predecessor = (begin > 0)
            .then(|| self.free.get(&(begin - 1)).copied())
            .flatten()
            .map(|first| (begin - 1, first));
        if let Some((last, first)) = predecessor {
            if last - first + 1 >= remaining {
                self.free.remove(&last);
                if last - first + 1 > remaining {
                    self.free.insert(last - remaining, first);
                }
                if let Some((succ_last, _)) = successor {
                    self.free.remove(&succ_last);
                }
                return Ok(I::from_raw(last - remaining + 1));
            }
        }

        Err(ErrorKind::ResourceExhausted.into())
    }

    pub fn dealloc_one(&mut self, which: I) -> Result<()> {
        self.dealloc_contiguous(which, 1)
    }

    /// Returns `[first, first + num)` to the pool, merging with adjacent
    /// free ranges.
    pub fn dealloc_contiguous(&mut self, first: I, num: u64) -> Result<()> {
        if num == 0 {
            return Ok(());
        }
        let first = first.into_raw();
        let last = first + num - 1;

        let successor = self
            .free
            .range(last + 1..)
            .next()
            .map(|(&s_last, &s_first)| (s_last, s_first))
            .filter(|&(_, s_first)| s_first == last + 1);
        let predecessor = (first > 0)
            .then(|| self.free.get(&(first - 1)).copied())
            .flatten()
            .map(|p_first| (first - 1, p_first));

        match (predecessor, successor) {
            (Some((p_last, p_first)), Some((s_last, _))) => {
                self.free.remove(&p_last);
                *self.free.get_mut(&s_last).expect("successor present") =
                    p_first;
            }
            (Some((p_last, p_first)), None) => {
                self.free.remove(&p_last);
                self.free.insert(last, p_first);
            }
            (None, Some((s_last, _))) => {
                *self.free.get_mut(&s_last).expect("successor present") =
                    first;
            }
            (None, None) => {
                self.free.insert(last, first);
            }
        }
        Ok(())
    }

    /// Serializes `[begin, begin + num)`: a set bit means allocated.
    pub fn write_to_bitset(
        &self,
        mut bits: BitsetMut<'_>,
        begin: I,
        num: usize,
    ) {
        if num == 0 {
            return;
        }
        bits.set_n(num);
        let begin = begin.into_raw();
        let end = begin + num as u64 - 1;

        for (&last, &first) in self.free.range(begin..) {
            if first > end {
                break;
            }
            let from = first.max(begin) - begin;
            let to = last.min(end) - begin;
            for index in from..=to {
                bits.unset(index as usize);
            }
        }
    }

    /// Rebuilds pool state from a bitset written by [`Self::write_to_bitset`].
    pub fn parse_bitset(
        &mut self,
        bits: &BitsetRef<'_>,
        begin: I,
        num: usize,
    ) -> Result<()> {
        let begin = begin.into_raw();
        let mut run_start: Option<u64> = None;
        for index in 0..num {
            if bits.get(index) {
                if let Some(start) = run_start.take() {
                    self.dealloc_contiguous(
                        I::from_raw(begin + start),
                        index as u64 - start,
                    )?;
                }
            } else if run_start.is_none() {
                run_start = Some(index as u64);
            }
        }
        if let Some(start) = run_start {
            self.dealloc_contiguous(
                I::from_raw(begin + start),
                num as u64 - start,
            )?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.free.clear();
    }

    /// Absorbs every free id of `other`; overlapping ranges are merged.
    pub fn merge_from(&mut self, other: &mut BlockManager<I>) -> Result<()> {
        for (last, first) in std::mem::take(&mut other.free) {
            let mut cursor = first;
            while cursor <= last {
                // the next range of ours that could overlap [cursor, last]
                let overlap = self
                    .free
                    .range(cursor..)
                    .next()
                    .map(|(&o_last, &o_first)| (o_last, o_first))
                    .filter(|&(_, o_first)| o_first <= last);
                match overlap {
                    None => {
                        self.dealloc_contiguous(
                            I::from_raw(cursor),
                            last - cursor + 1,
                        )?;
                        break;
                    }
                    Some((o_last, o_first)) => {
                        if o_first > cursor {
                            self.dealloc_contiguous(
                                I::from_raw(cursor),
                                o_first - cursor,
                            )?;
                        }
                        cursor = o_last + 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Absorbs every free id of `other`; ranges must not overlap ours.
    pub fn merge_disjunct(
        &mut self,
        other: &mut BlockManager<I>,
    ) -> Result<()> {
        for (last, first) in std::mem::take(&mut other.free) {
            self.dealloc_contiguous(I::from_raw(first), last - first + 1)?;
        }
        Ok(())
    }

    /// Removes the free range ending right before `end_id`, returning how
    /// many ids it held.
    pub fn trim_ids(&mut self, end_id: I) -> u64 {
        let end_id = end_id.into_raw();
        if end_id == 0 {
            return 0;
        }
        match self.free.remove(&(end_id - 1)) {
            Some(first) => end_id - first,
            None => 0,
        }
    }

    /// Number of distinct free ranges.
    pub fn num_nodes(&self) -> u64 {
        self.free.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(ranges: &[(u64, u64)]) -> BlockManager<u64> {
        let mut manager = BlockManager::new();
        for &(first, num) in ranges {
            manager.dealloc_contiguous(first, num).unwrap();
        }
        manager
    }

    #[test]
    fn alloc_from_empty_pool_is_exhausted() {
        let mut manager = BlockManager::<u64>::new();
        let err = manager.alloc_one().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn alloc_prefers_the_lowest_ids() {
        let mut manager = manager_with(&[(10, 3), (2, 2)]);
        assert_eq!(manager.alloc_one().unwrap(), 2);
        assert_eq!(manager.alloc_one().unwrap(), 3);
        assert_eq!(manager.alloc_one().unwrap(), 10);
    }

    #[test]
    fn adjacent_deallocs_merge_into_one_range() {
        let mut manager = manager_with(&[(5, 2), (9, 2)]);
        assert_eq!(manager.num_nodes(), 2);
        manager.dealloc_contiguous(7, 2).unwrap();
        assert_eq!(manager.num_nodes(), 1);
        assert_eq!(manager.alloc_contiguous(6).unwrap(), 5);
    }

    #[test]
    fn contiguous_allocation_skips_small_ranges() {
        let mut manager = manager_with(&[(1, 2), (10, 5)]);
        assert_eq!(manager.alloc_contiguous(4).unwrap(), 10);
        assert_eq!(manager.alloc_one().unwrap(), 1);
    }

    #[test]
    fn extend_prefers_the_trailing_neighbour() {
        let mut manager = manager_with(&[(8, 4)]);
        // caller owns [5, 7]
        assert_eq!(manager.extend(5, 7, 2).unwrap(), 5);
        assert_eq!(manager.alloc_one().unwrap(), 10);
    }

    #[test]
    fn extend_falls_back_to_the_leading_neighbour() {
        let mut manager = manager_with(&[(2, 3)]);
        // caller owns [5, 6]; only the leading neighbour has room
        assert_eq!(manager.extend(5, 6, 2).unwrap(), 3);
        assert_eq!(manager.alloc_one().unwrap(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn extend_combines_both_neighbours() {
        let mut manager = manager_with(&[(2, 3), (8, 1)]);
        // caller owns [5, 7]; one id after, the rest before
        assert_eq!(manager.extend(5, 7, 3).unwrap(), 3);
        assert_eq!(manager.alloc_one().unwrap(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn bitset_round_trip_preserves_the_pool() {
        let manager = manager_with(&[(1, 4), (8, 2), (15, 1)]);
        let mut raw = [0u8; 2];
        manager.write_to_bitset(BitsetMut::new(&mut raw), 0, 16);

        let mut recovered = BlockManager::<u64>::new();
        recovered
            .parse_bitset(&BitsetRef::new(&raw), 0, 16)
            .unwrap();
        assert_eq!(recovered.num_nodes(), 3);
        assert_eq!(recovered.alloc_contiguous(4).unwrap(), 1);
        assert_eq!(recovered.alloc_contiguous(2).unwrap(), 8);
        assert_eq!(recovered.alloc_one().unwrap(), 15);
        assert!(recovered.is_empty());
    }

    #[test]
    fn merge_from_handles_overlap() {
        let mut manager = manager_with(&[(2, 4)]);
        let mut other = manager_with(&[(4, 6)]);
        manager.merge_from(&mut other).unwrap();
        assert!(other.is_empty());
        assert_eq!(manager.num_nodes(), 1);
        assert_eq!(manager.alloc_contiguous(8).unwrap(), 2);
    }

    #[test]
    fn trim_removes_only_the_tail_range() {
        let mut manager = manager_with(&[(1, 2), (6, 4)]);
        assert_eq!(manager.trim_ids(10), 4);
        assert_eq!(manager.trim_ids(10), 0);
        assert_eq!(manager.num_nodes(), 1);
    }
}
