//! Segmented least-recently-used eviction.
//!
//! One list split into a probationary head and a protected tail; entries
//! are promoted on their second access and the probationary segment is kept
//! at roughly a fifth of the whole.

use crate::cache::page::{PageState, ReplacementResult};
use crate::cache::policy::EvictionPolicy;

const PROBATION_DIVIDER: usize = 5;

pub struct SegmentedLruPolicy {
    // [0, num_on_probation) probation, [num_on_probation, len) protected;
    // both segments are ordered coldest first
    order: Vec<u16>,
    num_on_probation: usize,
}

impl SegmentedLruPolicy {
    pub(crate) fn insert_index(&mut self, index: u16) {
        self.order.insert(self.num_on_probation, index);
        self.num_on_probation += 1;
    }

    pub(crate) fn access_index(&mut self, index: u16) -> bool {
        let Some(position) =
            self.order.iter().position(|&slot| slot == index)
        else {
            return false;
        };
        self.order.remove(position);
        self.order.push(index);
        if position < self.num_on_probation {
            self.num_on_probation -= 1;
        }
        // demote the coldest protected entry when protection overflows
        if self.num_on_probation > self.order.len() / PROBATION_DIVIDER {
            self.num_on_probation -= 1;
        }
        true
    }

    pub(crate) fn purge_index(&mut self, index: u16) -> bool {
        match self.order.iter().position(|&slot| slot == index) {
            Some(position) => {
                if position < self.num_on_probation {
                    self.num_on_probation -= 1;
                }
                self.order.remove(position);
                true
            }
            None => false,
        }
    }

    pub(crate) fn evict<K: Copy>(
        &mut self,
        pages: &[PageState<K>],
        generation: &mut u32,
    ) -> Option<(u16, ReplacementResult)> {
        for slot in 0..self.order.len() {
            let index = self.order[slot];
            let outcome = pages[index as usize].try_start_replace(generation);
            if outcome != ReplacementResult::Pinned {
                if slot < self.num_on_probation {
                    self.num_on_probation -= 1;
                }
                self.order.remove(slot);
                return Some((index, outcome));
            }
        }
        None
    }

    pub(crate) fn coldest(&self) -> Option<u16> {
        self.order.first().copied()
    }
}

impl<K: Copy> EvictionPolicy<K> for SegmentedLruPolicy {
    fn new(capacity: usize) -> Self {
        SegmentedLruPolicy {
            order: Vec::with_capacity(capacity),
            num_on_probation: 0,
        }
    }

    fn num_managed(&self) -> usize {
        self.order.len()
    }

    fn insert(&mut self, _pages: &[PageState<K>], _key: K, index: u16) {
        self.insert_index(index);
    }

    fn on_access(
        &mut self,
        _pages: &[PageState<K>],
        _key: K,
        index: u16,
    ) -> bool {
        self.access_index(index)
    }

    fn on_purge(
        &mut self,
        _pages: &[PageState<K>],
        _key: K,
        index: u16,
    ) -> bool {
        self.purge_index(index)
    }

    fn try_evict(
        &mut self,
        pages: &[PageState<K>],
        generation: &mut u32,
    ) -> Option<(u16, ReplacementResult)> {
        self.evict(pages, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages_with_entries(num: u16) -> Vec<PageState<u64>> {
        let pages: Vec<PageState<u64>> =
            (0..num).map(|_| PageState::new()).collect();
        let mut generation = 0;
        for (i, page) in pages.iter().enumerate() {
            let _ = page.try_start_replace(&mut generation);
            page.finish_replace(i as u64);
            page.release();
        }
        pages
    }

    #[test]
    fn new_entries_sit_on_probation() {
        let pages = pages_with_entries(4);
        let mut policy = <SegmentedLruPolicy as EvictionPolicy<u64>>::new(4);
        for i in 0..4u16 {
            policy.insert(&pages, i as u64, i);
        }
        assert_eq!(EvictionPolicy::<u64>::num_managed(&policy), 4);

        let mut generation = 0;
        let (victim, _) = policy.try_evict(&pages, &mut generation).unwrap();
        assert_eq!(victim, 0);
    }

    #[test]
    fn accessed_entries_are_protected_from_eviction() {
        let pages = pages_with_entries(4);
        let mut policy = <SegmentedLruPolicy as EvictionPolicy<u64>>::new(4);
        for i in 0..4u16 {
            policy.insert(&pages, i as u64, i);
        }
        assert!(policy.on_access(&pages, 0, 0));

        let mut generation = 0;
        let (victim, _) = policy.try_evict(&pages, &mut generation).unwrap();
        assert_ne!(victim, 0);
        assert_eq!(victim, 1);
    }

    #[test]
    fn unknown_entries_are_rejected() {
        let pages = pages_with_entries(2);
        let mut policy = <SegmentedLruPolicy as EvictionPolicy<u64>>::new(2);
        policy.insert(&pages, 0, 0);
        assert!(!policy.on_access(&pages, 1, 1));
        assert!(!policy.on_purge(&pages, 1, 1));
    }
}
