//! Plain least-recently-used eviction.

use crate::cache::page::{PageState, ReplacementResult};
use crate::cache::policy::EvictionPolicy;

/// Recency list; index 0 is the coldest entry.
pub struct LeastRecentlyUsedPolicy {
    order: Vec<u16>,
}

impl LeastRecentlyUsedPolicy {
    pub(crate) fn coldest(&self) -> Option<u16> {
        self.order.first().copied()
    }

    pub(crate) fn evict_from_list<K: Copy>(
        order: &mut Vec<u16>,
        pages: &[PageState<K>],
        generation: &mut u32,
    ) -> Option<(u16, ReplacementResult)> {
        for slot in 0..order.len() {
            let index = order[slot];
            let outcome = pages[index as usize].try_start_replace(generation);
            if outcome != ReplacementResult::Pinned {
                order.remove(slot);
                return Some((index, outcome));
            }
        }
        None
    }
}

impl<K: Copy> EvictionPolicy<K> for LeastRecentlyUsedPolicy {
    fn new(capacity: usize) -> Self {
        LeastRecentlyUsedPolicy {
            order: Vec::with_capacity(capacity),
        }
    }

    fn num_managed(&self) -> usize {
        self.order.len()
    }

    fn insert(&mut self, _pages: &[PageState<K>], _key: K, index: u16) {
        self.order.push(index);
    }

    fn on_access(
        &mut self,
        _pages: &[PageState<K>],
        _key: K,
        index: u16,
    ) -> bool {
        match self.order.iter().position(|&slot| slot == index) {
            Some(position) => {
                self.order.remove(position);
                self.order.push(index);
                true
            }
            None => false,
        }
    }

    fn on_purge(
        &mut self,
        _pages: &[PageState<K>],
        _key: K,
        index: u16,
    ) -> bool {
        match self.order.iter().position(|&slot| slot == index) {
            Some(position) => {
                self.order.remove(position);
                true
            }
            None => false,
        }
    }

    fn try_evict(
        &mut self,
        pages: &[PageState<K>],
        generation: &mut u32,
    ) -> Option<(u16, ReplacementResult)> {
        Self::evict_from_list(&mut self.order, pages, generation)
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
    fn starts_empty() {
        let policy = <LeastRecentlyUsedPolicy as EvictionPolicy<u64>>::new(64);
        assert_eq!(
            <LeastRecentlyUsedPolicy as EvictionPolicy<u64>>::num_managed(
                &policy
            ),
            0
        );
    }

    #[test]
    fn evicts_in_insertion_order() {
        let pages = pages_with_entries(4);
        let mut policy = <LeastRecentlyUsedPolicy as EvictionPolicy<u64>>::new(4);
        for i in 0..4u16 {
            policy.insert(&pages, i as u64, i);
        }

        let mut generation = 0;
        let (victim, outcome) =
            policy.try_evict(&pages, &mut generation).unwrap();
        assert_eq!(victim, 0);
        assert_eq!(outcome, ReplacementResult::Clean);
        assert_eq!(EvictionPolicy::<u64>::num_managed(&policy), 3);
    }

    #[test]
    fn access_moves_the_entry_to_the_back() {
        let pages = pages_with_entries(4);
        let mut policy = <LeastRecentlyUsedPolicy as EvictionPolicy<u64>>::new(4);
        for i in 0..4u16 {
            policy.insert(&pages, i as u64, i);
        }
        assert!(policy.on_access(&pages, 0, 0));

        let mut generation = 0;
        let (victim, _) = policy.try_evict(&pages, &mut generation).unwrap();
        assert_eq!(victim, 1);
    }

    #[test]
    fn pinned_pages_are_skipped() {
        let pages = pages_with_entries(3);
        let mut policy = <LeastRecentlyUsedPolicy as EvictionPolicy<u64>>::new(3);
        for i in 0..3u16 {
            policy.insert(&pages, i as u64, i);
        }
        assert!(pages[0].try_pin());

        let mut generation = 0;
        let (victim, _) = policy.try_evict(&pages, &mut generation).unwrap();
        assert_eq!(victim, 1);
        // the pinned page stays managed
        assert_eq!(EvictionPolicy::<u64>::num_managed(&policy), 2);
    }
}
