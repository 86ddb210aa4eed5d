//! Window-TinyLFU eviction.
//!
//! A small recency window in front of a segmented LRU main area. Admission
//! from window to main is frequency based: the doorkeeper bloom filter
//! absorbs the first observation of every key, a 4-bit counting sketch the
//! rest, and both age after `16 * capacity` recorded samples.

use std::hash::Hash;

use crate::cache::bloom::{BloomFilter, SpectralBloomFilter};
use crate::cache::lru::LeastRecentlyUsedPolicy;
use crate::cache::page::{PageState, ReplacementResult};
use crate::cache::policy::EvictionPolicy;
use crate::cache::slru::SegmentedLruPolicy;

const WINDOW_DIVIDER: usize = 100;

pub struct WTinyLfuPolicy<K> {
    window: LeastRecentlyUsedPolicy,
    main: SegmentedLruPolicy,
    doorkeeper: BloomFilter,
    sketch: SpectralBloomFilter,
    window_size: usize,
    samples: u32,
    max_samples: u32,
    _marker: std::marker::PhantomData<K>,
}

impl<K: Copy + Hash> WTinyLfuPolicy<K> {
    fn estimate(&self, key: &K) -> u32 {
        if self.doorkeeper.estimate(key) > 0 {
            1 + self.sketch.estimate(key)
        } else {
            1
        }
    }

    fn record_sample(&mut self, key: &K) {
        if !self.doorkeeper.observe(key) && !self.sketch.observe(key) {
            return;
        }
        self.samples += 1;
        if self.samples == self.max_samples {
            self.samples /= 2;
            self.doorkeeper.reset();
            self.sketch.reset();
        }
    }

    /// Moves the coldest window entry into the main area.
    fn migrate_window_head(&mut self, pages: &[PageState<K>]) {
        if let Some(index) = self.window.coldest() {
            let key = pages[index as usize].key();
            EvictionPolicy::<K>::on_purge(&mut self.window, pages, key, index);
            self.main.insert(pages, key, index);
        }
    }
}

impl<K: Copy + Hash + Send> EvictionPolicy<K> for WTinyLfuPolicy<K> {
    fn new(capacity: usize) -> Self {
        let window_size = (capacity / WINDOW_DIVIDER).max(2);
        WTinyLfuPolicy {
            window: <LeastRecentlyUsedPolicy as EvictionPolicy<K>>::new(
                window_size,
            ),
            main: <SegmentedLruPolicy as EvictionPolicy<K>>::new(
                capacity - window_size,
            ),
            doorkeeper: BloomFilter::new(capacity),
            sketch: SpectralBloomFilter::new(capacity),
            window_size,
            samples: 0,
            // 4-bit counters saturate around sixteen observations per slot
            max_samples: (capacity * 16) as u32,
            _marker: std::marker::PhantomData,
        }
    }

    fn num_managed(&self) -> usize {
        EvictionPolicy::<K>::num_managed(&self.window)
            + EvictionPolicy::<K>::num_managed(&self.main)
    }

    fn insert(&mut self, pages: &[PageState<K>], key: K, index: u16) {
        if EvictionPolicy::<K>::num_managed(&self.window) == self.window_size
        {
            self.migrate_window_head(pages);
        }
        self.window.insert(pages, key, index);
    }

    fn on_access(
        &mut self,
        pages: &[PageState<K>],
        key: K,
        index: u16,
    ) -> bool {
        if !self.window.on_access(pages, key, index)
            && !self.main.on_access(pages, key, index)
        {
            return false;
        }
        self.record_sample(&key);
        true
    }

    fn on_purge(
        &mut self,
        pages: &[PageState<K>],
        key: K,
        index: u16,
    ) -> bool {
        self.window.on_purge(pages, key, index)
            || self.main.on_purge(pages, key, index)
    }

    fn try_evict(
        &mut self,
        pages: &[PageState<K>],
        generation: &mut u32,
    ) -> Option<(u16, ReplacementResult)> {
        let window_head = self.window.coldest();
        let main_head = self.main.coldest();

        let use_window = match (window_head, main_head) {
            (Some(window), Some(main)) => {
                let window_key = pages[window as usize].try_key();
                let main_key = pages[main as usize].try_key();
                match (window_key, main_key) {
                    (Some(window_key), Some(main_key)) => {
                        self.estimate(&window_key) <= self.estimate(&main_key)
                    }
                    (Some(_), None) => false,
                    _ => true,
                }
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };

        if use_window {
            if let Some(hit) = EvictionPolicy::<K>::try_evict(
                &mut self.window,
                pages,
                generation,
            ) {
                return Some(hit);
            }
            // everything in the window is pinned, fall back to main
            if let Some(hit) = self.main.evict(pages, generation) {
                self.migrate_window_head(pages);
                return Some(hit);
            }
            return None;
        }

        if let Some(hit) = self.main.evict(pages, generation) {
            // the window survivor gets another chance in the main area
            self.migrate_window_head(pages);
            return Some(hit);
        }
        EvictionPolicy::<K>::try_evict(&mut self.window, pages, generation)
    }
}
