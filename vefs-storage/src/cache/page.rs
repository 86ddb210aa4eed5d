//! Atomic state machine of one cache page.
//!
//! A page is `free` until its first load, then cycles through
//! `clean`/`dirty` with a pin count, is exclusively held while `replacing`,
//! and parks as `dead` after a failed load. Pin counts live in the low half
//! of a single atomic word, the flags in the high half, so pinning and the
//! dirty transitions never take a lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

const PIN_MASK: u64 = 0xFFFF_FFFF;
const FLAG_VALID: u64 = 1 << 32;
const FLAG_DIRTY: u64 = 1 << 33;
const FLAG_REPLACING: u64 = 1 << 34;

/// Outcome of [`PageState::try_start_replace`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplacementResult {
    /// The page is pinned (or already being replaced); pick another victim.
    Pinned,
    /// The page held clean content which may be discarded.
    Clean,
    /// The page held dirty content which must be written back first.
    Dirty,
    /// The page held no live content.
    Dead,
}

/// See the module docs.
pub struct PageState<K> {
    bits: AtomicU64,
    generation: AtomicU32,
    key: Mutex<Option<K>>,
}

impl<K: Copy> Default for PageState<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy> PageState<K> {
    pub fn new() -> Self {
        PageState {
            bits: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            key: Mutex::new(None),
        }
    }

    /// The key of the entry currently stored in this page.
    ///
    /// Only meaningful between `finish_replace` and the next successful
    /// `try_start_replace`.
    pub fn key(&self) -> K {
        self.key.lock().expect("page holds no entry")
    }

    pub fn try_key(&self) -> Option<K> {
        *self.key.lock()
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.bits.load(Ordering::Acquire) & PIN_MASK != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.bits.load(Ordering::Acquire) & FLAG_DIRTY != 0
    }

    pub fn is_valid(&self) -> bool {
        self.bits.load(Ordering::Acquire) & FLAG_VALID != 0
    }

    pub fn mark_dirty(&self) {
        self.bits.fetch_or(FLAG_DIRTY, Ordering::AcqRel);
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn mark_clean(&self) -> bool {
        self.bits.fetch_and(!FLAG_DIRTY, Ordering::AcqRel) & FLAG_DIRTY != 0
    }

    /// Takes an additional pin on a live entry.
    pub fn try_pin(&self) -> bool {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & FLAG_VALID == 0 || current & FLAG_REPLACING != 0 {
                return false;
            }
            match self.bits.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Duplicates a pin the caller already holds.
    pub fn pin_again(&self) {
        let previous = self.bits.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous & PIN_MASK != 0);
    }

    /// Releases one pin.
    pub fn release(&self) {
        let previous = self.bits.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & PIN_MASK != 0);
    }

    /// Tries to take the page for replacement. Succeeds only while no pin
    /// is held; the winner owns the page exclusively until
    /// [`Self::finish_replace`] or [`Self::cancel_replace`].
    pub fn try_start_replace(
        &self,
        generation: &mut u32,
    ) -> ReplacementResult {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & PIN_MASK != 0 || current & FLAG_REPLACING != 0 {
                return ReplacementResult::Pinned;
            }
            match self.bits.compare_exchange_weak(
                current,
                FLAG_REPLACING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    *generation = self.generation.load(Ordering::Acquire);
                    return if current & FLAG_VALID == 0 {
                        ReplacementResult::Dead
                    } else if current & FLAG_DIRTY != 0 {
                        ReplacementResult::Dirty
                    } else {
                        ReplacementResult::Clean
                    };
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Like `try_start_replace` but requires exactly the caller's single
    /// pin, which is consumed. Used by purge.
    pub fn try_start_replace_pinned(&self) -> ReplacementResult {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & PIN_MASK != 1 || current & FLAG_REPLACING != 0 {
                return ReplacementResult::Pinned;
            }
            match self.bits.compare_exchange_weak(
                current,
                FLAG_REPLACING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return if current & FLAG_DIRTY != 0 {
                        ReplacementResult::Dirty
                    } else {
                        ReplacementResult::Clean
                    };
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Publishes new content: the page becomes valid with one pin held by
    /// the loader.
    pub fn finish_replace(&self, key: K) {
        *self.key.lock() = Some(key);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bits.store(FLAG_VALID | 1, Ordering::Release);
    }

    /// Same, but the fresh content is already dirty.
    pub fn finish_replace_dirty(&self, key: K) {
        *self.key.lock() = Some(key);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bits.store(FLAG_VALID | FLAG_DIRTY | 1, Ordering::Release);
    }

    /// Abandons a replacement; the page is dead afterwards.
    pub fn cancel_replace(&self) {
        *self.key.lock() = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bits.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pages_replace_as_dead() {
        let page = PageState::<u64>::new();
        let mut generation = u32::MAX;
        assert_eq!(page.try_start_replace(&mut generation), ReplacementResult::Dead);
        assert_eq!(generation, 0);
        page.finish_replace(0xdead_beef);
        assert_eq!(page.key(), 0xdead_beef);
        assert!(page.is_pinned());
        page.release();
        assert!(!page.is_pinned());
    }

    #[test]
    fn pinned_pages_cannot_be_replaced() {
        let page = PageState::<u64>::new();
        let mut generation = 0;
        let _ = page.try_start_replace(&mut generation);
        page.finish_replace(1);

        assert_eq!(
            page.try_start_replace(&mut generation),
            ReplacementResult::Pinned
        );
        page.release();
        assert_eq!(
            page.try_start_replace(&mut generation),
            ReplacementResult::Clean
        );
    }

    #[test]
    fn dirty_state_is_reported_to_the_evictor() {
        let page = PageState::<u64>::new();
        let mut generation = 0;
        let _ = page.try_start_replace(&mut generation);
        page.finish_replace(1);
        page.mark_dirty();
        page.release();

        assert_eq!(
            page.try_start_replace(&mut generation),
            ReplacementResult::Dirty
        );
    }

    #[test]
    fn concurrent_pins_count_up_and_down() {
        let page = PageState::<u64>::new();
        let mut generation = 0;
        let _ = page.try_start_replace(&mut generation);
        page.finish_replace(1);
        assert!(page.try_pin());
        page.pin_again();
        page.release();
        page.release();
        page.release();
        assert!(!page.is_pinned());
    }
}
