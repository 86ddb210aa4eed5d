//! Keyed, pinning, dirty-tracking cache with pluggable eviction.
//!
//! Entries live in fixed page slots. A [`CacheHandle`] is a reference
//! counted pin; pinned pages are never evicted. Dirtiness is tracked per
//! page and written back through the owner-provided [`CacheTraits`] either
//! on demand (`sync`/`sync_all`) or when a dirty page is chosen as an
//! eviction victim.

mod bloom;
mod lru;
mod page;
mod policy;
mod slru;
mod tinylfu;

pub use bloom::{BloomFilter, SpectralBloomFilter};
pub use lru::LeastRecentlyUsedPolicy;
pub use page::{PageState, ReplacementResult};
pub use policy::EvictionPolicy;
pub use slru::SegmentedLruPolicy;
pub use tinylfu::WTinyLfuPolicy;

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ErrorKind, Result};

/// Owner callbacks of a cache instance.
pub trait CacheTraits: Send + Sync {
    type Key: Copy + Eq + Hash + Send + Sync + std::fmt::Debug;
    type Value: Send + Sync;
    type LoadContext;
    type PurgeContext;

    /// Produces the entry for `key`; the boolean marks content that is
    /// born dirty (freshly created rather than read).
    fn load(
        &self,
        ctx: &mut Self::LoadContext,
        key: Self::Key,
    ) -> Result<(Self::Value, bool)>;

    /// Writes a dirty entry back to storage.
    fn sync(&self, key: Self::Key, value: &Self::Value) -> Result<()>;

    /// Runs when an entry is explicitly purged (not merely evicted).
    fn purge(
        &self,
        ctx: &Self::PurgeContext,
        key: Self::Key,
        value: &Self::Value,
    ) -> Result<()>;
}

struct ValueCell<V>(UnsafeCell<Option<V>>);

// Access is serialized by the page state machine: only the thread holding
// the `replacing` state writes, and readers hold a pin on a valid page.
unsafe impl<V: Send + Sync> Sync for ValueCell<V> {}

struct CacheCore<T: CacheTraits, P> {
    traits: T,
    states: Box<[PageState<T::Key>]>,
    values: Box<[ValueCell<T::Value>]>,
    index: Mutex<HashMap<T::Key, u16>>,
    policy: Mutex<P>,
    free: Mutex<Vec<u16>>,
}

impl<T: CacheTraits, P> CacheCore<T, P> {
    /// Caller must guarantee the slot holds a live value (pin or exclusive
    /// replacing ownership).
    fn value_ref(&self, slot: u16) -> &T::Value {
        unsafe { (*self.values[slot as usize].0.get()).as_ref() }
            .expect("cache slot holds no value")
    }

    fn store_value(&self, slot: u16, value: T::Value) {
        unsafe { *self.values[slot as usize].0.get() = Some(value) };
    }

    fn take_value(&self, slot: u16) -> Option<T::Value> {
        unsafe { (*self.values[slot as usize].0.get()).take() }
    }
}

/// A pinned reference to a cached entry. Cloning duplicates the pin; the
/// entry cannot be evicted while any handle to it exists.
pub struct CacheHandle<T: CacheTraits, P> {
    core: Arc<CacheCore<T, P>>,
    slot: u16,
    key: T::Key,
    armed: bool,
}

impl<T: CacheTraits, P> CacheHandle<T, P> {
    fn new(core: Arc<CacheCore<T, P>>, slot: u16, key: T::Key) -> Self {
        CacheHandle {
            core,
            slot,
            key,
            armed: true,
        }
    }

    pub fn key(&self) -> T::Key {
        self.key
    }

    pub fn mark_dirty(&self) {
        self.core.states[self.slot as usize].mark_dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.core.states[self.slot as usize].is_dirty()
    }

    pub fn mark_clean(&self) {
        self.core.states[self.slot as usize].mark_clean();
    }

    /// Consumes the handle without releasing its pin; the caller took
    /// ownership of the pin through the page state machine.
    fn defuse(mut self) -> u16 {
        self.armed = false;
        self.slot
    }
}

impl<T: CacheTraits, P> Clone for CacheHandle<T, P> {
    fn clone(&self) -> Self {
        self.core.states[self.slot as usize].pin_again();
        CacheHandle::new(Arc::clone(&self.core), self.slot, self.key)
    }
}

impl<T: CacheTraits, P> Drop for CacheHandle<T, P> {
    fn drop(&mut self) {
        if self.armed {
            self.core.states[self.slot as usize].release();
        }
    }
}

impl<T: CacheTraits, P> std::ops::Deref for CacheHandle<T, P> {
    type Target = T::Value;

    fn deref(&self) -> &Self::Target {
        self.core.value_ref(self.slot)
    }
}

impl<T: CacheTraits, P> std::fmt::Debug for CacheHandle<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Bounded attempts at claiming a victim before giving up; every round
/// yields to let pin holders make progress.
const EVICTION_ATTEMPTS: usize = 10_000;

/// See the module docs.
pub struct CacheMt<T: CacheTraits, P> {
    core: Arc<CacheCore<T, P>>,
}

impl<T, P> CacheMt<T, P>
where
    T: CacheTraits,
    P: EvictionPolicy<T::Key>,
{
    pub fn new(capacity: usize, traits: T) -> Self {
        assert!(capacity > 0 && capacity <= u16::MAX as usize);
        let states = (0..capacity)
            .map(|_| PageState::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let values = (0..capacity)
            .map(|_| ValueCell(UnsafeCell::new(None)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free = (0..capacity as u16).rev().collect();

        CacheMt {
            core: Arc::new(CacheCore {
                traits,
                states,
                values,
                index: Mutex::new(HashMap::with_capacity(capacity)),
                policy: Mutex::new(P::new(capacity)),
                free: Mutex::new(free),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.core.states.len()
    }

    /// Pins the entry if it is resident; never loads.
    pub fn try_pin(&self, key: T::Key) -> Option<CacheHandle<T, P>> {
        let slot = {
            let index = self.core.index.lock();
            let slot = *index.get(&key)?;
            if !self.core.states[slot as usize].try_pin() {
                return None;
            }
            slot
        };
        self.core
            .policy
            .lock()
            .on_access(&self.core.states, key, slot);
        Some(CacheHandle::new(Arc::clone(&self.core), slot, key))
    }

    /// Pins the entry, loading it through the traits on a miss. Concurrent
    /// requests for the same key are serialized on the loading page.
    pub fn pin_or_load(
        &self,
        ctx: &mut T::LoadContext,
        key: T::Key,
    ) -> Result<CacheHandle<T, P>> {
        loop {
            let slot = {
                let mut index = self.core.index.lock();
                if let Some(&slot) = index.get(&key) {
                    if self.core.states[slot as usize].try_pin() {
                        drop(index);
                        self.core.policy.lock().on_access(
                            &self.core.states,
                            key,
                            slot,
                        );
                        return Ok(CacheHandle::new(
                            Arc::clone(&self.core),
                            slot,
                            key,
                        ));
                    }
                    // the entry is mid-load or mid-replacement
                    drop(index);
                    std::thread::yield_now();
                    continue;
                }

                let slot = self.acquire_slot(&mut index)?;
                index.insert(key, slot);
                slot
            };

            return self.load_into(ctx, key, slot);
        }
    }

    /// Claims a replacing-state slot; on return the victim (if any) has
    /// been written back and dropped. Runs with the index lock held so the
    /// victim's unmapping and the new key's mapping are atomic.
    fn acquire_slot(
        &self,
        index: &mut HashMap<T::Key, u16>,
    ) -> Result<u16> {
        if let Some(slot) = self.core.free.lock().pop() {
            let mut generation = 0;
            let claimed = self.core.states[slot as usize]
                .try_start_replace(&mut generation);
            debug_assert_eq!(claimed, ReplacementResult::Dead);
            return Ok(slot);
        }

        for _ in 0..EVICTION_ATTEMPTS {
            let mut generation = 0;
            let victim = self
                .core
                .policy
                .lock()
                .try_evict(&self.core.states, &mut generation);
            let Some((slot, outcome)) = victim else {
                std::thread::yield_now();
                continue;
            };

            let victim_key = self.core.states[slot as usize].key();
            index.remove(&victim_key);

            if outcome == ReplacementResult::Dirty {
                let value = self.core.value_ref(slot);
                if let Err(err) = self.core.traits.sync(victim_key, value) {
                    // undo: the victim stays resident and dirty
                    self.core.states[slot as usize]
                        .finish_replace_dirty(victim_key);
                    self.core.states[slot as usize].release();
                    index.insert(victim_key, slot);
                    self.core.policy.lock().insert(
                        &self.core.states,
                        victim_key,
                        slot,
                    );
                    return Err(err);
                }
            }
            drop(self.core.take_value(slot));
            return Ok(slot);
        }
        Err(ErrorKind::ResourceExhausted.into())
    }

    fn load_into(
        &self,
        ctx: &mut T::LoadContext,
        key: T::Key,
        slot: u16,
    ) -> Result<CacheHandle<T, P>> {
        match self.core.traits.load(ctx, key) {
            Ok((value, dirty)) => {
                self.core.store_value(slot, value);
                if dirty {
                    self.core.states[slot as usize].finish_replace_dirty(key);
                } else {
                    self.core.states[slot as usize].finish_replace(key);
                }
                self.core
                    .policy
                    .lock()
                    .insert(&self.core.states, key, slot);
                Ok(CacheHandle::new(Arc::clone(&self.core), slot, key))
            }
            Err(err) => {
                self.core.index.lock().remove(&key);
                self.core.states[slot as usize].cancel_replace();
                self.core.free.lock().push(slot);
                Err(err)
            }
        }
    }

    /// Writes the entry back if dirty. A concurrent writer re-dirtying the
    /// page during the write is caught by the next `sync_all` pass.
    pub fn sync(&self, handle: &CacheHandle<T, P>) -> Result<()> {
        let state = &self.core.states[handle.slot as usize];
        if !state.mark_clean() {
            return Ok(());
        }
        if let Err(err) = self
            .core
            .traits
            .sync(handle.key, self.core.value_ref(handle.slot))
        {
            state.mark_dirty();
            return Err(err);
        }
        Ok(())
    }

    /// One pass over all resident entries; returns whether any entry was
    /// dirty when visited.
    pub fn sync_all(&self) -> Result<bool> {
        let mut any_dirty = false;
        for slot in 0..self.core.states.len() as u16 {
            let state = &self.core.states[slot as usize];
            if !state.is_valid() || !state.is_dirty() {
                continue;
            }
            if !state.try_pin() {
                // mid-replacement; the replacing thread syncs it
                any_dirty = true;
                continue;
            }
            let key = state.key();
            let handle =
                CacheHandle::new(Arc::clone(&self.core), slot, key);
            any_dirty = true;
            self.sync(&handle)?;
        }
        Ok(any_dirty)
    }

    /// Removes the entry the caller holds the only pin of, running the
    /// traits' purge callback under the eviction lock. Spins while other
    /// pins exist.
    pub fn purge(
        &self,
        ctx: &T::PurgeContext,
        handle: CacheHandle<T, P>,
    ) -> Result<()> {
        let slot = handle.slot;
        let key = handle.key;
        let state = &self.core.states[slot as usize];
        while state.try_start_replace_pinned() == ReplacementResult::Pinned {
            std::thread::yield_now();
        }
        let slot = handle.defuse();

        self.core.index.lock().remove(&key);

        let purge_result = {
            let mut policy = self.core.policy.lock();
            policy.on_purge(&self.core.states, key, slot);
            self.core.traits.purge(ctx, key, self.core.value_ref(slot))
        };

        drop(self.core.take_value(slot));
        self.core.states[slot as usize].cancel_replace();
        self.core.free.lock().push(slot);
        purge_result
    }

    pub fn traits(&self) -> &T {
        &self.core.traits
    }
}

impl<T: CacheTraits, P> Drop for CacheMt<T, P> {
    fn drop(&mut self) {
        // entries may pin each other (tree sectors pin their parents), so
        // keep sweeping until a pass frees nothing
        loop {
            let mut progressed = false;
            for slot in 0..self.core.states.len() as u16 {
                let state = &self.core.states[slot as usize];
                if !state.is_valid() {
                    continue;
                }
                let mut generation = 0;
                if state.try_start_replace(&mut generation)
                    != ReplacementResult::Pinned
                {
                    drop(self.core.take_value(slot));
                    state.cancel_replace();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}
