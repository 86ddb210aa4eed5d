//! Per-tree allocation façades over the archive sector allocator.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::alloc::sector_alloc::ArchiveSectorAllocator;
use crate::error::Result;
use crate::id::SectorId;

/// Allocation bookkeeping carried by every tree sector.
#[derive(Debug)]
pub struct NodeAllocation {
    current: SectorId,
    epoch: i64,
}

impl NodeAllocation {
    /// `current` is the sector's physical position as read from its parent
    /// reference, or the master id if it has never been written.
    pub fn new(current: SectorId) -> Self {
        NodeAllocation { current, epoch: -1 }
    }

    pub fn current(&self) -> SectorId {
        self.current
    }
}

/// Allocation strategy a sector tree writes through.
pub trait TreeAllocator: Send + Sync {
    /// Returns the physical sector the node must be written to next.
    fn reallocate(&self, node: &mut NodeAllocation) -> Result<SectorId>;

    /// Releases the node's physical sector; failures set the leak flag
    /// instead of propagating.
    fn dealloc(&self, node: &mut NodeAllocation);

    /// Releases a bare physical id.
    fn dealloc_one(&self, id: SectorId) -> Result<()>;

    /// Transaction boundary; pending releases become reusable.
    fn on_commit(&self) -> Result<()>;

    fn on_leak_detected(&self);
}

const RECYCLE_RING_CAPACITY: usize = 128;

/// Copy-on-write allocator: within one commit epoch a node keeps the sector
/// it was first assigned, across epochs it always moves, and the superseded
/// sector is only released once the epoch commits.
pub struct CowTreeAllocator {
    source: Arc<ArchiveSectorAllocator>,
    epoch: AtomicI64,
    recycled: Mutex<Vec<SectorId>>,
    overwritten: Mutex<Vec<SectorId>>,
}

impl CowTreeAllocator {
    pub fn new(source: Arc<ArchiveSectorAllocator>) -> Self {
        CowTreeAllocator {
            source,
            epoch: AtomicI64::new(0),
            recycled: Mutex::new(Vec::with_capacity(RECYCLE_RING_CAPACITY)),
            overwritten: Mutex::new(Vec::new()),
        }
    }

    fn try_alloc_recycled(&self) -> Option<SectorId> {
        self.recycled.lock().pop()
    }
}

impl TreeAllocator for CowTreeAllocator {
    fn reallocate(&self, node: &mut NodeAllocation) -> Result<SectorId> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if node.epoch == epoch {
            return Ok(node.current);
        }

        let allocation = match self.try_alloc_recycled() {
            Some(id) => id,
            None => self.source.alloc_one()?,
        };
        node.epoch = epoch;

        let previous = std::mem::replace(&mut node.current, allocation);
        if !previous.is_master() {
            self.overwritten.lock().push(previous);
        }
        Ok(allocation)
    }

    fn dealloc(&self, node: &mut NodeAllocation) {
        let id = std::mem::replace(&mut node.current, SectorId::MASTER);
        node.epoch = -1;
        if !id.is_master() {
            self.overwritten.lock().push(id);
        }
    }

    fn dealloc_one(&self, id: SectorId) -> Result<()> {
        self.overwritten.lock().push(id);
        Ok(())
    }

    fn on_commit(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut recycled = self.recycled.lock();
        let mut overwritten = self.overwritten.lock();

        let room = RECYCLE_RING_CAPACITY - recycled.len();
        let keep = room.min(overwritten.len());
        recycled.extend(overwritten.drain(..keep));
        for id in overwritten.drain(..) {
            self.source.dealloc_one_leaky(id);
        }
        Ok(())
    }

    fn on_leak_detected(&self) {
        self.source.on_leak_detected();
    }
}

impl Drop for CowTreeAllocator {
    fn drop(&mut self) {
        let overwritten = self.overwritten.get_mut();
        if !overwritten.is_empty() {
            // an uncommitted transaction is being abandoned
            warn!(
                "dropping a tree allocator with {} uncommitted deallocations",
                overwritten.len()
            );
            self.source.on_leak_detected();
        }
        for id in self.recycled.get_mut().drain(..) {
            self.source.dealloc_one_leaky(id);
        }
    }
}

/// Pass-through allocator used by sequential trees: nodes keep their sector
/// across writes and releases go straight to the archive allocator.
///
/// Generic over how the archive allocator is held so the allocator can
/// build inspection trees over itself without an `Arc` round trip.
pub struct ArchiveTreeAllocator<S = Arc<ArchiveSectorAllocator>> {
    source: S,
}

impl<S> ArchiveTreeAllocator<S> {
    pub fn new(source: S) -> Self {
        ArchiveTreeAllocator { source }
    }
}

impl<S> TreeAllocator for ArchiveTreeAllocator<S>
where
    S: std::ops::Deref<Target = ArchiveSectorAllocator> + Send + Sync,
{
    fn reallocate(&self, node: &mut NodeAllocation) -> Result<SectorId> {
        if !node.current.is_master() {
            return Ok(node.current);
        }
        node.current = self.source.alloc_one()?;
        Ok(node.current)
    }

    fn dealloc(&self, node: &mut NodeAllocation) {
        let id = std::mem::replace(&mut node.current, SectorId::MASTER);
        if !id.is_master() {
            self.source.dealloc_one_leaky(id);
        }
    }

    fn dealloc_one(&self, id: SectorId) -> Result<()> {
        self.source.dealloc_one(id)
    }

    fn on_commit(&self) -> Result<()> {
        Ok(())
    }

    fn on_leak_detected(&self) {
        self.source.on_leak_detected();
    }
}
