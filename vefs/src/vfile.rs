//! A single logical file inside the archive.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};

use vefs_storage::alloc::CowTreeAllocator;
use vefs_storage::crypto::FileCryptoCtx;
use vefs_storage::error::{Result, ResultExt};
use vefs_storage::id::FileId;
use vefs_storage::tree::{
    lut, RootSectorInfo, SectorTreeMt, TreePosition,
};

use crate::vfilesystem::VFilesystem;

/// Shared handle to an open virtual file.
pub type VFileHandle = Arc<VFile>;

/// Binary semaphore for callers that want single-writer coordination on a
/// file; purely advisory, the engine itself never takes it.
struct FileSemaphore {
    taken: Mutex<bool>,
    released: Condvar,
}

impl FileSemaphore {
    fn new() -> Self {
        FileSemaphore {
            taken: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut taken = self.taken.lock();
        !std::mem::replace(&mut *taken, true)
    }

    fn acquire(&self) {
        let mut taken = self.taken.lock();
        while *taken {
            self.released.wait(&mut taken);
        }
        *taken = true;
    }

    fn release(&self) {
        *self.taken.lock() = false;
        self.released.notify_one();
    }
}

/// Byte-addressed reads and writes over one file's sector tree. The extent
/// grows through compare-and-swap so concurrent writers to disjoint ranges
/// compose; all mutations set the dirty flag that gates `commit`.
pub struct VFile {
    owner: Arc<VFilesystem>,
    id: FileId,
    tree: SectorTreeMt<CowTreeAllocator>,
    maximum_extent: AtomicU64,
    dirty: AtomicBool,
    semaphore: FileSemaphore,
}

impl VFile {
    pub(crate) fn open_existing(
        owner: &Arc<VFilesystem>,
        id: FileId,
        crypto_ctx: Arc<FileCryptoCtx>,
        tree_root: RootSectorInfo,
    ) -> Result<VFileHandle> {
        let tree = SectorTreeMt::open_existing(
            Arc::clone(owner.device()),
            crypto_ctx,
            tree_root,
            CowTreeAllocator::new(Arc::clone(owner.sector_allocator())),
        )
        .with_file_id(id)?;

        Ok(Arc::new(VFile {
            owner: Arc::clone(owner),
            id,
            tree,
            maximum_extent: AtomicU64::new(tree_root.maximum_extent),
            dirty: AtomicBool::new(false),
            semaphore: FileSemaphore::new(),
        }))
    }

    pub(crate) fn create_new(
        owner: &Arc<VFilesystem>,
        id: FileId,
        crypto_ctx: Arc<FileCryptoCtx>,
    ) -> Result<VFileHandle> {
        let tree = SectorTreeMt::create_new(
            Arc::clone(owner.device()),
            crypto_ctx,
            CowTreeAllocator::new(Arc::clone(owner.sector_allocator())),
        )
        .with_file_id(id)?;

        Ok(Arc::new(VFile {
            owner: Arc::clone(owner),
            id,
            tree,
            maximum_extent: AtomicU64::new(0),
            dirty: AtomicBool::new(true),
            semaphore: FileSemaphore::new(),
        }))
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn maximum_extent(&self) -> u64 {
        self.maximum_extent.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Reads `buffer.len()` bytes starting at `read_pos`. The caller is
    /// responsible for staying within the extent; sparse tails within the
    /// last sector read as zero.
    pub fn read(&self, buffer: &mut [u8], read_pos: u64) -> Result<()> {
        self.tree
            .read_bytes(buffer, read_pos)
            .with_file_id(self.id)
            .with_span(read_pos..read_pos + buffer.len() as u64)
    }

    /// Writes `data` at `write_pos`, extending the file as needed.
    pub fn write(&self, data: &[u8], write_pos: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.maximum_extent() < write_pos {
            self.truncate(write_pos)?;
        }

        self.tree
            .write_bytes(data, write_pos)
            .with_file_id(self.id)
            .with_span(write_pos..write_pos + data.len() as u64)?;

        let write_end = write_pos + data.len() as u64;
        let mut extent = self.maximum_extent.load(Ordering::Acquire);
        while extent < write_end {
            match self.maximum_extent.compare_exchange_weak(
                extent,
                write_end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => extent = observed,
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Grows or shrinks the file to exactly `size` bytes. Shrinking erases
    /// the no-longer-covered data sectors in reverse order; tree height
    /// adjusts lazily at the next commit.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let extent = self.maximum_extent();
        if extent == size {
            return Ok(());
        }

        let current_leaf = match extent {
            0 => 0,
            _ => lut::sector_position_of(extent - 1),
        };
        let target_leaf = match size {
            0 => 0,
            _ => lut::sector_position_of(size - 1),
        };

        if current_leaf < target_leaf {
            for leaf in current_leaf + 1..=target_leaf {
                self.tree
                    .access_or_create(TreePosition::data(leaf))
                    .with_file_id(self.id)?;
            }
        } else if current_leaf > target_leaf {
            for leaf in (target_leaf + 1..=current_leaf).rev() {
                self.tree.erase_leaf(leaf).with_file_id(self.id)?;
            }
        }

        self.maximum_extent.store(size, Ordering::Release);
        self.mark_dirty();
        trace!("truncated {} from {} to {} bytes", self.id, extent, size);
        Ok(())
    }

    /// Flushes the file tree and reports the new root to the directory,
    /// which in turn commits itself.
    pub fn commit(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let extent = self.maximum_extent();
        self.tree.set_maximum_extent(extent);
        let result = self
            .tree
            .commit(|root| self.owner.on_vfile_commit(self.id, root))
            .with_file_id(self.id);
        if result.is_err() {
            self.mark_dirty();
        }
        result
    }

    /// Streams the whole decrypted content into `out`.
    pub fn extract(&self, out: &mut impl Write) -> Result<()> {
        self.tree
            .extract_range(out, 0, self.maximum_extent())
            .with_file_id(self.id)
    }

    pub fn try_lock(&self) -> bool {
        self.semaphore.try_acquire()
    }

    pub fn lock(&self) {
        self.semaphore.acquire();
    }

    pub fn unlock(&self) {
        self.semaphore.release();
    }
}
