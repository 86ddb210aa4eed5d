//! The archive-wide free-sector manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::alloc::block_manager::BlockManager;
use crate::alloc::cow::ArchiveTreeAllocator;
use crate::constants::SECTOR_PAYLOAD_SIZE;
use crate::crypto::FileCryptoCtx;
use crate::device::SectorDevice;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::id::SectorId;
use crate::tree::{AccessMode, RootSectorInfo, SectorTreeSeq};
use crate::util::{BitsetMut, BitsetRef};

/// How many sectors a single host-file growth mines at once.
const MINE_BATCH: u64 = 4;

/// Hands out physical sectors, growing the host file when the pool runs
/// dry. The free pool is persisted as a bitset in its own sector tree on
/// finalize and restored (or recovered) on open.
pub struct ArchiveSectorAllocator {
    device: Arc<SectorDevice>,
    manager: Mutex<BlockManager<SectorId>>,
    crypto_ctx: Arc<FileCryptoCtx>,
    leaked: AtomicBool,
}

impl ArchiveSectorAllocator {
    pub fn new(device: Arc<SectorDevice>, crypto_ctx: FileCryptoCtx) -> Self {
        ArchiveSectorAllocator {
            device,
            manager: Mutex::new(BlockManager::new()),
            crypto_ctx: Arc::new(crypto_ctx),
            leaked: AtomicBool::new(false),
        }
    }

    /// Crypto context of the free-sector index file.
    pub fn crypto_ctx(&self) -> &Arc<FileCryptoCtx> {
        &self.crypto_ctx
    }

    pub fn device(&self) -> &Arc<SectorDevice> {
        &self.device
    }

    pub fn alloc_one(&self) -> Result<SectorId> {
        let mut manager = self.manager.lock();
        match manager.alloc_one() {
            Ok(id) => return Ok(id),
            Err(err) if err.kind() == ErrorKind::ResourceExhausted => {}
            Err(err) => return Err(err),
        }
        self.mine_new(&mut manager, MINE_BATCH)?;
        manager.alloc_one()
    }

    fn mine_new(
        &self,
        manager: &mut BlockManager<SectorId>,
        num: u64,
    ) -> Result<()> {
        let old_size = self.device.size();
        self.device.resize(old_size + num).map_err(|err| {
            Error::wrapping(ErrorKind::ResourceExhausted, err)
        })?;
        debug!("mined {num} sectors, host file now holds {}", old_size + num);

        if let Err(err) =
            manager.dealloc_contiguous(SectorId::new(old_size), num)
        {
            // roll the growth back; losing track of fresh sectors leaks them
            if self.device.resize(old_size).is_err() {
                self.on_leak_detected();
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn dealloc_one(&self, which: SectorId) -> Result<()> {
        if which.is_master() {
            return Err(ErrorKind::InvalidArgument.into());
        }
        self.manager.lock().dealloc_one(which)
    }

    pub fn dealloc_one_leaky(&self, which: SectorId) {
        if self.dealloc_one(which).is_err() {
            self.on_leak_detected();
        }
    }

    pub fn merge_from(
        &self,
        other: &mut BlockManager<SectorId>,
    ) -> Result<()> {
        self.manager.lock().merge_from(other)
    }

    pub fn merge_disjunct(
        &self,
        other: &mut BlockManager<SectorId>,
    ) -> Result<()> {
        self.manager.lock().merge_disjunct(other)
    }

    pub fn on_leak_detected(&self) {
        warn!("sector leak detected, the next open should run recovery");
        self.leaked.store(true, Ordering::Release);
    }

    pub fn sector_leak_detected(&self) -> bool {
        self.leaked.load(Ordering::Acquire)
    }

    /// Starts from an empty pool; sectors are mined on demand.
    pub fn initialize_new(&self) -> Result<()> {
        self.manager.lock().clear();
        Ok(())
    }

    /// Releases the trailing free range back to the host file.
    pub fn trim_trailing(&self) -> Result<()> {
        let num_sectors = self.device.size();
        let trimmed = {
            let mut manager = self.manager.lock();
            manager.trim_ids(SectorId::new(num_sectors))
        };
        if trimmed > 0 {
            self.device.resize(num_sectors - trimmed)?;
            info!("released {trimmed} trailing free sectors");
        }
        Ok(())
    }

    /// Restores the pool from a persisted free-sector index, then releases
    /// the trailing free range back to the host file.
    pub fn initialize_from(&self, root: RootSectorInfo) -> Result<()> {
        let num_sectors = self.device.size();
        let image_bytes = root.maximum_extent as usize;
        let mut image = vec![0u8; image_bytes];

        let mut tree = SectorTreeSeq::open_existing(
            self.device.clone(),
            self.crypto_ctx.clone(),
            root,
            ArchiveTreeAllocator::new(self),
        )
        .with_file_path("[free-block-list]")?;

        for (leaf, chunk) in
            image.chunks_mut(SECTOR_PAYLOAD_SIZE).enumerate()
        {
            tree.move_to(leaf as u64, AccessMode::Read)
                .with_file_path("[free-block-list]")?;
            chunk.copy_from_slice(&tree.bytes()[..chunk.len()]);
        }

        // the master sector can never be free, whatever the image claims
        if !image.is_empty() {
            image[0] |= 1;
        }

        let covered = (image_bytes as u64 * 8).min(num_sectors);
        let mut manager = self.manager.lock();
        manager.clear();
        manager.parse_bitset(
            &BitsetRef::new(&image),
            SectorId::MASTER,
            covered as usize,
        )?;

        if covered == num_sectors {
            let trimmed = manager.trim_ids(SectorId::new(num_sectors));
            if trimmed > 0 {
                drop(manager);
                self.device.resize(num_sectors - trimmed)?;
                info!("released {trimmed} trailing free sectors");
            }
        }
        Ok(())
    }

    /// Writes the current pool as a bitset into a fresh sector tree and
    /// stores its root in the archive header next to the directory root.
    ///
    /// The snapshot is taken before the index tree itself allocates, so the
    /// tree's own sectors read as free in the stored image; that is exactly
    /// right because the tree is discarded again after the next open parses
    /// it.
    pub fn finalize(
        &self,
        directory_ctx: &FileCryptoCtx,
        directory_root: RootSectorInfo,
    ) -> Result<()> {
        let num_sectors = self.device.size();
        let image_bytes = num_sectors.div_ceil(8) as usize;
        let mut image = vec![0u8; image_bytes];
        self.manager.lock().write_to_bitset(
            BitsetMut::new(&mut image),
            SectorId::MASTER,
            num_sectors as usize,
        );

        let mut tree = SectorTreeSeq::create_new(
            self.device.clone(),
            self.crypto_ctx.clone(),
            ArchiveTreeAllocator::new(self),
        )
        .with_file_path("[free-block-list]")?;

        for (leaf, chunk) in image.chunks(SECTOR_PAYLOAD_SIZE).enumerate() {
            tree.move_to(leaf as u64, AccessMode::Create)
                .with_file_path("[free-block-list]")?;
            tree.writable_bytes()[..chunk.len()].copy_from_slice(chunk);
        }

        let mut index_root = tree.commit().with_file_path("[free-block-list]")?;
        index_root.maximum_extent = image_bytes as u64;

        self.device.update_header(
            directory_ctx,
            directory_root,
            &self.crypto_ctx,
            index_root,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OnlyMacProvider;
    use crate::device::ArchiveOpening;

    fn test_allocator() -> (tempfile::TempDir, Arc<ArchiveSectorAllocator>) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("archive.vefs"))
            .unwrap();
        let ArchiveOpening {
            device,
            free_sector_index,
            ..
        } = crate::device::SectorDevice::create_new(
            file,
            Box::new(OnlyMacProvider),
            &[0u8; 32],
        )
        .unwrap();
        let allocator = Arc::new(ArchiveSectorAllocator::new(
            Arc::new(device),
            free_sector_index.crypto_ctx,
        ));
        (dir, allocator)
    }

    #[test]
    fn exhaustion_grows_the_host_file_in_batches() {
        let (_dir, allocator) = test_allocator();
        assert_eq!(allocator.device().size(), 1);

        let first = allocator.alloc_one().unwrap();
        assert_eq!(first, SectorId::new(1));
        assert_eq!(allocator.device().size(), 1 + MINE_BATCH);

        // the rest of the batch is served without growing again
        for expected in 2..=MINE_BATCH {
            assert_eq!(allocator.alloc_one().unwrap(), SectorId::new(expected));
        }
        assert_eq!(allocator.device().size(), 1 + MINE_BATCH);
    }

    #[test]
    fn deallocated_sectors_are_reused_first() {
        let (_dir, allocator) = test_allocator();
        let a = allocator.alloc_one().unwrap();
        let _b = allocator.alloc_one().unwrap();
        allocator.dealloc_one(a).unwrap();
        assert_eq!(allocator.alloc_one().unwrap(), a);
    }

    #[test]
    fn finalize_and_initialize_round_trip_the_pool() {
        let (_dir, allocator) = test_allocator();
        let ids: Vec<SectorId> =
            (0..6).map(|_| allocator.alloc_one().unwrap()).collect();
        allocator.dealloc_one(ids[2]).unwrap();
        allocator.dealloc_one(ids[4]).unwrap();

        let directory_ctx =
            allocator.device().create_file_secrets().unwrap();
        allocator
            .finalize(&directory_ctx, RootSectorInfo::default())
            .unwrap();

        // reopen path: a fresh allocator parses the stored bitset
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .open(_dir.path().join("archive.vefs"))
            .unwrap();
        drop(allocator);
        let ArchiveOpening {
            device,
            free_sector_index,
            ..
        } = crate::device::SectorDevice::open_existing(
            file,
            Box::new(OnlyMacProvider),
            &[0u8; 32],
        )
        .unwrap();
        let recovered = Arc::new(ArchiveSectorAllocator::new(
            Arc::new(device),
            free_sector_index.crypto_ctx,
        ));
        recovered
            .initialize_from(free_sector_index.tree_info)
            .unwrap();

        // the two freed sectors come back before the file grows again
        let size_before = recovered.device().size();
        let x = recovered.alloc_one().unwrap();
        let y = recovered.alloc_one().unwrap();
        assert!([ids[2], ids[4]].contains(&x));
        assert!([ids[2], ids[4]].contains(&y));
        assert_eq!(recovered.device().size(), size_before);
    }
}
