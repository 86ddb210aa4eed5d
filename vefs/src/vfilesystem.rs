//! The virtual filesystem directory.
//!
//! The directory is itself a file in the archive: a sector tree whose
//! payload is partitioned into a 64-byte allocation bitmap followed by 510
//! blocks of 64 bytes per sector. Every directory entry occupies a
//! contiguous run of blocks holding its framed CBOR descriptor; block
//! numbering is global across sectors, so runs may span a sector boundary.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use vefs_storage::alloc::{
    ArchiveSectorAllocator, ArchiveTreeAllocator, BlockManager,
    CowTreeAllocator,
};
use vefs_storage::constants::SECTOR_PAYLOAD_SIZE;
use vefs_storage::crypto::FileCryptoCtx;
use vefs_storage::device::{MasterFileInfo, SectorDevice};
use vefs_storage::error::{Error, ErrorKind, Result, ResultExt};
use vefs_storage::id::FileId;
use vefs_storage::tree::{
    lut, AccessMode, RootSectorInfo, SectorTreeMt, SectorTreeSeq,
    TreePosition, TreeReadHandle,
};
use vefs_storage::util::{BitsetMut, BitsetRef};

use crate::descriptor::{bstr_head, parse_bstr_head, FileDescriptor};
use crate::vfile::{VFile, VFileHandle};
use crate::workers::WorkerPool;

bitflags::bitflags! {
    /// How a virtual file is opened.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNCATE = 1 << 3;
    }
}

impl OpenMode {
    pub fn read_write() -> Self {
        OpenMode::READ | OpenMode::WRITE
    }
}

/// Answer to [`VFilesystem::query`].
#[derive(Clone, Copy, Debug)]
pub struct FileQueryResult {
    pub allowed_modes: OpenMode,
    pub size: u64,
}

const BLOCK_SIZE: u64 = 64;
const ALLOC_MAP_SIZE: usize = 64;
const BLOCKS_PER_SECTOR: u64 =
    (SECTOR_PAYLOAD_SIZE as u64 - ALLOC_MAP_SIZE as u64) / BLOCK_SIZE;

struct DirectoryEntry {
    /// First block of the entry's run, or `None` while unindexed.
    index_file_position: Option<u64>,
    num_reserved_blocks: u64,
    crypto_ctx: Arc<FileCryptoCtx>,
    instance: std::sync::Weak<VFile>,
    needs_index_update: bool,
    tree_info: RootSectorInfo,
}

type IndexTree = SectorTreeMt<CowTreeAllocator>;
type InspectionTree = SectorTreeSeq<ArchiveTreeAllocator>;

/// See the module docs.
pub struct VFilesystem {
    // handed to virtual files as their owner reference
    self_ref: std::sync::Weak<VFilesystem>,

    device: Arc<SectorDevice>,
    allocator: Arc<ArchiveSectorAllocator>,
    workers: Arc<WorkerPool>,

    crypto_ctx: Arc<FileCryptoCtx>,
    committed_root: Mutex<RootSectorInfo>,

    index: RwLock<HashMap<String, FileId>>,
    files: Mutex<HashMap<FileId, DirectoryEntry>>,
    index_blocks: Mutex<BlockManager<u64>>,
    index_tree: IndexTree,

    write_flag: AtomicBool,
    commit_sync: Mutex<()>,
}

impl VFilesystem {
    fn construct(
        device: Arc<SectorDevice>,
        allocator: Arc<ArchiveSectorAllocator>,
        workers: Arc<WorkerPool>,
        crypto_ctx: Arc<FileCryptoCtx>,
        committed_root: RootSectorInfo,
        index_tree: IndexTree,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| VFilesystem {
            self_ref: self_ref.clone(),
            device,
            allocator,
            workers,
            crypto_ctx,
            committed_root: Mutex::new(committed_root),
            index: RwLock::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            index_blocks: Mutex::new(BlockManager::new()),
            index_tree,
            write_flag: AtomicBool::new(false),
            commit_sync: Mutex::new(()),
        })
    }

    fn owner_handle(&self) -> Arc<VFilesystem> {
        self.self_ref.upgrade().expect("filesystem is alive")
    }

    pub(crate) fn open_existing(
        device: Arc<SectorDevice>,
        allocator: Arc<ArchiveSectorAllocator>,
        workers: Arc<WorkerPool>,
        info: MasterFileInfo,
    ) -> Result<Arc<Self>> {
        let crypto_ctx = Arc::new(info.crypto_ctx);
        if info.tree_info.maximum_extent == 0
            || info.tree_info.maximum_extent % SECTOR_PAYLOAD_SIZE as u64 != 0
        {
            return Err(ErrorKind::VFilesystemInvalidSize.into());
        }

        let index_tree = SectorTreeMt::open_existing(
            Arc::clone(&device),
            Arc::clone(&crypto_ctx),
            info.tree_info,
            CowTreeAllocator::new(Arc::clone(&allocator)),
        )
        .with_file_path("[archive-index]")?;

        let filesystem = Self::construct(
            device,
            allocator,
            workers,
            crypto_ctx,
            info.tree_info,
            index_tree,
        );
        filesystem.parse_index()?;
        Ok(filesystem)
    }

    pub(crate) fn create_new(
        device: Arc<SectorDevice>,
        allocator: Arc<ArchiveSectorAllocator>,
        workers: Arc<WorkerPool>,
        info: MasterFileInfo,
    ) -> Result<Arc<Self>> {
        let crypto_ctx = Arc::new(info.crypto_ctx);
        let index_tree = SectorTreeMt::create_new(
            Arc::clone(&device),
            Arc::clone(&crypto_ctx),
            CowTreeAllocator::new(Arc::clone(&allocator)),
        )
        .with_file_path("[archive-index]")?;

        let mut committed_root = info.tree_info;
        committed_root.maximum_extent = SECTOR_PAYLOAD_SIZE as u64;

        let filesystem = Self::construct(
            device,
            allocator,
            workers,
            crypto_ctx,
            committed_root,
            index_tree,
        );
        filesystem
            .index_blocks
            .lock()
            .dealloc_contiguous(0, BLOCKS_PER_SECTOR)?;
        filesystem.write_flag.store(true, Ordering::Release);
        Ok(filesystem)
    }

    pub(crate) fn device(&self) -> &Arc<SectorDevice> {
        &self.device
    }

    pub(crate) fn sector_allocator(&self) -> &Arc<ArchiveSectorAllocator> {
        &self.allocator
    }

    pub fn crypto_ctx(&self) -> &Arc<FileCryptoCtx> {
        &self.crypto_ctx
    }

    pub fn committed_root(&self) -> RootSectorInfo {
        *self.committed_root.lock()
    }

    /// Walks the on-disk directory image, registering every entry and
    /// collecting unoccupied blocks into the block pool.
    fn parse_index(&self) -> Result<()> {
        let committed = self.committed_root();
        let last_sector =
            lut::sector_position_of(committed.maximum_extent - 1);
        let total_blocks = (last_sector + 1) * BLOCKS_PER_SECTOR;

        let mut index = self.index.write();
        let mut files = self.files.lock();
        let mut blocks = self.index_blocks.lock();

        let mut block = 0u64;
        while block < total_blocks {
            let sector = self
                .index_tree
                .access(TreePosition::data(block / BLOCKS_PER_SECTOR))
                .with_file_path("[archive-index]")?;
            let occupied = {
                let content = sector.content();
                BitsetRef::new(&content[..ALLOC_MAP_SIZE])
                    .get((block % BLOCKS_PER_SECTOR) as usize)
            };
            drop(sector);

            if !occupied {
                blocks.dealloc_one(block)?;
                block += 1;
                continue;
            }

            let head = self.read_entry_bytes(block, BLOCK_SIZE as usize)?;
            let (head_len, payload_len) = parse_bstr_head(&head)
                .map_err(|err| {
                    Error::wrapping(ErrorKind::CorruptIndexEntry, err)
                })?;
            let total_len = head_len + payload_len;
            let num_blocks = (total_len as u64).div_ceil(BLOCK_SIZE);
            if block + num_blocks > total_blocks {
                return Err(ErrorKind::CorruptIndexEntry.into());
            }
            self.verify_allocation(block, num_blocks)?;

            let raw = self.read_entry_bytes(block, total_len)?;
            let descriptor = FileDescriptor::decode(&raw[head_len..])
                .map_err(|err| {
                    Error::wrapping(ErrorKind::CorruptIndexEntry, err)
                })?;

            files.insert(
                descriptor.file_id,
                DirectoryEntry {
                    index_file_position: Some(block),
                    num_reserved_blocks: num_blocks,
                    crypto_ctx: Arc::new(FileCryptoCtx::new(
                        descriptor.secret,
                        descriptor.secret_counter,
                    )),
                    instance: std::sync::Weak::new(),
                    needs_index_update: false,
                    tree_info: descriptor.tree_info,
                },
            );
            index.insert(descriptor.file_path, descriptor.file_id);

            block += num_blocks;
        }

        info!("directory holds {} files", index.len());
        Ok(())
    }

    /// Ensures every block of `[start, start + num)` is marked occupied.
    fn verify_allocation(&self, start: u64, num: u64) -> Result<()> {
        for block in start..start + num {
            let sector = self
                .index_tree
                .access(TreePosition::data(block / BLOCKS_PER_SECTOR))?;
            let content = sector.content();
            let occupied = BitsetRef::new(&content[..ALLOC_MAP_SIZE])
                .get((block % BLOCKS_PER_SECTOR) as usize);
            if !occupied {
                return Err(ErrorKind::CorruptIndexEntry.into());
            }
        }
        Ok(())
    }

    fn read_entry_bytes(&self, start_block: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut block = start_block;
        while out.len() < len {
            let sector_position = block / BLOCKS_PER_SECTOR;
            let in_sector = block % BLOCKS_PER_SECTOR;
            let capacity =
                ((BLOCKS_PER_SECTOR - in_sector) * BLOCK_SIZE) as usize;
            let take = capacity.min(len - out.len());

            let sector = self
                .index_tree
                .access(TreePosition::data(sector_position))?;
            let content = sector.content();
            let offset = ALLOC_MAP_SIZE + (in_sector * BLOCK_SIZE) as usize;
            out.extend_from_slice(&content[offset..offset + take]);

            block += BLOCKS_PER_SECTOR - in_sector;
        }
        Ok(out)
    }

    fn write_entry_bytes(&self, start_block: u64, bytes: &[u8]) -> Result<()> {
        let mut remaining = bytes;
        let mut block = start_block;
        while !remaining.is_empty() {
            let sector_position = block / BLOCKS_PER_SECTOR;
            let in_sector = block % BLOCKS_PER_SECTOR;
            let capacity =
                ((BLOCKS_PER_SECTOR - in_sector) * BLOCK_SIZE) as usize;
            let take = capacity.min(remaining.len());

            let sector = self
                .index_tree
                .access(TreePosition::data(sector_position))?;
            {
                let mut content = sector.content_mut();
                let offset =
                    ALLOC_MAP_SIZE + (in_sector * BLOCK_SIZE) as usize;
                content[offset..offset + take]
                    .copy_from_slice(&remaining[..take]);
            }
            self.write_block_header(&sector);

            remaining = &remaining[take..];
            block += BLOCKS_PER_SECTOR - in_sector;
        }
        Ok(())
    }

    /// Rewrites the allocation bitmap of one directory sector from the
    /// block pool.
    fn write_block_header(&self, sector: &TreeReadHandle<CowTreeAllocator>) {
        let begin = sector.node_position().position() * BLOCKS_PER_SECTOR;
        let blocks = self.index_blocks.lock();
        let mut content = sector.content_mut();
        let map = &mut content[..ALLOC_MAP_SIZE];
        map.fill(0);
        blocks.write_to_bitset(
            BitsetMut::new(map),
            begin,
            BLOCKS_PER_SECTOR as usize,
        );
    }

    /// Returns an entry's blocks to the pool and refreshes the affected
    /// sector bitmaps.
    fn decommission_blocks(&self, start: u64, num: u64) -> Result<()> {
        if num == 0 {
            return Ok(());
        }
        self.index_blocks.lock().dealloc_contiguous(start, num)?;

        let first_sector = start / BLOCKS_PER_SECTOR;
        let last_sector = (start + num - 1) / BLOCKS_PER_SECTOR;
        for sector_position in first_sector..=last_sector {
            let sector = self
                .index_tree
                .access(TreePosition::data(sector_position))?;
            self.write_block_header(&sector);
        }
        Ok(())
    }

    /// Finds (or grows) a block run for an entry that needs `needed`
    /// blocks, preferring to extend or shrink its current run in place.
    fn reallocate_entry_blocks(
        &self,
        entry: &mut DirectoryEntry,
        needed: u64,
        last_allocated: &mut u64,
    ) -> Result<()> {
        let needed = needed.max(1);
        if entry.index_file_position.is_some()
            && entry.num_reserved_blocks == needed
        {
            return Ok(());
        }

        let previous = entry.index_file_position.take();
        let reserved = std::mem::take(&mut entry.num_reserved_blocks);

        let mut position = previous;
        if let Some(start) = previous {
            if needed > reserved {
                let grown = self.index_blocks.lock().extend(
                    start,
                    start + reserved - 1,
                    needed - reserved,
                );
                match grown {
                    Ok(new_start) => position = Some(new_start),
                    Err(err)
                        if err.kind() == ErrorKind::ResourceExhausted =>
                    {
                        self.decommission_blocks(start, reserved)?;
                        position = None;
                    }
                    Err(err) => return Err(err),
                }
            } else if needed < reserved {
                self.decommission_blocks(start + needed, reserved - needed)?;
            }
        }

        let position = match position {
            Some(position) => position,
            None => loop {
                match self.index_blocks.lock().alloc_contiguous(needed) {
                    Ok(position) => break position,
                    Err(err)
                        if err.kind() == ErrorKind::ResourceExhausted => {}
                    Err(err) => return Err(err),
                }
                // grow the directory by one sector and pool its blocks
                *last_allocated += 1;
                self.index_tree
                    .access_or_create(TreePosition::data(*last_allocated))?;
                self.index_blocks.lock().dealloc_contiguous(
                    *last_allocated * BLOCKS_PER_SECTOR,
                    BLOCKS_PER_SECTOR,
                )?;
            },
        };

        entry.index_file_position = Some(position);
        entry.num_reserved_blocks = needed;
        Ok(())
    }

    /// Opens (or creates) the file at `path`.
    pub fn open(
        &self,
        path: &str,
        mode: OpenMode,
    ) -> Result<VFileHandle> {
        let existing = { self.index.read().get(path).copied() };
        let handle = match existing {
            Some(id) => self.open_by_id(id)?,
            None => {
                if !mode.contains(OpenMode::CREATE) {
                    return Err(Error::new(ErrorKind::NoSuchVFile)
                        .with_file_path(path));
                }
                self.create_at(path)?
            }
        };
        if mode.contains(OpenMode::TRUNCATE) {
            handle.truncate(0)?;
        }
        Ok(handle)
    }

    fn create_at(&self, path: &str) -> Result<VFileHandle> {
        let mut index = self.index.write();
        if let Some(&id) = index.get(path) {
            // someone else created it while we took the lock
            return self.open_by_id(id);
        }

        let crypto_ctx = Arc::new(self.device.create_file_secrets()?);
        let id = FileId::generate();
        let handle =
            VFile::create_new(&self.owner_handle(), id, Arc::clone(&crypto_ctx))?;

        self.files.lock().insert(
            id,
            DirectoryEntry {
                index_file_position: None,
                num_reserved_blocks: 0,
                crypto_ctx,
                instance: Arc::downgrade(&handle),
                needs_index_update: false,
                tree_info: RootSectorInfo::default(),
            },
        );
        index.insert(path.to_owned(), id);
        self.write_flag.store(true, Ordering::Release);
        info!("created vfile {id} at {path:?}");
        Ok(handle)
    }

    fn open_by_id(&self, id: FileId) -> Result<VFileHandle> {
        let mut files = self.files.lock();
        let entry = files
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchVFile).with_file_id(id))?;

        if let Some(handle) = entry.instance.upgrade() {
            return Ok(handle);
        }
        let handle = VFile::open_existing(
            &self.owner_handle(),
            id,
            Arc::clone(&entry.crypto_ctx),
            entry.tree_info,
        )?;
        entry.instance = Arc::downgrade(&handle);
        Ok(handle)
    }

    /// Removes the file at `path` unless a live handle exists. The entry
    /// vanishes from the committed index before the file's sectors are
    /// scrubbed on the worker pool.
    pub fn erase(&self, path: &str) -> Result<()> {
        let id = self
            .index
            .read()
            .get(path)
            .copied()
            .ok_or_else(|| {
                Error::new(ErrorKind::NoSuchVFile).with_file_path(path)
            })?;

        let victim = {
            let mut files = self.files.lock();
            let entry = files.get(&id).ok_or_else(|| {
                Error::new(ErrorKind::NoSuchVFile).with_file_path(path)
            })?;
            if entry.instance.upgrade().is_some() {
                return Err(Error::new(ErrorKind::StillInUse)
                    .with_file_path(path)
                    .with_file_id(id));
            }
            files.remove(&id).expect("entry present")
        };
        self.index.write().remove(path);
        self.write_flag.store(true, Ordering::Release);

        if let Some(position) = victim.index_file_position {
            self.decommission_blocks(position, victim.num_reserved_blocks)?;
            // commit first so a crash cannot resurrect the file while its
            // sectors are being scrubbed
            self.commit()?;
        }

        if victim.tree_info.root.is_unallocated() {
            return Ok(());
        }

        let device = Arc::clone(&self.device);
        let allocator = Arc::clone(&self.allocator);
        let crypto_ctx = Arc::clone(&victim.crypto_ctx);
        let tree_info = victim.tree_info;
        self.workers.execute(move || {
            if let Err(err) =
                erase_file_sectors(&device, &allocator, crypto_ctx, tree_info)
            {
                warn!("background erase of {id} failed: {err}");
                allocator.on_leak_detected();
            }
        });
        info!("erased vfile {id} at {path:?}");
        Ok(())
    }

    pub fn query(&self, path: &str) -> Result<FileQueryResult> {
        let id = self
            .index
            .read()
            .get(path)
            .copied()
            .ok_or_else(|| {
                Error::new(ErrorKind::NoSuchVFile).with_file_path(path)
            })?;
        let files = self.files.lock();
        let entry = files.get(&id).ok_or_else(|| {
            Error::new(ErrorKind::NoSuchVFile).with_file_path(path)
        })?;

        let size = match entry.instance.upgrade() {
            Some(handle) => handle.maximum_extent(),
            None => entry.tree_info.maximum_extent,
        };
        Ok(FileQueryResult {
            allowed_modes: OpenMode::read_write(),
            size,
        })
    }

    pub fn list_files(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Commits every file that still has a live handle.
    pub fn commit_open_files(&self) -> Result<()> {
        let handles: Vec<VFileHandle> = self
            .files
            .lock()
            .values()
            .filter_map(|entry| entry.instance.upgrade())
            .collect();
        for handle in handles {
            handle.commit()?;
        }
        Ok(())
    }

    /// Called by a virtual file after its tree committed; records the new
    /// root and commits the directory.
    pub(crate) fn on_vfile_commit(
        &self,
        id: FileId,
        updated_root: RootSectorInfo,
    ) -> Result<()> {
        {
            let mut files = self.files.lock();
            let entry = files.get_mut(&id).ok_or_else(|| {
                Error::new(ErrorKind::NoSuchVFile).with_file_id(id)
            })?;
            entry.tree_info = updated_root;
            entry.needs_index_update = true;
        }
        self.write_flag.store(true, Ordering::Release);
        self.commit()
    }

    /// Writes every dirty entry into its block run, commits the directory
    /// tree and rotates the archive header.
    pub fn commit(&self) -> Result<()> {
        if !self.write_flag.load(Ordering::Acquire) {
            return Ok(());
        }
        let _commit_guard = self.commit_sync.lock();
        if !self.write_flag.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut last_allocated = lut::sector_position_of(
            self.committed_root().maximum_extent - 1,
        );

        let snapshot: Vec<(String, FileId)> = self
            .index
            .read()
            .iter()
            .map(|(path, id)| (path.clone(), *id))
            .collect();

        for (path, id) in snapshot {
            let mut files = self.files.lock();
            let Some(entry) = files.get_mut(&id) else {
                continue;
            };
            if !entry.needs_index_update {
                continue;
            }

            let (secret, secret_counter) = entry.crypto_ctx.state();
            let descriptor = FileDescriptor {
                file_id: id,
                file_path: path.clone(),
                secret,
                secret_counter,
                tree_info: entry.tree_info,
                modification_time: None,
            };
            let body = descriptor.encode()?;
            let mut framed = bstr_head(body.len());
            framed.extend_from_slice(&body);

            let needed = (framed.len() as u64).div_ceil(BLOCK_SIZE);
            self.reallocate_entry_blocks(entry, needed, &mut last_allocated)
                .with_file_path(&path)?;
            let position = entry
                .index_file_position
                .expect("reallocation assigned a run");
            self.write_entry_bytes(position, &framed)
                .with_file_path(&path)?;
            entry.needs_index_update = false;
        }

        let maximum_extent =
            (last_allocated + 1) * SECTOR_PAYLOAD_SIZE as u64;
        self.index_tree.set_maximum_extent(maximum_extent);
        self.index_tree.commit(|root| {
            self.device
                .update_header(
                    &self.crypto_ctx,
                    root,
                    self.allocator.crypto_ctx(),
                    RootSectorInfo::default(),
                )
                .with_file_path("[archive-header]")?;
            *self.committed_root.lock() = root;
            self.write_flag.store(false, Ordering::Release);
            Ok(())
        })
    }

    /// Rebuilds the free pool as the complement of every reachable sector.
    /// The directory must be committed when this runs.
    pub fn recover_unused_sectors(&self) -> Result<()> {
        let num_sectors = self.device.size();
        let mut raw = vec![0u8; num_sectors.div_ceil(8) as usize];
        let mut reachable = BitsetMut::new(&mut raw);
        reachable.set(0);

        {
            let mut index_tree = InspectionTree::open_existing(
                Arc::clone(&self.device),
                Arc::clone(&self.crypto_ctx),
                self.committed_root(),
                ArchiveTreeAllocator::new(Arc::clone(&self.allocator)),
            )
            .with_file_path("[archive-index]")?;
            index_tree.extract_alloc_map(&mut reachable)?;
        }

        {
            let files = self.files.lock();
            for (id, entry) in files.iter() {
                if entry.tree_info.root.is_unallocated() {
                    continue;
                }
                let mut tree = InspectionTree::open_existing(
                    Arc::clone(&self.device),
                    Arc::clone(&entry.crypto_ctx),
                    entry.tree_info,
                    ArchiveTreeAllocator::new(Arc::clone(&self.allocator)),
                )
                .with_file_id(*id)?;
                tree.extract_alloc_map(&mut reachable).with_file_id(*id)?;
            }
        }

        self.allocator.initialize_new()?;
        let mut recovered = 0u64;
        for sector in 1..num_sectors {
            if !reachable.get(sector as usize) {
                self.allocator
                    .dealloc_one(vefs_storage::id::SectorId::new(sector))?;
                recovered += 1;
            }
        }
        self.allocator.trim_trailing()?;
        info!("recovered {recovered} unreachable sectors");
        Ok(())
    }

    /// Walks every file sequentially and surfaces the first corruption.
    pub fn validate(&self) -> Result<()> {
        let files = self.files.lock();
        for (id, entry) in files.iter() {
            if entry.tree_info.root.is_unallocated() {
                continue;
            }
            let mut tree = InspectionTree::open_existing(
                Arc::clone(&self.device),
                Arc::clone(&entry.crypto_ctx),
                entry.tree_info,
                ArchiveTreeAllocator::new(Arc::clone(&self.allocator)),
            )
            .with_file_id(*id)?;

            let leaves = entry
                .tree_info
                .maximum_extent
                .div_ceil(SECTOR_PAYLOAD_SIZE as u64);
            for _ in 1..leaves {
                tree.move_forward(AccessMode::Read).with_file_id(*id)?;
            }
        }
        Ok(())
    }

    /// Forces a traversal of every file, replacing damaged sectors with
    /// zeroed ones, then commits the updated roots.
    pub fn replace_corrupted_sectors(&self) -> Result<()> {
        {
            let mut files = self.files.lock();
            for (id, entry) in files.iter_mut() {
                if entry.tree_info.root.is_unallocated() {
                    continue;
                }
                let mut tree = InspectionTree::open_lazy(
                    Arc::clone(&self.device),
                    Arc::clone(&entry.crypto_ctx),
                    entry.tree_info,
                    ArchiveTreeAllocator::new(Arc::clone(&self.allocator)),
                )?;

                tree.move_to(0, AccessMode::Force).with_file_id(*id)?;
                let leaves = entry
                    .tree_info
                    .maximum_extent
                    .div_ceil(SECTOR_PAYLOAD_SIZE as u64);
                for _ in 1..leaves {
                    tree.move_forward(AccessMode::Force).with_file_id(*id)?;
                }

                let healed = tree.commit().with_file_id(*id)?;
                if healed.root != entry.tree_info.root {
                    warn!("replaced corrupted sectors in {id}");
                    let mut tree_info = healed;
                    tree_info.maximum_extent =
                        entry.tree_info.maximum_extent;
                    entry.tree_info = tree_info;
                    entry.needs_index_update = true;
                    self.write_flag.store(true, Ordering::Release);
                }
            }
        }
        self.commit()
    }

    /// Copies the file at `source_path` into a host file beneath
    /// `target_base`, preserving relative directories.
    pub fn extract(
        &self,
        source_path: &str,
        target_base: &Path,
    ) -> Result<()> {
        let handle = self.open(source_path, OpenMode::READ)?;

        let relative: std::path::PathBuf = Path::new(source_path)
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .collect();
        let target = target_base.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&target)?;
        handle.extract(&mut out)?;
        Ok(())
    }

    pub fn extract_all(&self, target_base: &Path) -> Result<()> {
        for path in self.list_files() {
            self.extract(&path, target_base)?;
        }
        Ok(())
    }
}

/// Scrubs and releases every sector of an erased file.
fn erase_file_sectors(
    device: &Arc<SectorDevice>,
    allocator: &Arc<ArchiveSectorAllocator>,
    crypto_ctx: Arc<FileCryptoCtx>,
    tree_info: RootSectorInfo,
) -> Result<()> {
    let num_sectors = device.size();
    let mut raw = vec![0u8; num_sectors.div_ceil(8) as usize];
    let mut owned = BitsetMut::new(&mut raw);

    let mut tree = SectorTreeSeq::open_existing(
        Arc::clone(device),
        crypto_ctx,
        tree_info,
        ArchiveTreeAllocator::new(Arc::clone(allocator)),
    )?;
    tree.extract_alloc_map(&mut owned)?;
    drop(tree);

    for sector in 1..num_sectors {
        if owned.get(sector as usize) {
            let id = vefs_storage::id::SectorId::new(sector);
            device.erase_sector(id)?;
            allocator.dealloc_one(id)?;
        }
    }
    Ok(())
}
