//! The copy-on-write sector tree used by virtual files and the directory.
//!
//! Every cached sector carries a pinning handle to its parent, so the chain
//! of spine sectors (the anchors at positions `(0, 1)` … `(0, depth)`) stays
//! resident for the whole tree lifetime and bounds the bottom-up write order
//! during commit. Writes never overwrite a live sector: the tree allocator
//! assigns a fresh physical id per commit epoch and releases the superseded
//! one after the commit callback ran.

use std::io::Write;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::alloc::{NodeAllocation, TreeAllocator};
use crate::cache::{CacheHandle, CacheMt, CacheTraits, LeastRecentlyUsedPolicy};
use crate::constants::SECTOR_PAYLOAD_SIZE;
use crate::crypto::FileCryptoCtx;
use crate::device::SectorDevice;
use crate::error::{ErrorKind, Result, ResultExt};
use crate::id::SectorId;
use crate::tree::layout::{
    count_referenced, read_reference, write_reference, RootSectorInfo,
    SectorReference,
};
use crate::tree::lut::MAX_TREE_DEPTH;
use crate::tree::walker::{TreePath, TreePosition};

/// Cached pages per tree.
const SECTOR_CACHE_CAPACITY: usize = 1024;

type SectorContent = Box<[u8; SECTOR_PAYLOAD_SIZE]>;

fn zeroed_content() -> SectorContent {
    vec![0u8; SECTOR_PAYLOAD_SIZE]
        .into_boxed_slice()
        .try_into()
        .expect("payload buffer has the payload size")
}

/// One cached sector: payload bytes behind their own reader-writer lock,
/// the pinned parent handle, and the copy-on-write allocation state.
pub struct Sector<A: TreeAllocator + 'static> {
    parent: Mutex<Option<SectorHandle<A>>>,
    allocation: Mutex<NodeAllocation>,
    content: RwLock<SectorContent>,
}

impl<A: TreeAllocator + 'static> Sector<A> {
    fn new(
        parent: Option<SectorHandle<A>>,
        current: SectorId,
        content: SectorContent,
    ) -> Self {
        Sector {
            parent: Mutex::new(parent),
            allocation: Mutex::new(NodeAllocation::new(current)),
            content: RwLock::new(content),
        }
    }

    fn parent(&self) -> Option<SectorHandle<A>> {
        self.parent.lock().clone()
    }
}

type SectorHandle<A> =
    CacheHandle<SectorTraits<A>, LeastRecentlyUsedPolicy>;
type SectorCache<A> = CacheMt<SectorTraits<A>, LeastRecentlyUsedPolicy>;

/// Context for loading a sector that is missing from the cache.
pub struct LoadContext<A: TreeAllocator + 'static> {
    parent: Option<SectorHandle<A>>,
    ref_offset: usize,
    create: bool,
}

/// Context for purging a sector from the cache.
pub struct PurgeContext {
    ref_offset: usize,
}

/// Cache callbacks binding sectors to the device, the file's crypto context
/// and the tree allocator.
pub struct SectorTraits<A: TreeAllocator + 'static> {
    device: Arc<SectorDevice>,
    crypto: Arc<FileCryptoCtx>,
    root_info: Arc<Mutex<RootSectorInfo>>,
    allocator: Arc<A>,
}

impl<A: TreeAllocator + 'static> SectorTraits<A> {
    fn load_root(&self, create: bool) -> Result<(Sector<A>, bool)> {
        let root = self.root_info.lock().root;
        if create {
            let mut content = zeroed_content();
            // a synthetic root references the previous root at offset zero
            write_reference(&mut content[..], 0, root);
            Ok((Sector::new(None, SectorId::MASTER, content), true))
        } else {
            let mut content = zeroed_content();
            self.device.read_sector(
                &mut content[..],
                &self.crypto,
                root.sector,
                &root.mac,
            )?;
            Ok((Sector::new(None, root.sector, content), false))
        }
    }
}

impl<A: TreeAllocator + 'static> CacheTraits for SectorTraits<A> {
    type Key = TreePosition;
    type Value = Sector<A>;
    type LoadContext = LoadContext<A>;
    type PurgeContext = PurgeContext;

    fn load(
        &self,
        ctx: &mut LoadContext<A>,
        key: TreePosition,
    ) -> Result<(Sector<A>, bool)> {
        let Some(parent) = &ctx.parent else {
            return self.load_root(ctx.create);
        };

        let reference = {
            let parent_content = parent.content.read();
            read_reference(&parent_content[..], ctx.ref_offset)
        };

        if reference.is_unallocated() {
            if !ctx.create {
                return Err(ErrorKind::SectorReferenceOutOfRange)
                    .with_position(key);
            }
            let sector = Sector::new(
                ctx.parent.take(),
                SectorId::MASTER,
                zeroed_content(),
            );
            return Ok((sector, true));
        }

        let mut content = zeroed_content();
        self.device
            .read_sector(
                &mut content[..],
                &self.crypto,
                reference.sector,
                &reference.mac,
            )
            .with_position(key)?;
        let sector =
            Sector::new(ctx.parent.take(), reference.sector, content);
        Ok((sector, false))
    }

    fn sync(&self, key: TreePosition, sector: &Sector<A>) -> Result<()> {
        let content = sector.content.write();
        let parent = sector.parent();

        // spine sectors with at most one child (and interior reference
        // sectors with none) are pruned instead of written
        if key.layer() > 0 {
            let referenced = count_referenced(&content[..]);
            let prunable = if key.position() == 0 {
                referenced <= 1
            } else {
                referenced == 0
            };
            if prunable {
                match &parent {
                    None => {
                        self.root_info.lock().root = SectorReference::default();
                    }
                    Some(parent) => {
                        let mut parent_content = parent.content.write();
                        write_reference(
                            &mut parent_content[..],
                            key.parent_array_offset(),
                            SectorReference::default(),
                        );
                        parent.mark_dirty();
                    }
                }
                self.allocator.dealloc(&mut sector.allocation.lock());
                return Ok(());
            }
        }

        let new_id =
            self.allocator.reallocate(&mut sector.allocation.lock())?;
        let mut updated = SectorReference {
            sector: new_id,
            mac: [0; 16],
        };
        self.device
            .write_sector(&mut updated.mac, &self.crypto, new_id, &content[..])
            .with_position(key)?;

        match &parent {
            None => {
                self.root_info.lock().root = updated;
            }
            Some(parent) => {
                let mut parent_content = parent.content.write();
                write_reference(
                    &mut parent_content[..],
                    key.parent_array_offset(),
                    updated,
                );
                parent.mark_dirty();
            }
        }
        Ok(())
    }

    fn purge(
        &self,
        ctx: &PurgeContext,
        _key: TreePosition,
        sector: &Sector<A>,
    ) -> Result<()> {
        if let Some(parent) = sector.parent.lock().take() {
            let mut parent_content = parent.content.write();
            write_reference(
                &mut parent_content[..],
                ctx.ref_offset,
                SectorReference::default(),
            );
            parent.mark_dirty();
        }
        self.allocator.dealloc(&mut sector.allocation.lock());
        Ok(())
    }
}

/// A pinned sector exposed to tree consumers. Reading takes the sector's
/// lock shared; [`TreeReadHandle::content_mut`] promotes to an exclusive
/// borrow and marks the sector dirty without taking another pin.
pub struct TreeReadHandle<A: TreeAllocator + 'static>(SectorHandle<A>);

impl<A: TreeAllocator + 'static> std::fmt::Debug for TreeReadHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeReadHandle").finish_non_exhaustive()
    }
}

impl<A: TreeAllocator + 'static> TreeReadHandle<A> {
    pub fn node_position(&self) -> TreePosition {
        self.0.key()
    }

    pub fn content(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.0.content.read(), |content| {
            &content[..]
        })
    }

    pub fn content_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.0.mark_dirty();
        RwLockWriteGuard::map(self.0.content.write(), |content| {
            &mut content[..]
        })
    }
}

impl<A: TreeAllocator + 'static> Clone for TreeReadHandle<A> {
    fn clone(&self) -> Self {
        TreeReadHandle(self.0.clone())
    }
}

/// See the module docs.
pub struct SectorTreeMt<A: TreeAllocator + 'static> {
    root_info: Arc<Mutex<RootSectorInfo>>,
    allocator: Arc<A>,
    // the bottom anchor at (0, 1); must drop before the cache
    root_sector: Mutex<Option<SectorHandle<A>>>,
    cache: SectorCache<A>,
}

impl<A: TreeAllocator + 'static> SectorTreeMt<A> {
    fn construct(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        root_info: RootSectorInfo,
        allocator: A,
    ) -> Self {
        let root_info = Arc::new(Mutex::new(root_info));
        let allocator = Arc::new(allocator);
        let cache = CacheMt::new(
            SECTOR_CACHE_CAPACITY,
            SectorTraits {
                device,
                crypto,
                root_info: Arc::clone(&root_info),
                allocator: Arc::clone(&allocator),
            },
        );
        SectorTreeMt {
            root_info,
            allocator,
            root_sector: Mutex::new(None),
            cache,
        }
    }

    /// Opens a tree whose root is recorded in `root_info`, priming the
    /// anchor chain down to `(0, 1)`.
    pub fn open_existing(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        root_info: RootSectorInfo,
        allocator: A,
    ) -> Result<Self> {
        let tree = Self::construct(device, crypto, root_info, allocator);
        tree.initialize(false)?;
        Ok(tree)
    }

    /// Creates a tree over a single zero-filled data sector.
    pub fn create_new(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        allocator: A,
    ) -> Result<Self> {
        let tree = Self::construct(
            device,
            crypto,
            RootSectorInfo::default(),
            allocator,
        );
        tree.initialize(true)?;
        Ok(tree)
    }

    fn initialize(&self, create: bool) -> Result<()> {
        let depth = self.root_info.lock().tree_depth;
        let anchor = if depth == 0 {
            let mut ctx = LoadContext {
                parent: None,
                ref_offset: 0,
                create: true,
            };
            let anchor =
                self.cache.pin_or_load(&mut ctx, TreePosition::new(0, 1))?;
            let mut ctx = LoadContext {
                parent: Some(anchor.clone()),
                ref_offset: 0,
                create,
            };
            self.cache.pin_or_load(&mut ctx, TreePosition::new(0, 0))?;
            anchor
        } else {
            let mut ctx = LoadContext {
                parent: None,
                ref_offset: 0,
                create: false,
            };
            let mut anchor = self
                .cache
                .pin_or_load(&mut ctx, TreePosition::new(0, depth))?;
            for layer in (1..depth).rev() {
                let mut ctx = LoadContext {
                    parent: Some(anchor),
                    ref_offset: 0,
                    create: false,
                };
                anchor = self
                    .cache
                    .pin_or_load(&mut ctx, TreePosition::new(0, layer))?;
            }
            anchor
        };
        *self.root_sector.lock() = Some(anchor);
        Ok(())
    }

    pub fn root_info(&self) -> RootSectorInfo {
        *self.root_info.lock()
    }

    /// Pins the sector at `position`; fails with
    /// `sector_reference_out_of_range` if any reference along the path is
    /// unallocated.
    pub fn access(
        &self,
        position: TreePosition,
    ) -> Result<TreeReadHandle<A>> {
        let path = TreePath::new(position);
        self.walk(&path, false).map(TreeReadHandle)
    }

    /// Pins the sector at `position`, growing the tree and creating
    /// missing sectors on the way.
    pub fn access_or_create(
        &self,
        position: TreePosition,
    ) -> Result<TreeReadHandle<A>> {
        let path = TreePath::new(position);
        let mut node = self.walk(&path, true)?;
        if node.key() == position {
            return Ok(TreeReadHandle(node));
        }

        for layer in (path.target_layer()..node.key().layer()).rev() {
            let mut ctx = LoadContext {
                parent: Some(node),
                ref_offset: path.offset(layer),
                create: true,
            };
            node = self
                .cache
                .pin_or_load(&mut ctx, path.layer_position(layer))?;
        }
        Ok(TreeReadHandle(node))
    }

    /// Drops the data sector `leaf_id`, clearing its reference and handing
    /// its physical sector back to the allocator. Succeeds silently if the
    /// leaf was never allocated.
    pub fn erase_leaf(&self, leaf_id: u64) -> Result<()> {
        if leaf_id == 0 {
            return Err(ErrorKind::InvalidArgument.into());
        }

        let path = TreePath::new(TreePosition::data(leaf_id));
        let leaf = match self.walk(&path, false) {
            Ok(leaf) => leaf,
            Err(err)
                if err.kind() == ErrorKind::SectorReferenceOutOfRange =>
            {
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.cache.purge(
            &PurgeContext {
                ref_offset: path.offset(0),
            },
            leaf,
        )
    }

    /// Flushes every dirty sector bottom-up, shrinks the tree height to
    /// fit, reports the new root through `on_root_updated`, then lets the
    /// allocator release superseded sectors.
    pub fn commit(
        &self,
        on_root_updated: impl FnOnce(RootSectorInfo) -> Result<()>,
    ) -> Result<()> {
        let mut any_dirty = true;
        for _ in 0..=MAX_TREE_DEPTH {
            if !any_dirty {
                break;
            }
            any_dirty = self.cache.sync_all()?;
        }

        // the anchor chain, bottom (0,1) to top
        let mut anchors: Vec<SectorHandle<A>> = Vec::new();
        let mut cursor = self
            .root_sector
            .lock()
            .clone()
            .expect("tree is initialized");
        loop {
            let parent = cursor.parent();
            anchors.push(cursor);
            match parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        for anchor in &anchors {
            while anchor.is_dirty() {
                self.cache.sync(anchor)?;
            }
        }

        // the real root is the highest anchor still referencing more than
        // one child; below that the spine is a chain of singletons
        let mut actual_layer = None;
        for anchor in anchors.iter().rev() {
            let content = anchor.content.read();
            if count_referenced(&content[..]) > 1 {
                actual_layer = Some(anchor.key().layer());
                break;
            }
        }

        let mut committed = *self.root_info.lock();
        match actual_layer {
            None => {
                let content = anchors[0].content.read();
                committed.root = read_reference(&content[..], 0);
                committed.tree_depth = 0;
            }
            Some(layer) => {
                if let Some(parent) = anchors[layer - 1].parent() {
                    let content = parent.content.read();
                    committed.root = read_reference(&content[..], 0);
                } else {
                    committed.root = self.root_info.lock().root;
                }
                committed.tree_depth = layer;
            }
        }

        // shrink the cached spine down to the committed height
        let keep = committed.tree_depth.max(1);
        while anchors.len() > keep {
            let victim = anchors.pop().expect("len checked");
            *anchors
                .last()
                .expect("bottom anchor always remains")
                .parent
                .lock() = None;
            self.cache
                .purge(&PurgeContext { ref_offset: 0 }, victim)?;
        }

        {
            let mut root_info = self.root_info.lock();
            root_info.root = committed.root;
            root_info.tree_depth = committed.tree_depth;
            committed.maximum_extent = root_info.maximum_extent;
        }

        on_root_updated(committed)?;
        self.allocator.on_commit()
    }

    /// Records the logical extent for the next committed root.
    pub fn set_maximum_extent(&self, maximum_extent: u64) {
        self.root_info.lock().maximum_extent = maximum_extent;
    }

    /// Copies bytes starting at `read_pos` into `buffer`, walking data
    /// sectors left to right.
    pub fn read_bytes(
        &self,
        mut buffer: &mut [u8],
        read_pos: u64,
    ) -> Result<()> {
        let mut offset = (read_pos % SECTOR_PAYLOAD_SIZE as u64) as usize;
        let mut position =
            TreePosition::data(read_pos / SECTOR_PAYLOAD_SIZE as u64);

        while !buffer.is_empty() {
            let sector = self.access(position)?;
            position = position.next();

            let content = sector.content();
            let chunk = &content[std::mem::take(&mut offset)..];
            let chunked = chunk.len().min(buffer.len());
            buffer[..chunked].copy_from_slice(&chunk[..chunked]);
            buffer = &mut buffer[chunked..];
        }
        Ok(())
    }

    /// Copies `data` into the tree at `write_pos`, creating sectors as
    /// needed.
    pub fn write_bytes(&self, mut data: &[u8], write_pos: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut offset = (write_pos % SECTOR_PAYLOAD_SIZE as u64) as usize;
        let mut position =
            TreePosition::data(write_pos / SECTOR_PAYLOAD_SIZE as u64);

        while !data.is_empty() {
            let sector = self.access_or_create(position)?;
            position = position.next();

            let mut content = sector.content_mut();
            let chunk = &mut content[std::mem::take(&mut offset)..];
            let chunked = chunk.len().min(data.len());
            chunk[..chunked].copy_from_slice(&data[..chunked]);
            data = &data[chunked..];
        }
        Ok(())
    }

    /// Streams the byte range `[start, end)` into `out`.
    pub fn extract_range(
        &self,
        out: &mut impl Write,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let mut offset = (start % SECTOR_PAYLOAD_SIZE as u64) as usize;
        let mut position =
            TreePosition::data(start / SECTOR_PAYLOAD_SIZE as u64);
        let mut remaining = end.saturating_sub(start);

        while remaining > 0 {
            let sector = self.access(position)?;
            position = position.next();

            let content = sector.content();
            let chunk = &content[std::mem::take(&mut offset)..];
            let chunked = (chunk.len() as u64).min(remaining) as usize;
            out.write_all(&chunk[..chunked])?;
            remaining -= chunked as u64;
        }
        Ok(())
    }

    /// Finds the deepest cached sector on `path` and descends the rest of
    /// the way. With `return_parent_if_unallocated`, an unallocated
    /// reference yields the deepest reachable ancestor instead of failing,
    /// creating spine sectors above the current root as needed.
    fn walk(
        &self,
        path: &TreePath,
        return_parent_if_unallocated: bool,
    ) -> Result<SectorHandle<A>> {
        let mut cached = None;
        for layer in path.target_layer()..=path.tree_depth() {
            if let Some(handle) =
                self.cache.try_pin(path.layer_position(layer))
            {
                cached = Some((handle, layer));
                break;
            }
        }

        let Some((mut node, found_layer)) = cached else {
            // nothing on the path is cached, which can only happen for
            // positions outside the current tree span
            return if return_parent_if_unallocated {
                self.anchor_sector(path.tree_depth())
            } else {
                Err(ErrorKind::SectorReferenceOutOfRange)
                    .with_position(path.layer_position(path.target_layer()))
            };
        };

        for layer in (path.target_layer()..found_layer).rev() {
            let mut ctx = LoadContext {
                parent: Some(node),
                ref_offset: path.offset(layer),
                create: false,
            };
            match self
                .cache
                .pin_or_load(&mut ctx, path.layer_position(layer))
            {
                Ok(next) => node = next,
                Err(err)
                    if return_parent_if_unallocated
                        && err.kind()
                            == ErrorKind::SectorReferenceOutOfRange =>
                {
                    return Ok(ctx
                        .parent
                        .take()
                        .expect("failed loads keep the parent"));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(node)
    }

    /// Walks the anchor chain up to `top_layer`, creating fresh roots above
    /// the current top as needed (the tree grows eagerly here and shrinks
    /// back to its required height during commit).
    fn anchor_sector(&self, top_layer: usize) -> Result<SectorHandle<A>> {
        let mut anchor = self
            .cache
            .try_pin(TreePosition::new(0, 1))
            .expect("the bottom anchor is always resident");

        for layer in 1..top_layer {
            let parent = {
                let mut slot = anchor.parent.lock();
                match &*slot {
                    Some(parent) => parent.clone(),
                    None => {
                        let mut ctx = LoadContext {
                            parent: None,
                            ref_offset: 0,
                            create: true,
                        };
                        let new_root = self.cache.pin_or_load(
                            &mut ctx,
                            TreePosition::new(0, layer + 1),
                        )?;
                        *slot = Some(new_root.clone());
                        new_root
                    }
                }
            };
            anchor = parent;
        }
        Ok(anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{ArchiveSectorAllocator, CowTreeAllocator};
    use crate::crypto::OnlyMacProvider;
    use crate::device::ArchiveOpening;
    use crate::tree::lut::REFS_PER_SECTOR;

    struct Fixture {
        _dir: tempfile::TempDir,
        device: Arc<SectorDevice>,
        allocator: Arc<ArchiveSectorAllocator>,
        crypto: Arc<FileCryptoCtx>,
    }

    fn fixture() -> Fixture {
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
        } = SectorDevice::create_new(
            file,
            Box::new(OnlyMacProvider),
            &[0u8; 32],
        )
        .unwrap();
        let device = Arc::new(device);
        let allocator = Arc::new(ArchiveSectorAllocator::new(
            Arc::clone(&device),
            free_sector_index.crypto_ctx,
        ));
        let crypto = Arc::new(device.create_file_secrets().unwrap());
        Fixture {
            _dir: dir,
            device,
            allocator,
            crypto,
        }
    }

    fn new_tree(fx: &Fixture) -> SectorTreeMt<CowTreeAllocator> {
        SectorTreeMt::create_new(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            CowTreeAllocator::new(Arc::clone(&fx.allocator)),
        )
        .unwrap()
    }

    #[test]
    fn fresh_trees_hold_one_zeroed_leaf() {
        let fx = fixture();
        let tree = new_tree(&fx);
        let leaf = tree.access(TreePosition::data(0)).unwrap();
        assert!(leaf.content().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn data_written_before_commit_reads_back_after_reopen() {
        let fx = fixture();
        let committed = {
            let tree = new_tree(&fx);
            tree.write_bytes(b"hello sector tree", 5).unwrap();
            let mut committed = RootSectorInfo::default();
            tree.commit(|root| {
                committed = root;
                Ok(())
            })
            .unwrap();
            committed
        };
        assert_eq!(committed.tree_depth, 0);
        assert!(!committed.root.is_unallocated());

        let tree = SectorTreeMt::open_existing(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            committed,
            CowTreeAllocator::new(Arc::clone(&fx.allocator)),
        )
        .unwrap();
        let mut recovered = [0u8; 17];
        tree.read_bytes(&mut recovered, 5).unwrap();
        assert_eq!(&recovered, b"hello sector tree");
    }

    #[test]
    fn commits_are_copy_on_write() {
        let fx = fixture();
        let tree = new_tree(&fx);
        tree.write_bytes(b"first", 0).unwrap();
        let mut first_root = RootSectorInfo::default();
        tree.commit(|root| {
            first_root = root;
            Ok(())
        })
        .unwrap();

        tree.write_bytes(b"second", 0).unwrap();
        let mut second_root = RootSectorInfo::default();
        tree.commit(|root| {
            second_root = root;
            Ok(())
        })
        .unwrap();
        assert_ne!(first_root.root.sector, second_root.root.sector);
    }

    #[test]
    fn trees_grow_and_shrink_with_their_content() {
        let fx = fixture();
        let tree = new_tree(&fx);

        // a second data sector forces one reference layer
        tree.access_or_create(TreePosition::data(1)).unwrap();
        let mut committed = RootSectorInfo::default();
        tree.commit(|root| {
            committed = root;
            Ok(())
        })
        .unwrap();
        assert_eq!(committed.tree_depth, 1);

        // erasing it shrinks the tree back to a bare data sector
        tree.erase_leaf(1).unwrap();
        tree.commit(|root| {
            committed = root;
            Ok(())
        })
        .unwrap();
        assert_eq!(committed.tree_depth, 0);
    }

    #[test]
    fn access_beyond_the_tree_span_fails() {
        let fx = fixture();
        let tree = new_tree(&fx);
        let err = tree
            .access(TreePosition::data(REFS_PER_SECTOR + 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectorReferenceOutOfRange);
    }

    #[test]
    fn erasing_unallocated_leaves_is_a_no_op() {
        let fx = fixture();
        let tree = new_tree(&fx);
        tree.erase_leaf(17).unwrap();
    }

    #[test]
    fn dense_trees_reach_the_second_reference_layer() {
        let fx = fixture();
        let tree = new_tree(&fx);

        // files are dense: every leaf up to the extent exists, and leaf
        // `REFS_PER_SECTOR` is the first that needs a second layer
        for leaf in 1..=REFS_PER_SECTOR {
            tree.access_or_create(TreePosition::data(leaf)).unwrap();
        }
        tree.write_bytes(
            b"deep",
            REFS_PER_SECTOR * SECTOR_PAYLOAD_SIZE as u64,
        )
        .unwrap();

        let mut committed = RootSectorInfo::default();
        tree.commit(|root| {
            committed = root;
            Ok(())
        })
        .unwrap();
        assert_eq!(committed.tree_depth, 2);

        let mut recovered = [0u8; 4];
        tree.read_bytes(
            &mut recovered,
            REFS_PER_SECTOR * SECTOR_PAYLOAD_SIZE as u64,
        )
        .unwrap();
        assert_eq!(&recovered, b"deep");

        // a reopened tree sees the same bytes
        let tree = SectorTreeMt::open_existing(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            committed,
            CowTreeAllocator::new(Arc::clone(&fx.allocator)),
        )
        .unwrap();
        let mut recovered = [0u8; 4];
        tree.read_bytes(
            &mut recovered,
            REFS_PER_SECTOR * SECTOR_PAYLOAD_SIZE as u64,
        )
        .unwrap();
        assert_eq!(&recovered, b"deep");
    }
}
