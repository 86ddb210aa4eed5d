//! Single-threaded cursor over a sector tree.
//!
//! Holds only the current root-to-leaf path in memory, which makes it the
//! right tool for bulk scans: sector recovery, validation, corruption
//! purging and the free-sector index itself (which must not depend on the
//! cache). Dirty nodes are written back when the cursor moves off them and
//! at commit.

use std::sync::Arc;

use crate::alloc::{NodeAllocation, TreeAllocator};
use crate::constants::SECTOR_PAYLOAD_SIZE;
use crate::crypto::FileCryptoCtx;
use crate::device::SectorDevice;
use crate::error::{ErrorKind, Result, ResultExt};
use crate::id::SectorId;
use crate::tree::layout::{
    read_reference, write_reference, RootSectorInfo, SectorReference,
};
use crate::tree::lut;
use crate::tree::walker::{TreePath, TreePosition};
use crate::util::BitsetMut;

/// How a cursor movement treats missing or damaged sectors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    /// Unallocated references fail with `sector_reference_out_of_range`.
    Read,
    /// Unallocated references materialize zeroed sectors.
    Create,
    /// Like `Create`, and sectors that fail authentication are replaced
    /// with zeroed sectors in place.
    Force,
}

type NodeContent = Box<[u8; SECTOR_PAYLOAD_SIZE]>;

fn zeroed_content() -> NodeContent {
    vec![0u8; SECTOR_PAYLOAD_SIZE]
        .into_boxed_slice()
        .try_into()
        .expect("payload buffer has the payload size")
}

struct Node {
    allocation: NodeAllocation,
    dirty: bool,
    content: NodeContent,
}

impl Node {
    fn fresh() -> Self {
        Node {
            allocation: NodeAllocation::new(SectorId::MASTER),
            dirty: true,
            content: zeroed_content(),
        }
    }
}

/// See the module docs.
pub struct SectorTreeSeq<A: TreeAllocator> {
    device: Arc<SectorDevice>,
    crypto: Arc<FileCryptoCtx>,
    root_info: RootSectorInfo,
    allocator: A,
    // nodes[0] is the root, nodes[depth] the leaf of the current path
    nodes: Vec<Node>,
    path: TreePath,
    path_valid: bool,
}

impl<A: TreeAllocator> SectorTreeSeq<A> {
    fn construct(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        root_info: RootSectorInfo,
        allocator: A,
    ) -> Self {
        SectorTreeSeq {
            device,
            crypto,
            path: TreePath::with_depth(
                root_info.tree_depth,
                TreePosition::data(0),
            ),
            root_info,
            allocator,
            nodes: Vec::new(),
            path_valid: false,
        }
    }

    /// Opens the tree and positions the cursor on leaf 0.
    pub fn open_existing(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        root_info: RootSectorInfo,
        allocator: A,
    ) -> Result<Self> {
        let mut tree = Self::construct(device, crypto, root_info, allocator);
        tree.move_to(0, AccessMode::Read)?;
        Ok(tree)
    }

    /// Opens the tree without touching any sector yet; the first `move_to`
    /// performs the initial descent (and may run in force mode).
    pub fn open_lazy(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        root_info: RootSectorInfo,
        allocator: A,
    ) -> Result<Self> {
        Ok(Self::construct(device, crypto, root_info, allocator))
    }

    /// Creates a tree consisting of a single zeroed data sector.
    pub fn create_new(
        device: Arc<SectorDevice>,
        crypto: Arc<FileCryptoCtx>,
        allocator: A,
    ) -> Result<Self> {
        let mut tree = Self::construct(
            device,
            crypto,
            RootSectorInfo::default(),
            allocator,
        );
        tree.nodes.push(Node::fresh());
        tree.path_valid = true;
        Ok(tree)
    }

    pub fn root_info(&self) -> RootSectorInfo {
        self.root_info
    }

    fn is_loaded(&self) -> bool {
        self.nodes.len() == self.root_info.tree_depth + 1
    }

    /// Payload of the current data sector.
    pub fn bytes(&self) -> &[u8] {
        debug_assert!(self.is_loaded());
        &self.nodes.last().expect("cursor is positioned").content[..]
    }

    /// Mutable payload of the current data sector; marks it dirty.
    pub fn writable_bytes(&mut self) -> &mut [u8] {
        debug_assert!(self.is_loaded());
        let node = self.nodes.last_mut().expect("cursor is positioned");
        node.dirty = true;
        &mut node.content[..]
    }

    pub fn current_leaf(&self) -> u64 {
        self.path.position(0)
    }

    pub fn move_forward(&mut self, mode: AccessMode) -> Result<()> {
        self.move_to(self.current_leaf() + 1, mode)
    }

    pub fn move_backward(&mut self, mode: AccessMode) -> Result<()> {
        if self.current_leaf() == 0 {
            return Err(ErrorKind::NoMoreData.into());
        }
        self.move_to(self.current_leaf() - 1, mode)
    }

    /// Repositions the cursor onto `leaf`, writing back and dropping the
    /// no-longer-shared tail of the old path and descending into the new
    /// one.
    pub fn move_to(&mut self, leaf: u64, mode: AccessMode) -> Result<()> {
        let required = lut::required_tree_depth(leaf);
        if required > self.root_info.tree_depth {
            if mode == AccessMode::Read {
                return Err(ErrorKind::SectorReferenceOutOfRange)
                    .with_position(TreePosition::data(leaf));
            }
            self.grow(required)?;
        }

        let depth = self.root_info.tree_depth;
        let target = TreePath::with_depth(depth, TreePosition::data(leaf));

        self.ensure_root(mode)?;

        // keep the shared prefix of the two paths
        let mut keep = 1;
        if self.path_valid {
            for index in 1..self.nodes.len() {
                let layer = depth - index;
                if self.path.position(layer) == target.position(layer) {
                    keep = index + 1;
                } else {
                    break;
                }
            }
        }
        self.sync_down_to(keep)?;
        self.path = target;
        self.path_valid = true;

        while self.nodes.len() <= depth {
            let index = self.nodes.len();
            let layer = depth - index;
            self.load_next(layer, mode)?;
        }
        Ok(())
    }

    /// Flushes the whole path and returns the updated root record.
    pub fn commit(&mut self) -> Result<RootSectorInfo> {
        for index in (0..self.nodes.len()).rev() {
            self.sync_node(index)?;
        }
        self.allocator.on_commit()?;
        Ok(self.root_info)
    }

    /// Marks every physical sector reachable through this tree in `bits`,
    /// traversing all data sectors covered by the recorded extent.
    pub fn extract_alloc_map(&mut self, bits: &mut BitsetMut<'_>) -> Result<()> {
        let leaves = self
            .root_info
            .maximum_extent
            .div_ceil(SECTOR_PAYLOAD_SIZE as u64)
            .max(1);
        for leaf in 0..leaves {
            self.move_to(leaf, AccessMode::Read)?;
            for node in &self.nodes {
                let id = node.allocation.current().get();
                if id != 0 && (id as usize) < bits.len() {
                    bits.set(id as usize);
                }
            }
        }
        Ok(())
    }

    fn ensure_root(&mut self, mode: AccessMode) -> Result<()> {
        if !self.nodes.is_empty() {
            return Ok(());
        }
        let root = self.root_info.root;
        if root.is_unallocated() {
            if mode == AccessMode::Read {
                return Err(ErrorKind::SectorReferenceOutOfRange.into());
            }
            self.nodes.push(Node::fresh());
            return Ok(());
        }

        let mut content = zeroed_content();
        match self.device.read_sector(
            &mut content[..],
            &self.crypto,
            root.sector,
            &root.mac,
        ) {
            Ok(()) => self.nodes.push(Node {
                allocation: NodeAllocation::new(root.sector),
                dirty: false,
                content,
            }),
            Err(err)
                if mode == AccessMode::Force
                    && err.kind() == ErrorKind::TagMismatch =>
            {
                // rewrite the damaged sector in place with zeroes
                let mut node = Node::fresh();
                node.allocation = NodeAllocation::new(root.sector);
                self.nodes.push(node);
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn load_next(&mut self, layer: usize, mode: AccessMode) -> Result<()> {
        let offset = self.path.offset(layer);
        let parent = self.nodes.last().expect("parent is loaded");
        let reference = read_reference(&parent.content[..], offset);

        if reference.is_unallocated() {
            if mode == AccessMode::Read {
                return Err(ErrorKind::SectorReferenceOutOfRange)
                    .with_position(self.path.layer_position(layer));
            }
            self.nodes.push(Node::fresh());
            return Ok(());
        }

        let mut content = zeroed_content();
        match self.device.read_sector(
            &mut content[..],
            &self.crypto,
            reference.sector,
            &reference.mac,
        ) {
            Ok(()) => self.nodes.push(Node {
                allocation: NodeAllocation::new(reference.sector),
                dirty: false,
                content,
            }),
            Err(err)
                if mode == AccessMode::Force
                    && err.kind() == ErrorKind::TagMismatch =>
            {
                let mut node = Node::fresh();
                node.allocation = NodeAllocation::new(reference.sector);
                self.nodes.push(node);
            }
            Err(err) => {
                return Err(err
                    .with_position(self.path.layer_position(layer)))
            }
        }
        Ok(())
    }

    /// Writes back and pops nodes until only `keep` remain.
    fn sync_down_to(&mut self, keep: usize) -> Result<()> {
        while self.nodes.len() > keep {
            self.sync_node(self.nodes.len() - 1)?;
            self.nodes.pop();
        }
        Ok(())
    }

    fn sync_node(&mut self, index: usize) -> Result<()> {
        if !self.nodes[index].dirty {
            return Ok(());
        }
        let depth = self.root_info.tree_depth;
        let layer = depth - index;

        let (upper, lower) = self.nodes.split_at_mut(index);
        let node = &mut lower[0];

        let sector = self.allocator.reallocate(&mut node.allocation)?;
        let mut updated = SectorReference {
            sector,
            mac: [0; 16],
        };
        self.device
            .write_sector(
                &mut updated.mac,
                &self.crypto,
                sector,
                &node.content[..],
            )
            .with_position(self.path.layer_position(layer))?;
        node.dirty = false;

        match upper.last_mut() {
            None => self.root_info.root = updated,
            Some(parent) => {
                write_reference(
                    &mut parent.content[..],
                    self.path.offset(layer),
                    updated,
                );
                parent.dirty = true;
            }
        }
        Ok(())
    }

    /// Adds reference layers above the current root until the tree is
    /// `target` layers deep. Newly created roots adopt the previous root
    /// at offset zero.
    fn grow(&mut self, target: usize) -> Result<()> {
        while self.root_info.tree_depth < target {
            self.sync_down_to(0)?;

            let mut node = Node::fresh();
            write_reference(&mut node.content[..], 0, self.root_info.root);
            self.nodes.push(node);
            self.root_info.tree_depth += 1;
            self.path = TreePath::with_depth(
                self.root_info.tree_depth,
                TreePosition::data(self.path.position(0)),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{ArchiveSectorAllocator, ArchiveTreeAllocator};
    use crate::crypto::OnlyMacProvider;
    use crate::device::ArchiveOpening;

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

    fn direct(fx: &Fixture) -> ArchiveTreeAllocator {
        ArchiveTreeAllocator::new(Arc::clone(&fx.allocator))
    }

    #[test]
    fn multi_sector_payloads_survive_commit_and_reopen() {
        let fx = fixture();
        let root = {
            let mut tree = SectorTreeSeq::create_new(
                Arc::clone(&fx.device),
                Arc::clone(&fx.crypto),
                direct(&fx),
            )
            .unwrap();
            for leaf in 0..3u64 {
                tree.move_to(leaf, AccessMode::Create).unwrap();
                tree.writable_bytes()[0] = leaf as u8 + 1;
            }
            let mut root = tree.commit().unwrap();
            root.maximum_extent = 3 * SECTOR_PAYLOAD_SIZE as u64;
            root
        };
        assert_eq!(root.tree_depth, 1);

        let mut tree = SectorTreeSeq::open_existing(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            root,
            direct(&fx),
        )
        .unwrap();
        for leaf in 0..3u64 {
            tree.move_to(leaf, AccessMode::Read).unwrap();
            assert_eq!(tree.bytes()[0], leaf as u8 + 1);
        }
    }

    #[test]
    fn reads_past_the_tree_fail() {
        let fx = fixture();
        let mut tree = SectorTreeSeq::create_new(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            direct(&fx),
        )
        .unwrap();
        let err = tree.move_to(1, AccessMode::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SectorReferenceOutOfRange);
    }

    #[test]
    fn alloc_map_covers_every_reachable_sector() {
        let fx = fixture();
        let root = {
            let mut tree = SectorTreeSeq::create_new(
                Arc::clone(&fx.device),
                Arc::clone(&fx.crypto),
                direct(&fx),
            )
            .unwrap();
            for leaf in 0..2u64 {
                tree.move_to(leaf, AccessMode::Create).unwrap();
                tree.writable_bytes()[0] = 0xab;
            }
            let mut root = tree.commit().unwrap();
            root.maximum_extent = 2 * SECTOR_PAYLOAD_SIZE as u64;
            root
        };

        let mut tree = SectorTreeSeq::open_existing(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            root,
            direct(&fx),
        )
        .unwrap();
        let mut raw = vec![0u8; fx.device.size().div_ceil(8) as usize];
        let mut bits = BitsetMut::new(&mut raw);
        tree.extract_alloc_map(&mut bits).unwrap();

        // two data sectors plus the root reference sector
        let marked = (0..fx.device.size() as usize)
            .filter(|&i| bits.get(i))
            .count();
        assert_eq!(marked, 3);
        assert!(bits.get(root.root.sector.get() as usize));
    }

    #[test]
    fn force_mode_replaces_damaged_sectors_with_zeroes() {
        let fx = fixture();
        let root = {
            let mut tree = SectorTreeSeq::create_new(
                Arc::clone(&fx.device),
                Arc::clone(&fx.crypto),
                direct(&fx),
            )
            .unwrap();
            tree.writable_bytes()[..4].copy_from_slice(b"data");
            tree.commit().unwrap()
        };

        // destroy the sector's key material behind the tree's back
        fx.device.erase_sector(root.root.sector).unwrap();

        let mut tree = SectorTreeSeq::open_lazy(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            root,
            direct(&fx),
        )
        .unwrap();
        assert!(tree.move_to(0, AccessMode::Read).is_err());

        tree.move_to(0, AccessMode::Force).unwrap();
        assert!(tree.bytes().iter().all(|&byte| byte == 0));
        let healed = tree.commit().unwrap();
        assert!(!healed.root.is_unallocated());

        let mut reread = SectorTreeSeq::open_existing(
            Arc::clone(&fx.device),
            Arc::clone(&fx.crypto),
            healed,
            direct(&fx),
        )
        .unwrap();
        reread.move_to(0, AccessMode::Read).unwrap();
        assert!(reread.bytes().iter().all(|&byte| byte == 0));
    }
}
