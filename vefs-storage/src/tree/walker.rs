//! Logical addressing within a sector tree.

use std::fmt;

use crate::tree::lut::{MAX_TREE_DEPTH, REFS_PER_SECTOR, REF_WIDTH};

/// A `(layer, position)` pair identifying one sector of a file's tree.
///
/// Layer 0 holds data sectors; higher layers hold reference sectors. The
/// pair is packed into a single word, eight bits of layer over 56 bits of
/// position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreePosition(u64);

const LAYER_OFFSET: u32 = 56;
const POSITION_MASK: u64 = (1 << LAYER_OFFSET) - 1;

impl TreePosition {
    #[inline]
    pub const fn new(position: u64, layer: usize) -> Self {
        TreePosition(((layer as u64) << LAYER_OFFSET) | (position & POSITION_MASK))
    }

    #[inline]
    pub const fn data(position: u64) -> Self {
        TreePosition::new(position, 0)
    }

    #[inline]
    pub const fn layer(self) -> usize {
        (self.0 >> LAYER_OFFSET) as usize
    }

    #[inline]
    pub const fn position(self) -> u64 {
        self.0 & POSITION_MASK
    }

    /// The reference sector containing this sector's reference.
    #[inline]
    pub const fn parent(self) -> TreePosition {
        TreePosition::new(self.position() / REFS_PER_SECTOR, self.layer() + 1)
    }

    /// Index of this sector's reference within its parent.
    #[inline]
    pub const fn parent_array_offset(self) -> usize {
        (self.position() % REFS_PER_SECTOR) as usize
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> TreePosition {
        TreePosition::new(self.position() + 1, self.layer())
    }

    #[inline]
    #[must_use]
    pub const fn prev(self) -> TreePosition {
        TreePosition::new(self.position() - 1, self.layer())
    }
}

impl fmt::Debug for TreePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(L{}, P{:#04x})", self.layer(), self.position())
    }
}

#[derive(Clone, Copy, Default)]
struct Waypoint {
    absolute: u64,
    offset: usize,
}

/// The root-to-target walk for one tree position: for every layer the
/// absolute sector position on that layer and the reference offset within
/// its parent.
#[derive(Clone)]
pub struct TreePath {
    waypoints: [Waypoint; MAX_TREE_DEPTH + 2],
    tree_depth: usize,
    target_layer: usize,
}

impl TreePath {
    /// Path from the virtual top layer down to `target`.
    pub fn new(target: TreePosition) -> Self {
        TreePath::with_depth(MAX_TREE_DEPTH + 1, target)
    }

    /// Path from layer `tree_depth` down to `target`.
    pub fn with_depth(tree_depth: usize, target: TreePosition) -> Self {
        debug_assert!(tree_depth <= MAX_TREE_DEPTH + 1);
        debug_assert!(target.layer() <= tree_depth);

        let target_layer = target.layer();
        let position = target.position();
        let mut waypoints = [Waypoint::default(); MAX_TREE_DEPTH + 2];
        for layer in target_layer..tree_depth {
            let absolute = position / REF_WIDTH[layer - target_layer];
            waypoints[layer] = Waypoint {
                absolute,
                offset: (absolute % REFS_PER_SECTOR) as usize,
            };
        }
        // the top of the walk is always the leftmost sector of its layer
        waypoints[tree_depth] = Waypoint::default();

        TreePath {
            waypoints,
            tree_depth,
            target_layer,
        }
    }

    pub fn tree_depth(&self) -> usize {
        self.tree_depth
    }

    pub fn target_layer(&self) -> usize {
        self.target_layer
    }

    /// Absolute sector position of the walk at `layer`.
    pub fn position(&self, layer: usize) -> u64 {
        self.waypoints[layer].absolute
    }

    /// Reference offset within the parent at `layer`.
    pub fn offset(&self, layer: usize) -> usize {
        self.waypoints[layer].offset
    }

    pub fn layer_position(&self, layer: usize) -> TreePosition {
        TreePosition::new(self.waypoints[layer].absolute, layer)
    }

    /// The smallest tree depth whose leftmost spine covers this path.
    pub fn required_depth(&self) -> usize {
        let mut layer = 0;
        while self.waypoints[layer].absolute != 0 {
            layer += 1;
        }
        layer
    }

    #[must_use]
    pub fn next(&self) -> TreePath {
        TreePath::with_depth(
            self.tree_depth,
            TreePosition::new(
                self.position(self.target_layer) + 1,
                self.target_layer,
            ),
        )
    }

    #[must_use]
    pub fn previous(&self) -> TreePath {
        TreePath::with_depth(
            self.tree_depth,
            TreePosition::new(
                self.position(self.target_layer) - 1,
                self.target_layer,
            ),
        )
    }
}

impl fmt::Debug for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for layer in (self.target_layer..=self.tree_depth).rev() {
            list.entry(&self.layer_position(layer));
        }
        list.finish()
    }
}
