use crate::{
    avl::AvlTree,
    error::IndexError,
    gate::Gate,
};
use arrayvec::ArrayVec;
use glam::Vec3;
use std::cmp::Ordering;
use tracing::{ debug, trace };

mod aabb;
pub use aabb::*;

/// Hard ceiling on entities per leaf; the runtime `branch_factor` (the split
/// threshold) is clamped into `1..=MAX_LEAF_SLOTS`.
pub const MAX_LEAF_SLOTS: usize = 16;

/// The capability an entity must expose to live in a [`SpatialIndex`]: a
/// mutable 3D position.
pub trait Position {
    fn position(&self) -> Vec3;
    fn set_position(&mut self, pos: Vec3);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(u32);

/// Maps a live entity slot to the leaf currently holding it, so removal and
/// relocation skip the full-tree search.
#[derive(Debug, Clone, Copy)]
struct RefRecord {
    slot: u32,
    leaf: NodeId,
}

#[derive(Debug)]
enum NodeKind {
    /// Entity slots, up to `branch_factor` of them.
    Leaf(ArrayVec<u32, MAX_LEAF_SLOTS>),
    /// One optional child per octant, indexed by the 3-bit octant code.
    Branch([Option<NodeId>; 8]),
}

#[derive(Debug)]
struct Node {
    center: Vec3,
    half_extent: f32,
    /// Non-owning back-reference, used only for upward walks during pluck.
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// 3-bit octant code: per axis, the bit is set when the coordinate lies at
/// or above the node center (x selects bit 0, y bit 1, z bit 2).
fn octant_code(center: Vec3, pos: Vec3) -> usize {
    usize::from(pos.x >= center.x)
        | usize::from(pos.y >= center.y) << 1
        | usize::from(pos.z >= center.z) << 2
}

/// A child cube's half-extent is half its parent's; its center is offset by
/// a quarter extent along each axis according to the octant code.
fn child_center(center: Vec3, half_extent: f32, code: usize) -> Vec3 {
    let offset = half_extent * 0.5;
    Vec3::new(
        center.x + if code & 1 != 0 { offset } else { -offset },
        center.y + if code & 2 != 0 { offset } else { -offset },
        center.z + if code & 4 != 0 { offset } else { -offset },
    )
}

/// Cube membership, half-open to stay consistent with the octant code: a
/// point exactly on a splitting plane belongs to the `>=` side.
fn cube_contains(center: Vec3, half_extent: f32, pos: Vec3) -> bool {
    let min = center - Vec3::splat(half_extent);
    let max = center + Vec3::splat(half_extent);
    pos.cmpge(min).all() && pos.cmplt(max).all()
}

fn slot_entity<T>(entities: &[Option<T>], slot: u32) -> &T {
    entities[slot as usize].as_ref().expect("stale entity slot")
}

struct Core<T> {
    nodes: Vec<Option<Node>>,
    free_nodes: Vec<u32>,
    entities: Vec<Option<T>>,
    free_slots: Vec<u32>,
    root: NodeId,
    branch_factor: usize,
    table: AvlTree<RefRecord>,
    cmp: Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
}

impl<T: Position> Core<T> {
    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize].as_ref().expect("stale node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize].as_mut().expect("stale node id")
    }

    fn node_bounds(&self, id: NodeId) -> AABB {
        let node = self.node(id);
        AABB {
            start: node.center - Vec3::splat(node.half_extent),
            end: node.center + Vec3::splat(node.half_extent),
        }
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.free_nodes.pop() {
            Some(at) => {
                self.nodes[at as usize] = Some(node);
                NodeId(at)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id.0 as usize] = None;
        self.free_nodes.push(id.0);
    }

    fn alloc_slot(&mut self, entity: T) -> u32 {
        match self.free_slots.pop() {
            Some(slot) => {
                self.entities[slot as usize] = Some(entity);
                slot
            }
            None => {
                self.entities.push(Some(entity));
                (self.entities.len() - 1) as u32
            }
        }
    }

    fn take_slot(&mut self, slot: u32) -> T {
        let entity = self.entities[slot as usize].take().expect("stale entity slot");
        self.free_slots.push(slot);
        entity
    }

    /// Creates an empty leaf under `parent` at `code` and links it in.
    fn alloc_leaf_child(&mut self, parent: NodeId, code: usize) -> NodeId {
        let (center, half_extent) = {
            let node = self.node(parent);
            (
                child_center(node.center, node.half_extent, code),
                node.half_extent * 0.5,
            )
        };
        let child = self.alloc_node(Node {
            center,
            half_extent,
            parent: Some(parent),
            kind: NodeKind::Leaf(ArrayVec::new()),
        });
        match &mut self.node_mut(parent).kind {
            NodeKind::Branch(children) => children[code] = Some(child),
            NodeKind::Leaf(_) => panic!("allocated a child under a leaf"),
        }
        child
    }

    /// Appends a slot to a leaf, raising [`IndexError::Capacity`] at the
    /// split threshold so the caller grows the tree.
    fn leaf_push(&mut self, id: NodeId, slot: u32) -> Result<(), IndexError> {
        let capacity = self.branch_factor;
        match &mut self.node_mut(id).kind {
            NodeKind::Leaf(slots) => {
                if slots.len() >= capacity {
                    return Err(IndexError::Capacity { capacity });
                }
                slots.push(slot);
                Ok(())
            }
            NodeKind::Branch(_) => panic!("pushed an entity slot into a branch"),
        }
    }

    fn contains_identity(&self, probe: &T) -> bool {
        let Core { table, entities, cmp, .. } = self;
        table.contains_with(probe, |rec, probe| cmp(slot_entity(entities, rec.slot), probe))
    }

    fn record_insert(&mut self, rec: RefRecord) {
        let Core { table, entities, cmp, .. } = self;
        let (entities, cmp) = (&*entities, &**cmp);
        table
            .insert_with(rec, |a, b| {
                cmp(slot_entity(entities, a.slot), slot_entity(entities, b.slot))
            })
            .expect("duplicate identity was ruled out before placement");
    }

    fn record_repoint(&mut self, slot: u32, leaf: NodeId) {
        let Core { table, entities, cmp, .. } = self;
        let (entities, cmp) = (&*entities, &**cmp);
        let rec = table
            .get_mut_with(&slot, |rec, key| {
                cmp(slot_entity(entities, rec.slot), slot_entity(entities, *key))
            })
            .expect("live slot without a reference record");
        rec.leaf = leaf;
    }

    /// Whether every entity in a leaf sits at exactly `pos`. A full leaf in
    /// that state cannot be separated by another split.
    fn leaf_all_at(&self, id: NodeId, pos: Vec3) -> bool {
        match &self.node(id).kind {
            NodeKind::Leaf(slots) => slots
                .iter()
                .all(|&slot| slot_entity(&self.entities, slot).position() == pos),
            NodeKind::Branch(_) => false,
        }
    }

    /// Promotes a leaf to a branch over the same cube and redistributes its
    /// entities into child leaves by octant code, repointing their records.
    /// The root grows the same way, one level deeper in place.
    fn promote(&mut self, id: NodeId) {
        let slots = match &mut self.node_mut(id).kind {
            NodeKind::Leaf(slots) => std::mem::take(slots),
            NodeKind::Branch(_) => return,
        };
        self.node_mut(id).kind = NodeKind::Branch([None; 8]);
        debug!(node = id.0, population = slots.len(), "leaf promoted to branch");

        for slot in slots {
            let pos = slot_entity(&self.entities, slot).position();
            let code = octant_code(self.node(id).center, pos);
            let existing = match &self.node(id).kind {
                NodeKind::Branch(children) => children[code],
                NodeKind::Leaf(_) => unreachable!("node reverted during promotion"),
            };
            let child = match existing {
                Some(child) => child,
                None => self.alloc_leaf_child(id, code),
            };
            self.leaf_push(child, slot)
                .expect("redistribution cannot overflow a fresh leaf");
            self.record_repoint(slot, child);
        }
    }

    /// Places a co-located overflow entity into a sibling octant with spare
    /// room, or into a freshly created empty octant. Returns `None` when the
    /// whole branch is saturated.
    fn try_spill(&mut self, parent: NodeId, slot: u32, pos: Vec3) -> Option<NodeId> {
        let (center, children) = match self.node(parent) {
            Node { center, kind: NodeKind::Branch(children), .. } => (*center, *children),
            _ => panic!("spill target is not a branch"),
        };
        let own = octant_code(center, pos);

        let mut vacant = None;
        for step in 0..8 {
            let code = (own + step) % 8;
            match children[code] {
                Some(child) => {
                    if let NodeKind::Leaf(slots) = &self.node(child).kind {
                        if slots.len() < self.branch_factor {
                            self.leaf_push(child, slot).expect("room was just checked");
                            debug!(node = child.0, octant = code, "co-located overflow spilled to sibling");
                            return Some(child);
                        }
                    }
                }
                None => {
                    if vacant.is_none() {
                        vacant = Some(code);
                    }
                }
            }
        }

        let code = vacant?;
        let child = self.alloc_leaf_child(parent, code);
        self.leaf_push(child, slot).expect("fresh leaf has room");
        debug!(node = child.0, octant = code, "co-located overflow spilled to empty octant");
        Some(child)
    }

    /// Grows the root outward until its cube contains `pos`: each round
    /// doubles the extent toward the position, wrapping the prior root as
    /// one octant of a new root branch. Existing entities stay put, every
    /// recorded leaf keeps its cube. An empty root leaf is re-centered in
    /// place instead of wrapped.
    fn grow_root(&mut self, pos: Vec3) {
        loop {
            let (center, half_extent) = {
                let root = self.node(self.root);
                (root.center, root.half_extent)
            };
            if cube_contains(center, half_extent, pos) {
                return;
            }
            let new_center = Vec3::new(
                center.x + if pos.x >= center.x { half_extent } else { -half_extent },
                center.y + if pos.y >= center.y { half_extent } else { -half_extent },
                center.z + if pos.z >= center.z { half_extent } else { -half_extent },
            );

            let root_is_empty_leaf =
                matches!(&self.node(self.root).kind, NodeKind::Leaf(slots) if slots.is_empty());
            if root_is_empty_leaf {
                let root = self.root;
                let node = self.node_mut(root);
                node.center = new_center;
                node.half_extent = half_extent * 2.0;
                continue;
            }

            let old_root = self.root;
            let mut children = [None; 8];
            children[octant_code(new_center, center)] = Some(old_root);
            let new_root = self.alloc_node(Node {
                center: new_center,
                half_extent: half_extent * 2.0,
                parent: None,
                kind: NodeKind::Branch(children),
            });
            self.node_mut(old_root).parent = Some(new_root);
            self.root = new_root;
            debug!(
                node = new_root.0,
                half_extent = half_extent * 2.0,
                "root grown outward"
            );
        }
    }

    /// Descends from the root to a leaf with room for `slot`, growing (or
    /// spilling) along the way. Infallible: growth always makes room.
    fn place(&mut self, slot: u32, pos: Vec3) -> NodeId {
        let mut current = self.root;
        loop {
            let (is_leaf, center, parent) = {
                let node = self.node(current);
                (matches!(node.kind, NodeKind::Leaf(_)), node.center, node.parent)
            };

            if !is_leaf {
                let code = octant_code(center, pos);
                let existing = match &self.node(current).kind {
                    NodeKind::Branch(children) => children[code],
                    NodeKind::Leaf(_) => unreachable!(),
                };
                match existing {
                    Some(child) => current = child,
                    None => {
                        let child = self.alloc_leaf_child(current, code);
                        self.leaf_push(child, slot).expect("fresh leaf has room");
                        return child;
                    }
                }
                continue;
            }

            match self.leaf_push(current, slot) {
                Ok(()) => return current,
                Err(IndexError::Capacity { .. }) => {
                    // Splitting a full leaf of exact-position twins would
                    // recurse forever; spill to a sibling octant instead.
                    if let Some(parent) = parent {
                        if self.leaf_all_at(current, pos) {
                            if let Some(leaf) = self.try_spill(parent, slot, pos) {
                                return leaf;
                            }
                        }
                    }
                    self.promote(current);
                }
                Err(_) => unreachable!("leaf_push only raises Capacity"),
            }
        }
    }

    /// Detaches `child` from `parent`, reporting whether the parent still
    /// holds any child.
    fn detach_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        let children = match &mut self.node_mut(parent).kind {
            NodeKind::Branch(children) => children,
            NodeKind::Leaf(_) => panic!("detached a child from a leaf"),
        };
        for entry in children.iter_mut() {
            if *entry == Some(child) {
                *entry = None;
            }
        }
        children.iter().any(Option::is_some)
    }

    /// Removes an emptied node and walks upward freeing every ancestor
    /// branch that became empty, stopping at the first occupied ancestor or
    /// at the root. An emptied root branch reverts to a bare leaf over the
    /// original bounds.
    fn pluck(&mut self, leaf: NodeId) {
        let mut id = leaf;
        while id != self.root {
            let parent = self.node(id).parent.expect("non-root node without a parent");
            let parent_occupied = self.detach_child(parent, id);
            self.free_node(id);
            trace!(node = id.0, "empty node plucked");
            if parent_occupied {
                return;
            }
            id = parent;
        }
        if matches!(self.node(self.root).kind, NodeKind::Branch(_)) {
            let root = self.root;
            self.node_mut(root).kind = NodeKind::Leaf(ArrayVec::new());
        }
    }

    /// Takes a slot out of its leaf, reporting whether the leaf emptied.
    fn leaf_take(&mut self, leaf: NodeId, slot: u32) -> bool {
        match &mut self.node_mut(leaf).kind {
            NodeKind::Leaf(slots) => {
                let at = slots
                    .iter()
                    .position(|&held| held == slot)
                    .expect("record points at a leaf missing its slot");
                slots.remove(at);
                slots.is_empty()
            }
            NodeKind::Branch(_) => panic!("record points at a branch"),
        }
    }

    fn add_inner(&mut self, entity: T) -> Result<(), IndexError> {
        if self.contains_identity(&entity) {
            return Err(IndexError::DuplicateKey);
        }
        let pos = entity.position();
        let slot = self.alloc_slot(entity);
        self.grow_root(pos);
        let leaf = self.place(slot, pos);
        self.record_insert(RefRecord { slot, leaf });
        Ok(())
    }

    fn remove_inner<K>(
        &mut self,
        key: &K,
        cmp: impl Fn(&T, &K) -> Ordering,
    ) -> Result<T, IndexError> {
        let rec = {
            let Core { table, entities, .. } = self;
            let entities = &*entities;
            table.remove_with(key, |rec, key| cmp(slot_entity(entities, rec.slot), key))?
        };
        let emptied = self.leaf_take(rec.leaf, rec.slot);
        let entity = self.take_slot(rec.slot);
        if emptied {
            self.pluck(rec.leaf);
        }
        Ok(entity)
    }

    fn move_inner<K>(
        &mut self,
        key: &K,
        cmp: impl Fn(&T, &K) -> Ordering,
        new_pos: Vec3,
    ) -> Result<(), IndexError> {
        let rec = {
            let Core { table, entities, .. } = self;
            let entities = &*entities;
            *table.get_with(key, |rec, key| cmp(slot_entity(entities, rec.slot), key))?
        };
        self.entities[rec.slot as usize]
            .as_mut()
            .expect("stale entity slot")
            .set_position(new_pos);

        let (center, half_extent) = {
            let node = self.node(rec.leaf);
            (node.center, node.half_extent)
        };
        if cube_contains(center, half_extent, new_pos) {
            return Ok(());
        }

        // Outgrew its leaf: logical remove followed by add, in one section.
        if self.leaf_take(rec.leaf, rec.slot) {
            self.pluck(rec.leaf);
        }
        self.grow_root(new_pos);
        let leaf = self.place(rec.slot, new_pos);
        self.record_repoint(rec.slot, leaf);
        trace!(slot = rec.slot, "entity relocated across leaves");
        Ok(())
    }

    /// Depth-first visitation: leaf contents first, branch children in
    /// fixed octant order 0-7. Returns whether it ran to completion.
    fn visit_from<F: FnMut(&T) -> bool>(&self, id: NodeId, visit: &mut F) -> bool {
        match &self.node(id).kind {
            NodeKind::Leaf(slots) => {
                for &slot in slots {
                    if !visit(slot_entity(&self.entities, slot)) {
                        return false;
                    }
                }
            }
            NodeKind::Branch(children) => {
                for &child in children.iter().flatten() {
                    if !self.visit_from(child, visit) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Range query: prunes branch subtrees whose cubes miss `bounds` and
    /// tests exact positions at leaves. Leaf children are always entered:
    /// a spilled co-located entity lives in a sibling leaf whose cube does
    /// not contain its position, and the per-entity test filters it anyway.
    fn visit_bounded<F: FnMut(&T) -> bool>(
        &self,
        id: NodeId,
        bounds: &AABB,
        visit: &mut F,
    ) -> bool {
        match &self.node(id).kind {
            NodeKind::Leaf(slots) => {
                for &slot in slots {
                    let entity = slot_entity(&self.entities, slot);
                    if bounds.contains(entity.position()) && !visit(entity) {
                        return false;
                    }
                }
            }
            NodeKind::Branch(children) => {
                for &child in children.iter().flatten() {
                    let pruned = matches!(self.node(child).kind, NodeKind::Branch(_))
                        && !self.node_bounds(child).intersects(*bounds);
                    if !pruned && !self.visit_bounded(child, bounds, visit) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// A thread-safe dynamic octree over 3D-positioned entities.
///
/// Leaves hold up to `branch_factor` entities and promote to branches when
/// they fill; emptied leaves and branches are plucked immediately. An
/// embedded reference table (an [`AvlTree`] keyed by the domain comparator)
/// maps each entity to its leaf, so removal and relocation take O(log n)
/// lookups instead of a tree search. The table lives behind the same gate as
/// the octree and mutates in the same critical section.
///
/// Positions outside the current root cube are accepted; the root grows
/// outward, doubling toward the position, until its cube covers it.
pub struct SpatialIndex<T> {
    inner: Gate<Core<T>>,
}

impl<T: Position> SpatialIndex<T> {
    /// `cmp` is the domain identity order among entities; it must not depend
    /// on the mutable position.
    pub fn new(
        center: Vec3,
        half_extent: f32,
        branch_factor: usize,
        cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        let root = Node {
            center,
            half_extent,
            parent: None,
            kind: NodeKind::Leaf(ArrayVec::new()),
        };
        Self {
            inner: Gate::new(Core {
                nodes: vec![Some(root)],
                free_nodes: Vec::new(),
                entities: Vec::new(),
                free_slots: Vec::new(),
                root: NodeId(0),
                branch_factor: branch_factor.clamp(1, MAX_LEAF_SLOTS),
                table: AvlTree::new(),
                cmp: Box::new(cmp),
            }),
        }
    }

    /// Adds an entity at its current position, failing with
    /// [`IndexError::DuplicateKey`] if its identity is already present.
    pub fn add(&self, entity: T) -> Result<(), IndexError> {
        self.inner.write().add_inner(entity)
    }

    /// Removes and returns the entity matching `key`.
    pub fn remove<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> Result<T, IndexError> {
        self.inner.write().remove_inner(key, cmp)
    }

    /// Moves the entity matching `key` to `new_pos`. While the new position
    /// stays inside the entity's current leaf cube no structure changes;
    /// otherwise the entity relocates to the leaf for its new position.
    pub fn move_to<K>(
        &self,
        key: &K,
        cmp: impl Fn(&T, &K) -> Ordering,
        new_pos: Vec3,
    ) -> Result<(), IndexError> {
        self.inner.write().move_inner(key, cmp, new_pos)
    }

    pub fn contains<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> bool {
        let core = self.inner.read();
        let Core { table, entities, .. } = &*core;
        table.contains_with(key, |rec, key| cmp(slot_entity(entities, rec.slot), key))
    }

    /// Visits every entity exactly once, depth-first.
    pub fn for_each(&self, mut visit: impl FnMut(&T)) {
        let core = self.inner.read();
        core.visit_from(core.root, &mut |entity| {
            visit(entity);
            true
        });
    }

    /// Like [`SpatialIndex::for_each`] but stops when the visitor returns
    /// `false`; returns whether it ran to completion.
    pub fn for_each_while(&self, mut visit: impl FnMut(&T) -> bool) -> bool {
        let core = self.inner.read();
        core.visit_from(core.root, &mut visit)
    }

    /// Visits every entity whose position lies inside `bounds`, pruning
    /// whole subtrees whose cubes miss the box.
    pub fn for_each_in(&self, bounds: &AABB, mut visit: impl FnMut(&T)) -> Result<(), IndexError> {
        self.for_each_in_while(bounds, |entity| {
            visit(entity);
            true
        })
        .map(|_| ())
    }

    /// Breakable range query; fails with [`IndexError::InvalidRange`] on a
    /// malformed box.
    pub fn for_each_in_while(
        &self,
        bounds: &AABB,
        mut visit: impl FnMut(&T) -> bool,
    ) -> Result<bool, IndexError> {
        if !bounds.is_valid() {
            return Err(IndexError::InvalidRange {
                start: bounds.start,
                end: bounds.end,
            });
        }
        let core = self.inner.read();
        Ok(core.visit_bounded(core.root, bounds, &mut visit))
    }

    /// Flattens all entities in [`SpatialIndex::for_each`] order.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|entity| out.push(entity.clone()));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().table.is_empty()
    }

    /// Resets to a single empty root leaf over the current root bounds.
    pub fn clear(&self) {
        let mut core = self.inner.write();
        let (center, half_extent) = {
            let root = core.node(core.root);
            (root.center, root.half_extent)
        };
        core.nodes.clear();
        core.nodes.push(Some(Node {
            center,
            half_extent,
            parent: None,
            kind: NodeKind::Leaf(ArrayVec::new()),
        }));
        core.free_nodes.clear();
        core.entities.clear();
        core.free_slots.clear();
        core.root = NodeId(0);
        core.table.clear();
        debug!("spatial index cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::vec3;

    #[derive(Debug, Clone, PartialEq)]
    struct Ent {
        id: u32,
        pos: Vec3,
    }

    impl Ent {
        fn new(id: u32, pos: Vec3) -> Self {
            Self { id, pos }
        }
    }

    impl Position for Ent {
        fn position(&self) -> Vec3 {
            self.pos
        }

        fn set_position(&mut self, pos: Vec3) {
            self.pos = pos;
        }
    }

    fn by_id(stored: &Ent, key: &u32) -> Ordering {
        stored.id.cmp(key)
    }

    fn index(branch_factor: usize) -> SpatialIndex<Ent> {
        SpatialIndex::new(Vec3::ZERO, 1.0, branch_factor, |a: &Ent, b: &Ent| {
            a.id.cmp(&b.id)
        })
    }

    #[derive(Debug, Default, PartialEq)]
    struct Shape {
        leaves: usize,
        branches: usize,
        depth: usize,
    }

    impl<T: Position> SpatialIndex<T> {
        fn shape(&self) -> Shape {
            fn walk<T: Position>(core: &Core<T>, id: NodeId, depth: usize, shape: &mut Shape) {
                shape.depth = shape.depth.max(depth);
                match &core.node(id).kind {
                    NodeKind::Leaf(_) => shape.leaves += 1,
                    NodeKind::Branch(children) => {
                        shape.branches += 1;
                        for &child in children.iter().flatten() {
                            walk(core, child, depth + 1, shape);
                        }
                    }
                }
            }
            let core = self.inner.read();
            let mut shape = Shape::default();
            walk(&core, core.root, 0, &mut shape);
            shape
        }

        fn recorded_leaf<K>(&self, key: &K, cmp: impl Fn(&T, &K) -> Ordering) -> NodeId {
            let core = self.inner.read();
            let Core { table, entities, .. } = &*core;
            table
                .get_with(key, |rec, key| cmp(slot_entity(entities, rec.slot), key))
                .expect("entity not present")
                .leaf
        }

        fn check_invariants(&self) {
            let core = self.inner.read();
            let live = core.entities.iter().filter(|slot| slot.is_some()).count();
            assert_eq!(core.table.len(), live, "table length vs live entities");

            // Walk the tree: count leaf populations, verify parent links
            // and that no branch is empty.
            fn walk<T: Position>(core: &Core<T>, id: NodeId, total: &mut usize) {
                match &core.node(id).kind {
                    NodeKind::Leaf(slots) => {
                        for &slot in slots.iter() {
                            assert!(core.entities[slot as usize].is_some(), "leaf holds a freed slot");
                        }
                        *total += slots.len();
                    }
                    NodeKind::Branch(children) => {
                        let mut any = false;
                        for &child in children.iter().flatten() {
                            any = true;
                            assert_eq!(core.node(child).parent, Some(id), "parent link mismatch");
                            walk(core, child, total);
                        }
                        assert!(any, "dangling empty branch");
                    }
                }
            }
            let mut total = 0;
            walk(&core, core.root, &mut total);
            assert_eq!(total, live, "leaf populations vs live entities");

            // Every record points at a leaf that actually holds its slot.
            core.table.for_each(|rec| match &core.node(rec.leaf).kind {
                NodeKind::Leaf(slots) => {
                    assert!(slots.contains(&rec.slot), "record points at the wrong leaf")
                }
                NodeKind::Branch(_) => panic!("record points at a branch"),
            });
        }
    }

    #[test]
    fn add_traverse_and_count() {
        let index = index(4);
        for id in 0..100u32 {
            let f = id as f32 / 100.0;
            index
                .add(Ent::new(id, vec3(f - 0.5, 0.5 - f, f * 0.3)))
                .unwrap();
        }
        assert_eq!(index.len(), 100);

        let mut seen = Vec::new();
        index.for_each(|e| seen.push(e.id));
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());

        index.check_invariants();
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let index = index(4);
        index.add(Ent::new(1, Vec3::ZERO)).unwrap();
        assert_eq!(
            index.add(Ent::new(1, vec3(0.5, 0.5, 0.5))),
            Err(IndexError::DuplicateKey)
        );
        assert_eq!(index.len(), 1);
        index.check_invariants();
    }

    #[test]
    fn remove_returns_entity_and_plucks() {
        let index = index(2);
        index.add(Ent::new(1, vec3(-0.5, -0.5, -0.5))).unwrap();
        index.add(Ent::new(2, vec3(0.5, 0.5, 0.5))).unwrap();
        index.add(Ent::new(3, vec3(0.6, 0.6, 0.6))).unwrap();

        let removed = index.remove(&2, by_id).unwrap();
        assert_eq!(removed.id, 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.remove(&2, by_id), Err(IndexError::NotFound));
        index.check_invariants();
    }

    #[test]
    fn colocated_overflow_promotes_once_and_spills() {
        // branch_factor 4, five entities at one exact coordinate: exactly
        // one promotion, and the population spreads over two leaves.
        let index = index(4);
        let pos = vec3(0.25, 0.25, 0.25);
        for id in 0..5u32 {
            index.add(Ent::new(id, pos)).unwrap();
        }

        assert_eq!(index.len(), 5);
        assert_eq!(
            index.shape(),
            Shape { leaves: 2, branches: 1, depth: 1 }
        );
        index.check_invariants();

        let mut seen = Vec::new();
        index.for_each(|e| seen.push(e.id));
        seen.sort_unstable();
        assert_eq!(seen, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn range_query_finds_spilled_colocated_entities() {
        // The fifth co-located entity spills into a sibling leaf whose cube
        // misses its position; a box around the shared position must still
        // report all five.
        let index = index(4);
        let pos = vec3(0.25, 0.25, 0.25);
        for id in 0..5u32 {
            index.add(Ent::new(id, pos)).unwrap();
        }
        index.check_invariants();

        let mut found = Vec::new();
        index
            .for_each_in(
                &AABB::new(vec3(0.2, 0.2, 0.2), vec3(0.3, 0.3, 0.3)),
                |e| found.push(e.id),
            )
            .unwrap();
        found.sort_unstable();
        assert_eq!(found, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn colocated_flood_terminates() {
        let index = index(4);
        let pos = vec3(-0.3, 0.7, 0.1);
        for id in 0..100u32 {
            index.add(Ent::new(id, pos)).unwrap();
        }
        assert_eq!(index.len(), 100);
        index.check_invariants();
    }

    #[test]
    fn deep_pluck_cascades_to_first_occupied_ancestor() {
        let index = index(1);
        index.add(Ent::new(1, vec3(-0.5, -0.5, -0.5))).unwrap();
        index.add(Ent::new(2, vec3(0.55, 0.55, 0.55))).unwrap();
        index.add(Ent::new(3, vec3(0.95, 0.95, 0.95))).unwrap();

        // Entities 2 and 3 share octant 7 twice over, so they sit several
        // levels deep.
        let shape = index.shape();
        assert!(shape.depth >= 2, "expected a deep chain, got {shape:?}");
        index.check_invariants();

        index.remove(&3, by_id).unwrap();
        index.check_invariants();

        // Removing 2 empties the whole chain under the root's octant 7; the
        // cascade stops at the root, which still holds entity 1's leaf.
        index.remove(&2, by_id).unwrap();
        assert_eq!(
            index.shape(),
            Shape { leaves: 1, branches: 1, depth: 1 }
        );
        index.check_invariants();

        // Removing the last entity reverts the root to a bare leaf.
        index.remove(&1, by_id).unwrap();
        assert!(index.is_empty());
        assert_eq!(
            index.shape(),
            Shape { leaves: 1, branches: 0, depth: 0 }
        );
        index.check_invariants();
    }

    #[test]
    fn move_inside_leaf_keeps_structure() {
        let index = index(1);
        index.add(Ent::new(1, vec3(0.5, 0.5, 0.5))).unwrap();
        index.add(Ent::new(2, vec3(-0.5, -0.5, -0.5))).unwrap();

        let before = index.recorded_leaf(&1, by_id);
        index.move_to(&1, by_id, vec3(0.6, 0.5, 0.4)).unwrap();
        assert_eq!(index.recorded_leaf(&1, by_id), before);

        let moved = index.to_vec().into_iter().find(|e| e.id == 1).unwrap();
        assert_eq!(moved.pos, vec3(0.6, 0.5, 0.4));
        index.check_invariants();
    }

    #[test]
    fn move_outside_leaf_relocates() {
        let index = index(1);
        index.add(Ent::new(1, vec3(0.5, 0.5, 0.5))).unwrap();
        index.add(Ent::new(2, vec3(-0.5, -0.5, -0.5))).unwrap();

        let before = index.recorded_leaf(&1, by_id);
        index.move_to(&1, by_id, vec3(-0.6, -0.6, -0.6)).unwrap();
        assert_ne!(index.recorded_leaf(&1, by_id), before);
        assert_eq!(index.len(), 2);
        index.check_invariants();

        // The bounded query finds it at the new location.
        let mut found = Vec::new();
        index
            .for_each_in(
                &AABB::new(vec3(-1.0, -1.0, -1.0), vec3(-0.55, -0.55, -0.55)),
                |e| found.push(e.id),
            )
            .unwrap();
        assert_eq!(found, [1]);

        assert_eq!(
            index.move_to(&9, by_id, Vec3::ZERO),
            Err(IndexError::NotFound)
        );
    }

    #[test]
    fn range_query_matches_brute_force() {
        use rand::Rng;
        use std::collections::HashSet;

        let mut rng = rand::thread_rng();
        let index = index(4);
        for id in 0..300u32 {
            let pos = vec3(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            index.add(Ent::new(id, pos)).unwrap();
        }
        index.check_invariants();

        let all = index.to_vec();
        for _ in 0..25 {
            let start = vec3(
                rng.gen_range(-1.2..0.8),
                rng.gen_range(-1.2..0.8),
                rng.gen_range(-1.2..0.8),
            );
            let bounds = AABB::new(
                start,
                start
                    + vec3(
                        rng.gen_range(0.0..1.0),
                        rng.gen_range(0.0..1.0),
                        rng.gen_range(0.0..1.0),
                    ),
            );

            let mut queried = HashSet::new();
            index
                .for_each_in(&bounds, |e| {
                    assert!(queried.insert(e.id), "entity visited twice");
                })
                .unwrap();

            let brute: HashSet<u32> = all
                .iter()
                .filter(|e| bounds.contains(e.pos))
                .map(|e| e.id)
                .collect();
            assert_eq!(queried, brute);
        }
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let index = index(4);
        index.add(Ent::new(1, Vec3::ZERO)).unwrap();

        let inverted = AABB::new(Vec3::ONE, Vec3::ZERO);
        assert!(matches!(
            index.for_each_in(&inverted, |_| ()),
            Err(IndexError::InvalidRange { .. })
        ));
    }

    #[test]
    fn breakable_traversal_stops_early() {
        let index = index(4);
        for id in 0..20u32 {
            let f = id as f32 / 20.0 - 0.5;
            index.add(Ent::new(id, vec3(f, f, f))).unwrap();
        }

        let mut visited = 0;
        let completed = index.for_each_while(|_| {
            visited += 1;
            visited < 5
        });
        assert!(!completed);
        assert_eq!(visited, 5);
    }

    #[test]
    fn clear_resets_to_empty_root() {
        let index = index(2);
        for id in 0..30u32 {
            let f = id as f32 / 30.0 - 0.5;
            index.add(Ent::new(id, vec3(f, -f, f * 0.2))).unwrap();
        }
        index.clear();
        assert!(index.is_empty());
        assert_eq!(
            index.shape(),
            Shape { leaves: 1, branches: 0, depth: 0 }
        );
        index.add(Ent::new(5, Vec3::ZERO)).unwrap();
        assert_eq!(index.len(), 1);
        index.check_invariants();
    }

    #[test]
    fn out_of_root_adds_grow_the_root_outward() {
        let index = index(2);
        index.add(Ent::new(1, vec3(5.0, 5.0, 5.0))).unwrap();
        index.add(Ent::new(2, vec3(-7.0, 2.0, 0.0))).unwrap();
        index.add(Ent::new(3, vec3(9.0, 9.0, 9.0))).unwrap();
        assert_eq!(index.len(), 3);
        index.check_invariants();

        let mut seen = Vec::new();
        index.for_each(|e| seen.push(e.id));
        seen.sort_unstable();
        assert_eq!(seen, [1, 2, 3]);

        // A grown root keeps every entity reachable by a box around its
        // actual position.
        let cases = [
            (vec3(4.0, 4.0, 4.0), vec3(6.0, 6.0, 6.0), 1u32),
            (vec3(-8.0, 1.0, -1.0), vec3(-6.0, 3.0, 1.0), 2),
            (vec3(8.0, 8.0, 8.0), vec3(10.0, 10.0, 10.0), 3),
        ];
        for (start, end, id) in cases {
            let mut found = Vec::new();
            index
                .for_each_in(&AABB::new(start, end), |e| found.push(e.id))
                .unwrap();
            assert_eq!(found, [id]);
        }
    }

    #[test]
    fn move_out_of_root_grows_and_stays_queryable() {
        let index = index(2);
        index.add(Ent::new(1, vec3(0.5, 0.5, 0.5))).unwrap();
        index.add(Ent::new(2, vec3(-0.5, -0.5, -0.5))).unwrap();

        index.move_to(&1, by_id, vec3(3.0, 3.0, 3.0)).unwrap();
        assert_eq!(index.len(), 2);
        index.check_invariants();

        let mut found = Vec::new();
        index
            .for_each_in(
                &AABB::new(vec3(2.5, 2.5, 2.5), vec3(3.5, 3.5, 3.5)),
                |e| found.push(e.id),
            )
            .unwrap();
        assert_eq!(found, [1]);
    }

    #[test]
    fn concurrent_traversals_and_mutations() {
        let index = index(4);
        for id in 0..64u32 {
            let f = id as f32 / 64.0 - 0.5;
            index.add(Ent::new(id, vec3(f, f * 0.5, -f))).unwrap();
        }

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        // Each traversal must observe a consistent state.
                        let mut count = 0;
                        index.for_each(|_| count += 1);
                        assert!((64..=128).contains(&count));
                    }
                });
            }
            scope.spawn(|| {
                for id in 64..128u32 {
                    let f = id as f32 / 128.0 - 0.5;
                    index.add(Ent::new(id, vec3(-f, f, f * 0.25))).unwrap();
                }
            });
        });

        assert_eq!(index.len(), 128);
        index.check_invariants();
    }
}
