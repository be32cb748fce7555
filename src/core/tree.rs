//! In-memory tree of a scanned filesystem.
//!
//! Nodes are stored in a flat arena and reference each other by index,
//! which avoids recursive ownership and makes borrowing trivial. Freed
//! slots are reused; a magic sentinel per node catches stale ids after
//! subtree deletions. Aggregate sums are cached per directory and
//! recomputed lazily on first read after a change.
//!
//! Observers subscribe by handing the tree an unbounded channel sender;
//! every structural change emits a [`TreeEvent`]. Since events are drained
//! outside the mutation sites, reentrant mutation from inside a
//! notification is impossible by construction.

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::error;

use crate::core::node::{
    DirPayload, DirSums, Node, NodeId, NodeKind, ReadState, SortCache, SortColumn, SortOrder,
    ATTIC_NAME, DOT_ENTRY_NAME, NODE_DEAD, NODE_MAGIC,
};

// ───────────────────────────────────────── errors ────────────

#[derive(Debug, Error)]
pub enum TreeError {
    /// A node id referred to a freed or reused arena slot. The caller is
    /// expected to re-locate the node by its url.
    #[error("stale node reference")]
    InvalidNode,
}

// ───────────────────────────────────────── events ────────────

/// Change notifications the tree emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// A directory read began (the root id stands for the whole tree).
    StartingRead(NodeId),
    ChildAdded(NodeId),
    /// Sent before the node is unlinked and freed; the url outlives the id.
    DeletingChild { node: NodeId, url: String },
    ReadJobFinished(NodeId),
    /// Sent before dot-entry pruning rearranges this directory's children.
    FinalizeLocal(NodeId),
    /// All read jobs done; fires exactly once per scan.
    Finished,
    Aborted,
    ClearingSubtree(NodeId),
    SubtreeCleared(NodeId),
}

// ───────────────────────────────────────── tree ──────────────

/// Arena-backed directory tree with an invisible root.
pub struct Tree {
    nodes: Vec<Node>,
    free_list: Vec<NodeId>,
    root: NodeId,
    /// Device name of the scan root's mount point (mount-boundary checks
    /// fall back to this when a node has no mount-point ancestor).
    device: String,
    events: Option<UnboundedSender<TreeEvent>>,
}

impl Tree {
    pub fn new(events: Option<UnboundedSender<TreeEvent>>) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free_list: Vec::new(),
            root: 0,
            device: String::new(),
            events,
        };
        tree.root = tree.alloc(Node::root());
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The first real child of the root, i.e. the scan's top directory.
    pub fn first_toplevel(&self) -> Option<NodeId> {
        self.node(self.root).payload()?.children.first().copied()
    }

    pub fn is_toplevel(&self, id: NodeId) -> bool {
        self.node(id).parent == Some(self.root)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn set_device(&mut self, device: String) {
        self.device = device;
    }

    /// The absolute start path, i.e. the first toplevel's url.
    pub fn url_of_tree(&self) -> String {
        self.first_toplevel().map(|id| self.url(id)).unwrap_or_default()
    }

    pub(crate) fn emit(&self, event: TreeEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ── arena access ────────────────────────────────────────────

    /// Checked lookup; fails on ids that outlived a deletion.
    pub fn get(&self, id: NodeId) -> Result<&Node, TreeError> {
        match self.nodes.get(id) {
            Some(node) if node.magic == NODE_MAGIC => Ok(node),
            _ => Err(TreeError::InvalidNode),
        }
    }

    pub fn is_valid(&self, id: NodeId) -> bool {
        self.get(id).is_ok()
    }

    /// Unchecked access for ids known to be live (internal traversals).
    pub fn node(&self, id: NodeId) -> &Node {
        let node = &self.nodes[id];
        debug_assert_eq!(node.magic, NODE_MAGIC, "dereferencing a dead node");
        node
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        let node = &mut self.nodes[id];
        debug_assert_eq!(node.magic, NODE_MAGIC, "dereferencing a dead node");
        node
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free_list.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Mark one slot dead and recycle it.
    fn release(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.magic = NODE_DEAD;
        node.parent = None;
        node.kind = NodeKind::File;
        node.name.clear();
        self.free_list.push(id);
    }

    /// Free a node and everything below it.
    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            if let Some(payload) = self.nodes[current].payload() {
                stack.extend(payload.children.iter().copied());
                stack.extend(payload.dot_entry);
                stack.extend(payload.attic);
            }
            self.release(current);
        }
    }

    // ── structure helpers ───────────────────────────────────────

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).payload().map(|p| p.children.as_slice()).unwrap_or(&[])
    }

    pub fn dot_entry(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).payload().and_then(|p| p.dot_entry)
    }

    pub fn attic(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).payload().and_then(|p| p.attic)
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        self.node(id).payload().map(|p| p.has_children()).unwrap_or(false)
    }

    /// Depth below the root; the root itself is level 0.
    pub fn tree_level(&self, id: NodeId) -> usize {
        let mut level = 0;
        let mut current = self.node(id).parent;

        while let Some(parent) = current {
            level += 1;
            current = self.node(parent).parent;
        }

        level
    }

    pub fn is_in_subtree(&self, id: NodeId, subtree: NodeId) -> bool {
        let mut current = Some(id);

        while let Some(node) = current {
            if node == subtree {
                return true;
            }
            current = self.node(node).parent;
        }

        false
    }

    /// Full path of a node. Pseudo directories are transparent: a file in
    /// a dot entry has the same url as if it were a direct child.
    pub fn url(&self, id: NodeId) -> String {
        let node = self.node(id);

        let Some(parent) = node.parent else {
            return node.name.clone();
        };

        if node.is_dot_entry() || node.is_attic() {
            return self.url(parent);
        }

        let parent_url = self.url(parent);

        if parent_url.is_empty() {
            node.name.clone()
        } else if parent_url.ends_with('/') || node.name.starts_with('/') {
            format!("{parent_url}{}", node.name)
        } else {
            format!("{parent_url}/{}", node.name)
        }
    }

    /// Like [`url`](Self::url), with the pseudo name appended for dot
    /// entries and attics.
    pub fn debug_url(&self, id: NodeId) -> String {
        let node = self.node(id);
        let url = self.url(id);

        if node.is_dot_entry() {
            format!("{url}/{DOT_ENTRY_NAME}")
        } else if node.is_attic() {
            format!("{url}/{ATTIC_NAME}")
        } else {
            url
        }
    }

    /// Nearest ancestor (or self) flagged as a mount point.
    pub fn find_nearest_mount_point(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);

        while let Some(node) = current {
            if self.node(node).is_mount_point {
                return Some(node);
            }
            current = self.node(node).parent;
        }

        None
    }

    // ── insertion ───────────────────────────────────────────────

    /// Insert a new child under `parent`. Directory-kind children go into
    /// the parent's children list; files go into the parent's dot entry,
    /// which is created lazily. Returns the new node's id.
    pub fn insert_child(&mut self, parent: NodeId, node: Node) -> NodeId {
        let parent_node = self.node(parent);

        if parent_node.payload().is_none() {
            error!("Insert under non-directory {} refused", self.debug_url(parent));
            return parent;
        }

        if parent_node.is_dot_entry() && node.is_dir_kind() {
            // A dot entry may not have directory children; hand the child
            // to the directory owning the dot entry instead.
            error!(
                "Directory {} inserted into dot entry {} - reparenting",
                node.name,
                self.debug_url(parent)
            );
            let owner = parent_node.parent.unwrap_or(parent);
            return self.insert_child(owner, node);
        }

        // A dot entry stores everything it gets directly; the root keeps
        // its toplevel items direct as well, whatever their kind.
        let direct = node.is_dir_kind()
            || parent_node.is_dot_entry()
            || matches!(parent_node.kind, NodeKind::Root(_));

        if direct {
            let id = self.alloc(node);
            self.nodes[id].parent = Some(parent);
            self.node_mut(parent)
                .payload_mut()
                .expect("checked above")
                .children
                .push(id);
            self.child_added(parent, id);
            self.emit(TreeEvent::ChildAdded(id));
            id
        } else {
            let dot = self.ensure_dot_entry(parent);
            self.insert_child(dot, node)
        }
    }

    /// Insert a new child into `parent`'s attic (ignored entries). The
    /// attic is created lazily; its sums never reach the parent's.
    pub fn insert_ignored(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.is_ignored = true;
        let attic = self.ensure_attic(parent);
        self.insert_child(attic, node)
    }

    fn ensure_dot_entry(&mut self, parent: NodeId) -> NodeId {
        if let Some(dot) = self.dot_entry(parent) {
            return dot;
        }

        let dot_node = Node::dot_entry_for(self.node(parent));
        let dot = self.alloc(dot_node);
        self.nodes[dot].parent = Some(parent);

        let payload = self.node_mut(parent).payload_mut().expect("dir parent");
        payload.dot_entry = Some(dot);
        self.pseudo_child_added(parent);
        self.emit(TreeEvent::ChildAdded(dot));
        dot
    }

    fn ensure_attic(&mut self, parent: NodeId) -> NodeId {
        if let Some(attic) = self.attic(parent) {
            return attic;
        }

        let attic_node = Node::attic_for(self.node(parent));
        let attic = self.alloc(attic_node);
        self.nodes[attic].parent = Some(parent);

        let payload = self.node_mut(parent).payload_mut().expect("dir parent");
        payload.attic = Some(attic);
        self.emit(TreeEvent::ChildAdded(attic));
        attic
    }

    /// A dot entry appeared: only the direct-children count of its parent
    /// changes; totals stay untouched since pseudo dirs are transparent
    /// in the sums.
    fn pseudo_child_added(&mut self, parent: NodeId) {
        let payload = self.node_mut(parent).payload_mut().expect("dir parent");
        if !payload.summary_dirty.get() {
            let mut sums = payload.sums.get();
            sums.direct_children += 1;
            payload.sums.set(sums);
        }
        Self::drop_sort_cache_unless(payload, SortColumn::ReadJobs);
    }

    /// Incremental aggregate update after `child` was linked under
    /// `parent`: every ancestor that is not dirty adds the child's own
    /// contribution. Propagation stops at an attic boundary so ignored
    /// entries never reach the outer sums.
    fn child_added(&mut self, parent: NodeId, child: NodeId) {
        let (size, allocated, blocks, is_dir, is_file, mtime) = {
            let c = self.node(child);
            (
                c.size(),
                c.effective_allocated(),
                c.blocks(),
                c.is_dir() && !c.is_pseudo_dir(),
                c.is_file(),
                c.mtime,
            )
        };

        let mut current = Some(parent);

        while let Some(id) = current {
            let is_attic = self.node(id).is_attic();
            let payload = self.node_mut(id).payload_mut().expect("ancestors are dirs");

            if !payload.summary_dirty.get() {
                let mut sums = payload.sums.get();
                sums.total_size += size;
                sums.total_allocated += allocated;
                sums.total_blocks += blocks;
                sums.total_items += 1;
                if id == parent {
                    sums.direct_children += 1;
                }
                if is_dir {
                    sums.total_subdirs += 1;
                }
                if is_file {
                    sums.total_files += 1;
                }
                if mtime > sums.latest_mtime {
                    sums.latest_mtime = mtime;
                }
                payload.sums.set(sums);
            }

            Self::drop_sort_cache_unless(payload, SortColumn::ReadJobs);

            if is_attic {
                break;
            }
            current = self.node(id).parent;
        }
    }

    // ── deletion ────────────────────────────────────────────────

    /// Delete a node and its whole subtree: notify, unlink from the
    /// parent, free recursively. A dot entry that ends up childless is
    /// itself removed once its directory finished reading.
    pub fn delete_subtree(&mut self, id: NodeId) {
        if !self.is_valid(id) {
            error!("delete_subtree on a stale node id {id}");
            return;
        }

        let url = self.debug_url(id);
        self.emit(TreeEvent::DeletingChild { node: id, url });

        let parent = self.node(id).parent;

        if let Some(parent) = parent {
            self.mark_dirty_up(parent);
            self.unlink_child(parent, id);
        }

        self.free_subtree(id);

        // Remove a now-childless dot entry.
        let Some(dot) = parent.filter(|&p| self.is_valid(p) && self.node(p).is_dot_entry()) else {
            return;
        };

        if self.has_children(dot) {
            return;
        }

        let Some(owner) = self.node(dot).parent else {
            error!("Dot entry {dot} without parent");
            return;
        };

        if self.is_finished(owner) {
            let url = self.debug_url(dot);
            self.emit(TreeEvent::DeletingChild { node: dot, url });
            let payload = self.node_mut(owner).payload_mut().expect("dir owner");
            payload.dot_entry = None;
            payload.sort_cache = None;
            self.mark_dirty_up(owner);
            self.release(dot);
        }
    }

    /// Unlink `child` from `parent`'s child containers.
    fn unlink_child(&mut self, parent: NodeId, child: NodeId) {
        if self.node(child).parent != Some(parent) {
            error!(
                "{} is not a child of {} - cannot unlink",
                self.debug_url(child),
                self.debug_url(parent)
            );
            return;
        }

        let payload = self.node_mut(parent).payload_mut().expect("dir parent");
        payload.sort_cache = None;

        if payload.dot_entry == Some(child) {
            payload.dot_entry = None;
            return;
        }
        if payload.attic == Some(child) {
            payload.attic = None;
            return;
        }

        let before = payload.children.len();
        payload.children.retain(|&c| c != child);

        if payload.children.len() == before {
            error!("Couldn't unlink {child} from children list of {parent}");
        }
    }

    /// Mark the summary caches dirty from `id` up to the root (stopping
    /// beyond an attic, whose contents the outer sums never included).
    fn mark_dirty_up(&mut self, id: NodeId) {
        let mut current = Some(id);

        while let Some(node_id) = current {
            let is_attic = self.node(node_id).is_attic();
            if let Some(payload) = self.node_mut(node_id).payload_mut() {
                payload.summary_dirty.set(true);
                payload.sort_cache = None;
            }
            if is_attic {
                break;
            }
            current = self.node(node_id).parent;
        }
    }

    /// Remove all children of a directory (refresh preparation), leaving
    /// the directory node itself in place.
    pub fn clear_dir(&mut self, dir: NodeId) {
        let Some(payload) = self.node(dir).payload() else {
            return;
        };

        let mut doomed: Vec<NodeId> = payload.children.clone();
        doomed.extend(payload.dot_entry);
        doomed.extend(payload.attic);

        for child in doomed {
            let url = self.debug_url(child);
            self.emit(TreeEvent::DeletingChild { node: child, url });
            self.free_subtree(child);
        }

        let payload = self.node_mut(dir).payload_mut().expect("dir");
        payload.children.clear();
        payload.dot_entry = None;
        payload.attic = None;
        payload.sort_cache = None;
        payload.summary_dirty.set(true);

        self.mark_dirty_up(dir);
    }

    /// Reset a directory to its initial state in preparation of a rescan.
    pub fn reset_dir(&mut self, dir: NodeId) {
        self.clear_dir(dir);

        let node = self.node_mut(dir);
        node.is_excluded = false;
        if let Some(payload) = node.payload_mut() {
            payload.read_state = ReadState::Queued;
            payload.pending_read_jobs = 0;
        }
    }

    /// Tear down everything below the root.
    pub fn clear(&mut self) {
        let toplevel: Vec<NodeId> = self.children(self.root).to_vec();

        for child in toplevel {
            self.delete_subtree(child);
        }

        self.device.clear();
    }

    // ── aggregates ──────────────────────────────────────────────

    /// Recompute the cached sums of one directory if they are dirty.
    /// Children are pulled recursively, so one call cleans the subtree as
    /// far as needed. Pseudo directories are transparent: their totals
    /// flow through but they are not counted as items themselves, and an
    /// attic contributes nothing at all.
    fn ensure_clean(&self, id: NodeId) {
        let node = self.node(id);
        let Some(payload) = node.payload() else {
            return;
        };
        if !payload.summary_dirty.get() {
            return;
        }

        let mut sums = DirSums {
            total_size: node.size(),
            total_allocated: node.allocated_size(),
            total_blocks: node.blocks(),
            latest_mtime: node.mtime,
            ..DirSums::default()
        };

        let mut members: Vec<NodeId> = payload.children.clone();
        members.extend(payload.dot_entry);

        for child in members {
            let child_node = self.node(child);
            sums.direct_children += 1;
            sums.total_size += self.total_size(child);
            sums.total_allocated += self.total_allocated(child);
            sums.total_blocks += self.total_blocks(child);
            sums.total_items += self.total_items(child);
            sums.total_files += self.total_files(child);
            sums.total_subdirs += self.total_subdirs(child);

            if !child_node.is_pseudo_dir() {
                sums.total_items += 1;
                if child_node.is_dir() {
                    sums.total_subdirs += 1;
                }
                if child_node.is_file() {
                    sums.total_files += 1;
                }
            }

            let child_mtime = self.latest_mtime(child);
            if child_mtime > sums.latest_mtime {
                sums.latest_mtime = child_mtime;
            }
        }

        payload.sums.set(sums);
        payload.summary_dirty.set(false);
    }

    pub fn total_size(&self, id: NodeId) -> u64 {
        match self.node(id).payload() {
            None => self.node(id).size(),
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().total_size
            }
        }
    }

    pub fn total_allocated(&self, id: NodeId) -> u64 {
        match self.node(id).payload() {
            None => self.node(id).effective_allocated(),
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().total_allocated
            }
        }
    }

    pub fn total_blocks(&self, id: NodeId) -> u64 {
        match self.node(id).payload() {
            None => self.node(id).blocks(),
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().total_blocks
            }
        }
    }

    pub fn total_items(&self, id: NodeId) -> u32 {
        match self.node(id).payload() {
            None => 0,
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().total_items
            }
        }
    }

    pub fn total_files(&self, id: NodeId) -> u32 {
        match self.node(id).payload() {
            None => 0,
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().total_files
            }
        }
    }

    pub fn total_subdirs(&self, id: NodeId) -> u32 {
        match self.node(id).payload() {
            None => 0,
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().total_subdirs
            }
        }
    }

    pub fn latest_mtime(&self, id: NodeId) -> i64 {
        match self.node(id).payload() {
            None => self.node(id).mtime,
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().latest_mtime
            }
        }
    }

    pub fn direct_children_count(&self, id: NodeId) -> u32 {
        match self.node(id).payload() {
            None => 0,
            Some(payload) => {
                self.ensure_clean(id);
                payload.sums.get().direct_children
            }
        }
    }

    /// Checked aggregate reads for node ids that may have aged across
    /// tree mutations: the magic number is verified before dereferencing.
    pub fn try_total_size(&self, id: NodeId) -> Result<u64, TreeError> {
        self.get(id)?;
        Ok(self.total_size(id))
    }

    pub fn try_total_items(&self, id: NodeId) -> Result<u32, TreeError> {
        self.get(id)?;
        Ok(self.total_items(id))
    }

    /// This subtree's share of its parent (0..100), or `None` while the
    /// parent is still reading, has zero size, or this node is excluded.
    pub fn subtree_percent(&self, id: NodeId) -> Option<f32> {
        let parent = self.node(id).parent?;

        if self.pending_read_jobs(parent) > 0
            || self.node(id).is_excluded
            || self.total_size(parent) == 0
        {
            return None;
        }

        Some(100.0 * self.total_size(id) as f32 / self.total_size(parent) as f32)
    }

    // ── read state & job bookkeeping ────────────────────────────

    /// A dot entry or attic reports its parent's state; plain files count
    /// as finished.
    pub fn read_state(&self, id: NodeId) -> ReadState {
        let node = self.node(id);

        match &node.kind {
            NodeKind::File => ReadState::Finished,
            NodeKind::DotEntry(payload) | NodeKind::Attic(payload) => match node.parent {
                Some(parent) => self.read_state(parent),
                None => payload.read_state,
            },
            _ => node.payload().expect("dir kind").read_state,
        }
    }

    /// "Aborted" has higher priority than "finished": a late Finished
    /// never overwrites an abort.
    pub fn set_read_state(&mut self, id: NodeId, new_state: ReadState) {
        let Some(payload) = self.node_mut(id).payload_mut() else {
            error!("set_read_state on non-directory node {id}");
            return;
        };

        if payload.read_state == ReadState::Aborted && new_state == ReadState::Finished {
            return;
        }

        payload.read_state = new_state;
    }

    pub fn pending_read_jobs(&self, id: NodeId) -> u32 {
        self.node(id).payload().map(|p| p.pending_read_jobs).unwrap_or(0)
    }

    /// A read job was scheduled somewhere in this subtree.
    pub fn read_job_added(&mut self, dir: NodeId) {
        let mut current = Some(dir);

        while let Some(id) = current {
            if let Some(payload) = self.node_mut(id).payload_mut() {
                payload.pending_read_jobs += 1;
                Self::drop_sort_cache_if(payload, SortColumn::ReadJobs);
            }
            current = self.node(id).parent;
        }
    }

    /// A read job in this subtree was retired (finished, killed, aborted).
    pub fn read_job_finished(&mut self, dir: NodeId) {
        let mut current = Some(dir);

        while let Some(id) = current {
            if let Some(payload) = self.node_mut(id).payload_mut() {
                payload.pending_read_jobs = payload.pending_read_jobs.saturating_sub(1);
                Self::drop_sort_cache_if(payload, SortColumn::ReadJobs);
            }
            current = self.node(id).parent;
        }
    }

    /// Propagate an abort: the directory and all its ancestors go to the
    /// `Aborted` state.
    pub fn read_job_aborted(&mut self, dir: NodeId) {
        let mut current = Some(dir);

        while let Some(id) = current {
            if let Some(payload) = self.node_mut(id).payload_mut() {
                payload.read_state = ReadState::Aborted;
            }
            current = self.node(id).parent;
        }
    }

    pub fn is_busy(&self, id: NodeId) -> bool {
        let Some(payload) = self.node(id).payload() else {
            return false;
        };

        if payload.pending_read_jobs > 0 && payload.read_state != ReadState::Aborted {
            return true;
        }

        matches!(self.read_state(id), ReadState::Reading | ReadState::Queued)
    }

    pub fn is_finished(&self, id: NodeId) -> bool {
        !self.is_busy(id)
    }

    /// True if any directory in this subtree ended in `Error` or
    /// `Aborted` (totals are then lower bounds).
    pub fn has_error_descendant(&self, id: NodeId) -> bool {
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            if let Some(payload) = self.node(current).payload() {
                if matches!(payload.read_state, ReadState::Error | ReadState::Aborted) {
                    return true;
                }
                stack.extend(payload.children.iter().copied());
                stack.extend(payload.dot_entry);
            }
        }

        false
    }

    // ── finalization ────────────────────────────────────────────

    /// After a directory finished reading, prune its dot entry: if there
    /// are no subdirectories the dot entry's children move directly under
    /// the directory; an empty dot entry is removed.
    pub fn finalize_local(&mut self, dir: NodeId) {
        self.emit(TreeEvent::FinalizeLocal(dir));
        self.cleanup_dot_entries(dir);
    }

    /// Bottom-up finalization of a whole subtree.
    pub fn finalize_all(&mut self, dir: NodeId) {
        let children: Vec<NodeId> = self.children(dir).to_vec();

        for child in children {
            let node = self.node(child);
            if node.is_dir_kind() && !node.is_pseudo_dir() {
                self.finalize_all(child);
            }
        }

        self.finalize_local(dir);
    }

    fn cleanup_dot_entries(&mut self, dir: NodeId) {
        let node = self.node(dir);
        if node.is_pseudo_dir() {
            return;
        }
        let Some(payload) = node.payload() else {
            return;
        };
        let Some(dot) = payload.dot_entry else {
            return;
        };

        // No subdirectories on this level: reparent the dot entry's
        // children to the directory itself.
        if payload.children.is_empty() {
            let moved: Vec<NodeId> = self.children(dot).to_vec();

            for &child in &moved {
                self.nodes[child].parent = Some(dir);
            }

            let dot_payload = self.node_mut(dot).payload_mut().expect("dot entry");
            dot_payload.children.clear();

            let payload = self.node_mut(dir).payload_mut().expect("dir");
            payload.children = moved;
        }

        // Remove a dot entry without any children (including one just
        // disowned above).
        if !self.has_children(dot) {
            let payload = self.node_mut(dir).payload_mut().expect("dir");
            payload.dot_entry = None;
            self.release(dot);
        }

        let payload = self.node_mut(dir).payload_mut().expect("dir");
        payload.sort_cache = None;
        if !payload.summary_dirty.get() {
            // Totals are unchanged by pruning (pseudo dirs are transparent);
            // only the direct-children count needs a recount.
            let count = payload.children.len() + payload.dot_entry.iter().len();
            let mut sums = payload.sums.get();
            sums.direct_children = count as u32;
            payload.sums.set(sums);
        }
    }

    // ── touch hints ─────────────────────────────────────────────

    /// Observer hint: a view has displayed this node, so change
    /// notifications for it are worth sending.
    pub fn mark_touched(&mut self, id: NodeId) {
        if let Some(payload) = self.node_mut(id).payload_mut() {
            payload.touched = true;
        }
    }

    pub fn is_touched(&self, id: NodeId) -> bool {
        self.node(id).payload().map(|p| p.touched).unwrap_or(false)
    }

    pub fn clear_touched(&mut self, id: NodeId) {
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            if let Some(payload) = self.node_mut(current).payload_mut() {
                payload.touched = false;
                stack.extend(payload.children.iter().copied());
                stack.extend(payload.dot_entry);
                stack.extend(payload.attic);
            }
        }
    }

    // ── locate ──────────────────────────────────────────────────

    /// Find a node by its absolute path. `find_pseudo_dirs` also resolves
    /// the trailing pseudo names `<Files>` and `<Ignored>`.
    pub fn locate(&self, url: &str, find_pseudo_dirs: bool) -> Option<NodeId> {
        let clean = clean_path(url);

        for &toplevel in self.children(self.root) {
            if let Some(found) = self.locate_in(toplevel, &clean, find_pseudo_dirs) {
                return Some(found);
            }
        }

        None
    }

    pub(crate) fn locate_in(&self, id: NodeId, url: &str, find_pseudo_dirs: bool) -> Option<NodeId> {
        let node = self.node(id);
        let rest = url.strip_prefix(node.name.as_str())?;

        if rest.is_empty() {
            return Some(id);
        }

        let rest = match rest.strip_prefix('/') {
            Some(r) => r,
            // No path delimiter: this can only be below us if this node's
            // name already ends in "/" (the filesystem root).
            None if node.name.ends_with('/') => rest,
            None => return None,
        };

        let payload = node.payload()?;

        for &child in &payload.children {
            if let Some(found) = self.locate_in(child, rest, find_pseudo_dirs) {
                return Some(found);
            }
        }

        if let Some(dot) = payload.dot_entry {
            if find_pseudo_dirs && rest == DOT_ENTRY_NAME {
                return Some(dot);
            }

            // The dot entry holds files only; their names cannot contain
            // a path delimiter, so only descend if none is left.
            if !rest.contains('/') {
                for &child in self.children(dot) {
                    if let Some(found) = self.locate_in(child, rest, find_pseudo_dirs) {
                        return Some(found);
                    }
                }
            }
        }

        if let Some(attic) = payload.attic {
            if find_pseudo_dirs && rest == ATTIC_NAME {
                return Some(attic);
            }

            // The attic is transparent for paths: search its members as if
            // they were ordinary children.
            if let Some(found) = self.locate_in_attic(attic, rest, find_pseudo_dirs) {
                return Some(found);
            }
        }

        None
    }

    fn locate_in_attic(&self, attic: NodeId, rest: &str, find_pseudo_dirs: bool) -> Option<NodeId> {
        for &child in self.children(attic) {
            if let Some(found) = self.locate_in(child, rest, find_pseudo_dirs) {
                return Some(found);
            }
        }

        if let Some(dot) = self.dot_entry(attic) {
            if !rest.contains('/') {
                for &child in self.children(dot) {
                    if let Some(found) = self.locate_in(child, rest, find_pseudo_dirs) {
                        return Some(found);
                    }
                }
            }
        }

        None
    }

    // ── sorting ─────────────────────────────────────────────────

    /// Children of `parent` (including a dot entry) sorted by the given
    /// column with an ascending-name tie break. The result is cached per
    /// directory until a child changes.
    pub fn sorted_children(
        &mut self,
        parent: NodeId,
        column: SortColumn,
        order: SortOrder,
    ) -> Vec<NodeId> {
        let Some(payload) = self.node(parent).payload() else {
            error!("sorted_children on non-directory {}", self.debug_url(parent));
            return Vec::new();
        };

        if let Some(cache) = &payload.sort_cache {
            if cache.column == column && cache.order == order {
                return cache.children.clone();
            }
        }

        let mut list: Vec<NodeId> = payload.children.clone();
        list.extend(payload.dot_entry);

        {
            let tree = &*self;

            // Secondary key first: stable sorts keep it as the tie break.
            if column != SortColumn::Name {
                list.sort_by(|&a, &b| tree.compare_names(a, b));
            }

            list.sort_by(|&a, &b| {
                let ordering = tree.compare_column(column, a, b);
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }

        let result = list.clone();
        let payload = self.node_mut(parent).payload_mut().expect("dir parent");
        payload.sort_cache = Some(SortCache {
            column,
            order,
            children: list,
        });

        result
    }

    fn compare_names(&self, a: NodeId, b: NodeId) -> std::cmp::Ordering {
        let a_name = self.node(a).name.to_lowercase();
        let b_name = self.node(b).name.to_lowercase();
        a_name.cmp(&b_name)
    }

    fn compare_column(&self, column: SortColumn, a: NodeId, b: NodeId) -> std::cmp::Ordering {
        use SortColumn::*;

        match column {
            Name => self.compare_names(a, b),
            Size => self.total_size(a).cmp(&self.total_size(b)),
            AllocatedSize => self.total_allocated(a).cmp(&self.total_allocated(b)),
            TotalItems => self.total_items(a).cmp(&self.total_items(b)),
            TotalFiles => self.total_files(a).cmp(&self.total_files(b)),
            TotalSubDirs => self.total_subdirs(a).cmp(&self.total_subdirs(b)),
            LatestMtime => self.latest_mtime(a).cmp(&self.latest_mtime(b)),
            User => self.node(a).uid.cmp(&self.node(b).uid),
            Group => self.node(a).gid.cmp(&self.node(b).gid),
            Permissions => (self.node(a).mode & 0o7777).cmp(&(self.node(b).mode & 0o7777)),
            ReadJobs => self.pending_read_jobs(a).cmp(&self.pending_read_jobs(b)),
        }
    }

    fn drop_sort_cache_unless(payload: &mut DirPayload, column: SortColumn) {
        if payload
            .sort_cache
            .as_ref()
            .map(|c| c.column != column)
            .unwrap_or(false)
        {
            payload.sort_cache = None;
        }
    }

    fn drop_sort_cache_if(payload: &mut DirPayload, column: SortColumn) {
        if payload
            .sort_cache
            .as_ref()
            .map(|c| c.column == column)
            .unwrap_or(false)
        {
            payload.sort_cache = None;
        }
    }

    // ── refresh-set normalization ───────────────────────────────

    /// Drop stale ids and any node that is a descendant of another node
    /// in the set, so a refresh never scans the same subtree twice.
    pub fn normalized(&self, ids: &[NodeId]) -> Vec<NodeId> {
        let valid: Vec<NodeId> = ids.iter().copied().filter(|&id| self.is_valid(id)).collect();

        valid
            .iter()
            .copied()
            .filter(|&id| {
                !valid
                    .iter()
                    .any(|&other| other != id && self.is_in_subtree(id, other))
            })
            .collect()
    }
}

/// Collapse runs of slashes and strip a trailing one; cache files and
/// user input may contain both.
pub fn clean_path(path: &str) -> String {
    let mut clean = String::with_capacity(path.len());
    let mut last_was_slash = false;

    for ch in path.chars() {
        if ch == '/' {
            if !last_was_slash {
                clean.push(ch);
            }
            last_was_slash = true;
        } else {
            clean.push(ch);
            last_was_slash = false;
        }
    }

    if clean.len() > 1 && clean.ends_with('/') {
        clean.pop();
    }

    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn file(name: &str, size: u64) -> Node {
        Node::file_from_cache(name, libc::S_IFREG | 0o644, size, 0, Some(0), Some(0), None, 1)
    }

    fn file_mtime(name: &str, size: u64, mtime: i64) -> Node {
        Node::file_from_cache(name, libc::S_IFREG | 0o644, size, mtime, Some(0), Some(0), None, 1)
    }

    fn dir(name: &str) -> Node {
        Node::dir_from_cache(name, libc::S_IFDIR | 0o755, 0, 0, Some(0), Some(0))
    }

    /// A small fixture:
    ///   /top
    ///     a.txt (100)  b.txt (200)      (via dot entry)
    ///     sub/
    ///       c.txt (50)
    fn fixture() -> (Tree, NodeId, NodeId) {
        let mut tree = Tree::new(None);
        let top = tree.insert_child(tree.root(), dir("/top"));
        tree.insert_child(top, file("a.txt", 100));
        tree.insert_child(top, file_mtime("b.txt", 200, 99));
        let sub = tree.insert_child(top, dir("sub"));
        tree.insert_child(sub, file("c.txt", 50));
        (tree, top, sub)
    }

    #[test]
    fn files_route_into_dot_entry() {
        let (tree, top, _) = fixture();

        let dot = tree.dot_entry(top).expect("dot entry created lazily");
        assert_eq!(tree.children(dot).len(), 2);
        // Subdirectories stay in the direct children list.
        assert_eq!(tree.children(top).len(), 1);
        assert!(tree.node(dot).is_dot_entry());
    }

    #[test]
    fn aggregates_roll_up() {
        let (tree, top, sub) = fixture();

        assert_eq!(tree.total_size(top), 350);
        assert_eq!(tree.total_size(sub), 50);
        assert_eq!(tree.total_items(top), 4); // 3 files + 1 dir; pseudo dirs don't count
        assert_eq!(tree.total_files(top), 3);
        assert_eq!(tree.total_subdirs(top), 1);
        assert_eq!(tree.latest_mtime(top), 99);
        // dot entry + sub
        assert_eq!(tree.direct_children_count(top), 2);
    }

    #[test]
    fn incremental_and_recalc_agree() {
        let (tree, top, _) = fixture();

        let incremental = (
            tree.total_size(top),
            tree.total_items(top),
            tree.total_files(top),
            tree.total_subdirs(top),
            tree.latest_mtime(top),
            tree.direct_children_count(top),
        );

        tree.node(top).payload().unwrap().summary_dirty.set(true);
        let recomputed = (
            tree.total_size(top),
            tree.total_items(top),
            tree.total_files(top),
            tree.total_subdirs(top),
            tree.latest_mtime(top),
            tree.direct_children_count(top),
        );

        assert_eq!(incremental, recomputed);
    }

    #[test]
    fn hardlink_contribution() {
        let mut tree = Tree::new(None);
        let top = tree.insert_child(tree.root(), dir("/top"));
        let mut linked = file("shared", 1024);
        linked.links = 4;
        tree.insert_child(top, linked);

        assert_eq!(tree.total_size(top), 256);
    }

    #[test]
    fn attic_excluded_from_sums() {
        let (mut tree, top, _) = fixture();
        let before = tree.total_size(top);

        tree.insert_ignored(top, file("ignored.core", 10_000));

        assert_eq!(tree.total_size(top), before);
        assert_eq!(tree.total_items(top), 4);

        let attic = tree.attic(top).expect("attic created");
        assert_eq!(tree.total_size(attic), 10_000);
        assert!(tree.node(tree.children(tree.dot_entry(attic).unwrap())[0]).is_ignored);

        // Recalc must agree with the incremental path.
        tree.node(top).payload().unwrap().summary_dirty.set(true);
        assert_eq!(tree.total_size(top), before);
    }

    #[test]
    fn url_and_locate() {
        let (tree, top, sub) = fixture();

        assert_eq!(tree.url(top), "/top");
        assert_eq!(tree.url(sub), "/top/sub");

        let dot = tree.dot_entry(top).unwrap();
        assert_eq!(tree.url(dot), "/top");
        assert_eq!(tree.debug_url(dot), "/top/<Files>");

        assert_eq!(tree.locate("/top", false), Some(top));
        assert_eq!(tree.locate("/top/sub", false), Some(sub));
        // Files inside the dot entry resolve transparently.
        let a = tree.locate("/top/a.txt", false).expect("file found");
        assert_eq!(tree.node(a).name, "a.txt");
        assert_eq!(tree.locate("/top/<Files>", true), Some(dot));
        assert_eq!(tree.locate("/top/nothere", false), None);
        // Multi-slash urls are cleaned first.
        assert_eq!(tree.locate("/top//sub", false), Some(sub));
    }

    #[test]
    fn locate_finds_attic_members() {
        let (mut tree, top, _) = fixture();
        tree.insert_ignored(top, file("hidden.bak", 5));
        let attic = tree.attic(top).unwrap();

        let found = tree.locate("/top/hidden.bak", false).expect("attic member");
        assert_eq!(tree.node(found).name, "hidden.bak");
        assert_eq!(tree.locate("/top/<Ignored>", true), Some(attic));
    }

    #[test]
    fn finalize_prunes_solo_dot_entry() {
        let mut tree = Tree::new(None);
        let top = tree.insert_child(tree.root(), dir("/top"));
        tree.insert_child(top, file("a", 10));
        tree.insert_child(top, file("b", 20));

        assert!(tree.dot_entry(top).is_some());
        let before = tree.total_size(top);

        tree.finalize_local(top);

        // No subdirectories: files now live directly under the dir.
        assert!(tree.dot_entry(top).is_none());
        assert_eq!(tree.children(top).len(), 2);
        assert_eq!(tree.total_size(top), before);
        assert_eq!(tree.direct_children_count(top), 2);

        for &child in tree.children(top) {
            assert_eq!(tree.node(child).parent, Some(top));
        }
    }

    #[test]
    fn finalize_keeps_dot_entry_with_subdirs() {
        let (mut tree, top, _) = fixture();
        tree.finalize_local(top);

        // There is a subdirectory, so the dot entry stays.
        assert!(tree.dot_entry(top).is_some());
    }

    #[test]
    fn finalize_removes_empty_dot_entry() {
        let (mut tree, top, sub) = fixture();
        let dot = tree.dot_entry(top).unwrap();

        let doomed: Vec<NodeId> = tree.children(dot).to_vec();
        for child in doomed {
            tree.delete_subtree(child);
        }

        tree.finalize_local(top);
        assert!(tree.dot_entry(top).is_none());
        assert_eq!(tree.children(top), &[sub]);
    }

    #[test]
    fn delete_subtree_updates_parent() {
        let (mut tree, top, sub) = fixture();
        let before_items = tree.total_items(top);

        tree.delete_subtree(sub);

        assert!(!tree.is_valid(sub));
        assert_eq!(tree.total_items(top), before_items - 2);
        assert_eq!(tree.children(top).len(), 0);
        assert_eq!(tree.total_size(top), 300);
    }

    #[test]
    fn stale_ids_detected_and_slots_reused() {
        let (mut tree, top, _) = fixture();
        let doomed = tree.insert_child(top, dir("doomed"));

        tree.delete_subtree(doomed);
        assert!(matches!(tree.get(doomed), Err(TreeError::InvalidNode)));

        // The freed slot is recycled for the next insertion.
        let reused = tree.insert_child(top, dir("again"));
        assert_eq!(reused, doomed);
        assert_eq!(tree.node(reused).name, "again");
        assert!(tree.get(reused).is_ok());
    }

    #[test]
    fn checked_aggregates_reject_stale_ids() {
        let (mut tree, top, sub) = fixture();

        assert_eq!(tree.try_total_size(sub).unwrap(), 50);

        tree.delete_subtree(sub);
        assert!(matches!(tree.try_total_size(sub), Err(TreeError::InvalidNode)));
        assert!(matches!(tree.try_total_items(sub), Err(TreeError::InvalidNode)));

        // Re-locating by url is the sanctioned recovery.
        assert_eq!(tree.locate("/top/sub", false), None);
        assert_eq!(tree.try_total_size(top).unwrap(), 300);
    }

    #[test]
    fn deletion_events() {
        let (tx, mut rx) = unbounded_channel();
        let mut tree = Tree::new(Some(tx));
        let top = tree.insert_child(tree.root(), dir("/top"));
        let sub = tree.insert_child(top, dir("sub"));

        while rx.try_recv().is_ok() {}

        tree.delete_subtree(sub);

        match rx.try_recv() {
            Ok(TreeEvent::DeletingChild { node, url }) => {
                assert_eq!(node, sub);
                assert_eq!(url, "/top/sub");
            }
            other => panic!("expected DeletingChild, got {other:?}"),
        }
    }

    #[test]
    fn read_job_accounting() {
        let (mut tree, top, sub) = fixture();

        tree.read_job_added(sub);
        assert_eq!(tree.pending_read_jobs(sub), 1);
        assert_eq!(tree.pending_read_jobs(top), 1);
        assert_eq!(tree.pending_read_jobs(tree.root()), 1);
        assert!(tree.is_busy(top));

        tree.read_job_finished(sub);
        assert_eq!(tree.pending_read_jobs(top), 0);
    }

    #[test]
    fn aborted_not_overwritten_by_finished() {
        let (mut tree, _, sub) = fixture();

        tree.read_job_aborted(sub);
        assert_eq!(tree.read_state(sub), ReadState::Aborted);

        tree.set_read_state(sub, ReadState::Finished);
        assert_eq!(tree.read_state(sub), ReadState::Aborted);

        // An explicit refresh may override it again.
        tree.set_read_state(sub, ReadState::Queued);
        assert_eq!(tree.read_state(sub), ReadState::Queued);
    }

    #[test]
    fn pseudo_dirs_delegate_read_state() {
        let (mut tree, top, _) = fixture();
        tree.set_read_state(top, ReadState::Reading);

        let dot = tree.dot_entry(top).unwrap();
        assert_eq!(tree.read_state(dot), ReadState::Reading);
    }

    #[test]
    fn sorted_children_by_size() {
        let (mut tree, top, sub) = fixture();
        let dot = tree.dot_entry(top).unwrap();

        let sorted = tree.sorted_children(top, SortColumn::Size, SortOrder::Descending);
        // dot entry total: 300, sub: 50
        assert_eq!(sorted, vec![dot, sub]);

        // Cached: asking again yields the same sequence.
        let again = tree.sorted_children(top, SortColumn::Size, SortOrder::Descending);
        assert_eq!(sorted, again);

        // A new child invalidates the cache.
        let big = tree.insert_child(top, dir("big"));
        tree.insert_child(big, file("huge", 10_000));
        let resorted = tree.sorted_children(top, SortColumn::Size, SortOrder::Descending);
        assert_eq!(resorted, vec![big, dot, sub]);
    }

    #[test]
    fn sorted_children_name_tie_break() {
        let mut tree = Tree::new(None);
        let top = tree.insert_child(tree.root(), dir("/top"));
        tree.insert_child(top, file("zeta", 100));
        tree.insert_child(top, file("alpha", 100));
        tree.insert_child(top, file("mid", 100));
        tree.finalize_local(top); // files become direct children

        let sorted = tree.sorted_children(top, SortColumn::Size, SortOrder::Ascending);
        let names: Vec<&str> = sorted.iter().map(|&id| tree.node(id).name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn normalized_drops_descendants_and_stale() {
        let (mut tree, top, sub) = fixture();
        let normalized = tree.normalized(&[top, sub]);
        assert_eq!(normalized, vec![top]);

        tree.delete_subtree(sub);
        let normalized = tree.normalized(&[sub]);
        assert!(normalized.is_empty());
    }

    #[test]
    fn tree_level_is_iterative() {
        let (tree, top, sub) = fixture();
        assert_eq!(tree.tree_level(tree.root()), 0);
        assert_eq!(tree.tree_level(top), 1);
        assert_eq!(tree.tree_level(sub), 2);
    }

    #[test]
    fn subtree_percent_share() {
        let (tree, _, sub) = fixture();
        let percent = tree.subtree_percent(sub).expect("percent available");
        assert!((percent - 100.0 * 50.0 / 350.0).abs() < 0.01);
    }

    #[test]
    fn percent_unavailable_while_busy() {
        let (mut tree, top, sub) = fixture();
        tree.read_job_added(top);
        assert!(tree.subtree_percent(sub).is_none());
    }

    #[test]
    fn clean_path_collapses_slashes() {
        assert_eq!(clean_path("/a//b///c"), "/a/b/c");
        assert_eq!(clean_path("/a/b/"), "/a/b");
        assert_eq!(clean_path("/"), "/");
    }

    #[test]
    fn clear_dir_resets() {
        let (mut tree, top, sub) = fixture();
        tree.reset_dir(top);

        assert!(!tree.is_valid(sub));
        assert!(tree.children(top).is_empty());
        assert!(tree.dot_entry(top).is_none());
        assert_eq!(tree.read_state(top), ReadState::Queued);
        assert_eq!(tree.total_size(top), 0);
    }
}
