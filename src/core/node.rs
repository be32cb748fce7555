//! The node type of the directory tree.
//!
//! One [`Node`] per filesystem object, holding the attributes `lstat`
//! reports plus a tagged [`NodeKind`] that distinguishes plain files from
//! the directory-like variants (real directories, the `<Files>` dot entry,
//! the `<Ignored>` attic, package groups and the invisible root). This is
//! tuned for size rather than speed — a scanned system easily has 150k+
//! of these.

use std::cell::Cell;
use std::os::unix::fs::MetadataExt;

use crate::core::format;

/// Index into the tree arena.
pub type NodeId = usize;

/// Magic sentinel of a live node; freed arena slots get [`NODE_DEAD`].
pub const NODE_MAGIC: u32 = 0x4242;
pub const NODE_DEAD: u32 = 0xDEAD;

/// 512-byte block unit reported by `lstat`.
pub const BLOCK_SIZE: u64 = 512;

/// Some filesystems handle block fragments well; a file whose allocation
/// is only this much below its byte size is not considered sparse.
pub const FRAGMENT_TOLERANCE: u64 = 2048;

/// User-visible name of a dot entry.
pub const DOT_ENTRY_NAME: &str = "<Files>";

/// User-visible name of an attic.
pub const ATTIC_NAME: &str = "<Ignored>";

// ───────────────────────────────────────── read state ────────

/// Lifecycle of a directory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting in the read queue.
    Queued,
    /// Reading in progress.
    Reading,
    /// Reading finished without error.
    Finished,
    /// Will only be read upon explicit request (mount points, excluded).
    OnRequestOnly,
    /// Content came from a cache file.
    Cached,
    /// Reading aborted upon user request.
    Aborted,
    /// Error while reading.
    Error,
}

// ───────────────────────────────────────── aggregates ────────

/// Cached subtree sums of a directory-like node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirSums {
    pub total_size: u64,
    pub total_allocated: u64,
    pub total_blocks: u64,
    pub total_items: u32,
    pub total_files: u32,
    pub total_subdirs: u32,
    pub latest_mtime: i64,
    pub direct_children: u32,
}

// ───────────────────────────────────────── sorting ───────────

/// Sort keys for [`sorted_children`](crate::core::tree::Tree::sorted_children).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Name,
    Size,
    AllocatedSize,
    TotalItems,
    TotalFiles,
    TotalSubDirs,
    LatestMtime,
    User,
    Group,
    Permissions,
    ReadJobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// The last (column, order, sequence) triple a directory handed out.
#[derive(Debug)]
pub struct SortCache {
    pub column: SortColumn,
    pub order: SortOrder,
    pub children: Vec<NodeId>,
}

// ───────────────────────────────────────── dir payload ───────

/// State carried by every directory-like node variant.
#[derive(Debug, Default)]
pub struct DirPayload {
    /// Subdirectory children (for dot entries: file children). Order is
    /// implementation-defined; consumers sort on demand.
    pub children: Vec<NodeId>,
    /// Pseudo child holding this directory's non-directory children.
    pub dot_entry: Option<NodeId>,
    /// Pseudo child holding ignored entries, excluded from ancestor sums.
    pub attic: Option<NodeId>,
    /// Cached subtree sums; interior mutability so aggregate reads stay
    /// `&self` for observers and the treemap.
    pub sums: Cell<DirSums>,
    pub summary_dirty: Cell<bool>,
    /// Scheduled or in-flight read jobs in this subtree.
    pub pending_read_jobs: u32,
    pub read_state: ReadState,
    pub sort_cache: Option<SortCache>,
    /// Set once an observer looked at this node (update-hint only).
    pub touched: bool,
}

impl DirPayload {
    fn new(read_state: ReadState) -> Self {
        Self {
            read_state,
            ..Self::default()
        }
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty() || self.dot_entry.is_some()
    }
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Queued
    }
}

// ───────────────────────────────────────── node kind ─────────

/// The variant tag: what kind of tree node this is.
#[derive(Debug)]
pub enum NodeKind {
    /// Any non-directory: regular file, symlink, device, FIFO, socket.
    File,
    /// An ordinary directory.
    Dir(DirPayload),
    /// Pseudo directory collecting the parent's file children.
    DotEntry(DirPayload),
    /// Pseudo directory holding ignored children.
    Attic(DirPayload),
    /// Synthetic grouping node for a software package.
    Pkg(DirPayload),
    /// The invisible tree root.
    Root(DirPayload),
}

// ───────────────────────────────────────── node ──────────────

/// A single tree node: `lstat` attributes plus kind-specific payload.
#[derive(Debug)]
pub struct Node {
    pub(crate) magic: u32,
    /// Last path component only; the first toplevel holds the absolute
    /// start path of the scan.
    pub name: String,
    pub device: u64,
    pub mode: u32,
    pub links: u64,
    /// None when this branch came from a v1.0 cache file.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    byte_size: u64,
    blocks: u64,
    pub mtime: i64,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,

    pub is_sparse: bool,
    pub is_excluded: bool,
    pub is_ignored: bool,
    pub is_mount_point: bool,
    pub from_cache: bool,
}

impl Node {
    fn bare(name: &str, kind: NodeKind) -> Self {
        Self {
            magic: NODE_MAGIC,
            name: name.to_string(),
            device: 0,
            mode: 0,
            links: 0,
            uid: None,
            gid: None,
            byte_size: 0,
            blocks: 0,
            mtime: 0,
            parent: None,
            kind,
            is_sparse: false,
            is_excluded: false,
            is_ignored: false,
            is_mount_point: false,
            from_cache: false,
        }
    }

    /// Non-directory node from an `lstat` result. Special files report
    /// zero size and blocks.
    pub fn file_from_metadata(name: &str, meta: &std::fs::Metadata) -> Self {
        let mode = meta.mode();
        let mut node = Self::bare(name, NodeKind::File);

        node.device = meta.dev();
        node.mode = mode;
        node.links = meta.nlink();
        node.uid = Some(meta.uid());
        node.gid = Some(meta.gid());
        node.mtime = meta.mtime();

        if !format::is_special(mode) {
            node.byte_size = meta.size();
            node.blocks = meta.blocks();
            node.is_sparse = format::is_file(mode)
                && node.blocks > 0
                && node.allocated_size() + FRAGMENT_TOLERANCE < node.byte_size;

            if node.is_sparse {
                tracing::debug!(
                    "Found sparse file: {name}  byte size {}  allocated {}",
                    format::format_size(node.byte_size),
                    format::format_size(node.allocated_size())
                );
            }
        }

        node
    }

    /// Directory node from an `lstat` result; starts out `Queued`.
    pub fn dir_from_metadata(name: &str, meta: &std::fs::Metadata) -> Self {
        let mut node = Self::file_from_metadata(name, meta);
        node.is_sparse = false;
        node.kind = NodeKind::Dir(DirPayload::new(ReadState::Queued));
        node
    }

    /// Non-directory node from the bare fields a cache file carries.
    ///
    /// Without a `blocks` value the block count is synthesized from the
    /// size; an explicit value marks the file sparse.
    pub fn file_from_cache(
        name: &str,
        mode: u32,
        size: u64,
        mtime: i64,
        uid: Option<u32>,
        gid: Option<u32>,
        blocks: Option<u64>,
        links: u64,
    ) -> Self {
        let mut node = Self::bare(name, NodeKind::File);
        node.mode = mode;
        node.byte_size = size;
        node.mtime = mtime;
        node.uid = uid;
        node.gid = gid;
        node.links = links;
        node.from_cache = true;

        match blocks {
            Some(blocks) => {
                node.is_sparse = true;
                node.blocks = blocks;
            }
            None => {
                node.blocks = size.div_ceil(BLOCK_SIZE);
            }
        }

        node
    }

    /// Directory node from cache fields; starts out `Reading` (the cache
    /// reader drives its lifecycle).
    pub fn dir_from_cache(
        name: &str,
        mode: u32,
        size: u64,
        mtime: i64,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Self {
        let mut node = Self::file_from_cache(name, mode, size, mtime, uid, gid, None, 1);
        node.is_sparse = false;
        node.kind = NodeKind::Dir(DirPayload::new(ReadState::Reading));
        node
    }

    /// Placeholder for an entry whose `lstat` failed: an empty directory
    /// that will carry the `Error` read state.
    pub fn placeholder_dir(name: &str) -> Self {
        Self::bare(name, NodeKind::Dir(DirPayload::new(ReadState::Queued)))
    }

    /// A dot entry inherits device, mode, uid and gid from its parent.
    pub fn dot_entry_for(parent: &Node) -> Self {
        let mut node = Self::bare(DOT_ENTRY_NAME, NodeKind::DotEntry(DirPayload::new(ReadState::Finished)));
        node.device = parent.device;
        node.mode = parent.mode;
        node.uid = parent.uid;
        node.gid = parent.gid;
        node
    }

    /// An attic; like a dot entry, it mirrors its parent's identity bits.
    pub fn attic_for(parent: &Node) -> Self {
        let mut node = Self::bare(ATTIC_NAME, NodeKind::Attic(DirPayload::new(ReadState::Finished)));
        node.device = parent.device;
        node.mode = parent.mode;
        node.uid = parent.uid;
        node.gid = parent.gid;
        node
    }

    /// Synthetic package grouping node.
    pub fn pkg(name: &str) -> Self {
        Self::bare(name, NodeKind::Pkg(DirPayload::new(ReadState::Finished)))
    }

    pub(crate) fn root() -> Self {
        Self::bare("", NodeKind::Root(DirPayload::new(ReadState::Finished)))
    }

    // ── kind checks ─────────────────────────────────────────────

    /// True for every directory-like variant (anything with a payload).
    pub fn is_dir_kind(&self) -> bool {
        self.payload().is_some()
    }

    pub fn is_file_kind(&self) -> bool {
        matches!(self.kind, NodeKind::File)
    }

    pub fn is_dot_entry(&self) -> bool {
        matches!(self.kind, NodeKind::DotEntry(_))
    }

    pub fn is_attic(&self) -> bool {
        matches!(self.kind, NodeKind::Attic(_))
    }

    pub fn is_pkg(&self) -> bool {
        matches!(self.kind, NodeKind::Pkg(_))
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root(_))
    }

    /// Dot entries and attics: pseudo directories without a filesystem
    /// counterpart.
    pub fn is_pseudo_dir(&self) -> bool {
        self.is_dot_entry() || self.is_attic()
    }

    pub fn payload(&self) -> Option<&DirPayload> {
        match &self.kind {
            NodeKind::File => None,
            NodeKind::Dir(p)
            | NodeKind::DotEntry(p)
            | NodeKind::Attic(p)
            | NodeKind::Pkg(p)
            | NodeKind::Root(p) => Some(p),
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut DirPayload> {
        match &mut self.kind {
            NodeKind::File => None,
            NodeKind::Dir(p)
            | NodeKind::DotEntry(p)
            | NodeKind::Attic(p)
            | NodeKind::Pkg(p)
            | NodeKind::Root(p) => Some(p),
        }
    }

    // ── mode shortcuts ──────────────────────────────────────────

    pub fn is_dir(&self) -> bool {
        format::is_dir(self.mode) || (self.is_dir_kind() && !self.is_pseudo_dir())
    }

    pub fn is_file(&self) -> bool {
        format::is_file(self.mode)
    }

    pub fn is_symlink(&self) -> bool {
        format::is_symlink(self.mode)
    }

    pub fn is_special(&self) -> bool {
        format::is_special(self.mode)
    }

    // ── sizes ───────────────────────────────────────────────────

    /// Size as reported by `lstat` (what `ls -l` shows).
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// 512-byte blocks.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Bytes actually allocated on the filesystem.
    pub fn allocated_size(&self) -> u64 {
        self.blocks * BLOCK_SIZE
    }

    /// The effective size: allocated size for sparse files, and the byte
    /// size divided by the link count for hard-linked plain files, so one
    /// file on disk never counts more than once in a shared ancestor.
    pub fn size(&self) -> u64 {
        let size = if self.is_sparse {
            self.allocated_size()
        } else {
            self.byte_size
        };

        if self.links > 1 && !self.is_dir() {
            size / self.links
        } else {
            size
        }
    }

    /// Allocated size with the same hard-link split as [`Node::size`].
    pub fn effective_allocated(&self) -> u64 {
        let allocated = self.allocated_size();

        if self.links > 1 && !self.is_dir() {
            allocated / self.links
        } else {
            allocated
        }
    }

    pub fn has_uid(&self) -> bool {
        self.uid.is_some()
    }
}
