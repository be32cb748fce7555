//! Cooperative directory scanner and read-job queue.
//!
//! There are no threads here: a zero-period tick from the surrounding
//! event loop pulls the head job off the ready queue and runs one unit
//! of work — a whole directory read for a local job, one bounded chunk
//! for a cache replay. Between units control returns to the caller so
//! observers can drain change notifications.
//!
//! Jobs run FIFO. A job that must wait for an out-of-band event sits in
//! the blocked list until `unblock` moves it to the ready tail. The
//! tree-level `Finished` fires once both lists are empty.

use std::collections::VecDeque;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::cache::{CacheError, CacheReadJob, CacheReader, DEFAULT_CACHE_NAME};
use crate::core::exclude::{ExcludeRules, IgnoreFilters};
use crate::core::mounts::MountTable;
use crate::core::node::{Node, NodeId, ReadState};
use crate::core::tree::{Tree, TreeEvent};

// ───────────────────────────────────────── errors ────────────

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{call}({path}) failed: {source}")]
    SysCallFailed {
        call: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

// ───────────────────────────────────────── scan context ──────

/// Everything the scanner consults while walking: policies owned by the
/// application, borrowed for the duration of a call.
pub struct ScanContext<'a> {
    pub mounts: &'a MountTable,
    pub excludes: &'a ExcludeRules,
    pub ignores: &'a IgnoreFilters,
    pub cross_filesystems: bool,
}

// ───────────────────────────────────────── jobs ──────────────

/// One queued unit of traversal work.
pub enum ReadJob {
    /// Read one directory's entries completely.
    LocalDir { dir: NodeId },
    /// Replay a cache file chunk by chunk.
    Cache(CacheReadJob),
}

impl ReadJob {
    /// The directory whose pending-job accounting this job hangs off.
    pub fn dir(&self) -> NodeId {
        match self {
            ReadJob::LocalDir { dir } => *dir,
            ReadJob::Cache(job) => job.dir(),
        }
    }
}

// ───────────────────────────────────────── scanner ───────────

/// The read-job queue plus scan orchestration.
pub struct Scanner {
    ready: VecDeque<ReadJob>,
    blocked: Vec<ReadJob>,
    busy: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            blocked: Vec::new(),
            busy: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.blocked.is_empty()
    }

    pub fn job_count(&self) -> usize {
        self.ready.len() + self.blocked.len()
    }

    // ── starting a scan ─────────────────────────────────────────

    /// Start reading at `path` (expected to be absolute). The start
    /// entry becomes the first toplevel; a plain file finishes the scan
    /// immediately.
    pub fn start(
        &mut self,
        tree: &mut Tree,
        ctx: &ScanContext,
        path: &Path,
    ) -> Result<(), ScanError> {
        let url = path.to_string_lossy().into_owned();

        info!("Starting scan of {url}");

        let device = ctx
            .mounts
            .find_nearest(&url)
            .map(|m| m.device().to_string())
            .unwrap_or_default();
        debug!("Scan root device: {device}");

        if tree.has_children(tree.root()) {
            tree.clear();
        }
        tree.set_device(device);

        let meta = std::fs::symlink_metadata(path).map_err(|source| ScanError::SysCallFailed {
            call: "lstat",
            path: url.clone(),
            source,
        })?;

        self.busy = true;
        tree.emit(TreeEvent::StartingRead(tree.root()));

        if meta.is_dir() {
            let dir = tree.insert_child(tree.root(), Node::dir_from_metadata(&url, &meta));
            self.enqueue_local(tree, dir);
        } else {
            tree.insert_child(tree.root(), Node::file_from_metadata(&url, &meta));
            self.busy = false;
            tree.emit(TreeEvent::ReadJobFinished(tree.root()));
            tree.emit(TreeEvent::Finished);
        }

        Ok(())
    }

    /// Populate the tree from a cache file instead of scanning.
    pub fn start_cache(&mut self, tree: &mut Tree, path: &Path) -> Result<(), ScanError> {
        if tree.has_children(tree.root()) {
            tree.clear();
        }

        let reader = CacheReader::open(path, None)?;

        self.busy = true;
        tree.emit(TreeEvent::StartingRead(tree.root()));
        self.enqueue_cache(tree, CacheReadJob::new(reader, tree.root()));

        Ok(())
    }

    /// Re-scan a set of nodes. The set is normalized first; refreshing a
    /// toplevel (or anything above it) restarts the whole scan.
    pub fn refresh(
        &mut self,
        tree: &mut Tree,
        ctx: &ScanContext,
        ids: &[NodeId],
    ) -> Result<(), ScanError> {
        let normalized = tree.normalized(ids);

        for id in normalized {
            // Pseudo dirs and plain files refresh their owning directory.
            let mut target = id;
            loop {
                let node = tree.node(target);
                if node.is_dir_kind() && !node.is_pseudo_dir() {
                    break;
                }
                match node.parent {
                    Some(parent) => target = parent,
                    None => break,
                }
            }

            if target == tree.root() || tree.is_toplevel(target) {
                let url = tree.url_of_tree();
                return self.start(tree, ctx, Path::new(&url));
            }

            if tree.has_children(target) {
                tree.emit(TreeEvent::ClearingSubtree(target));
                tree.clear_dir(target);
                tree.emit(TreeEvent::SubtreeCleared(target));
            }

            tree.reset_dir(target);

            self.busy = true;
            tree.set_read_state(target, ReadState::Reading);
            tree.emit(TreeEvent::StartingRead(target));
            self.enqueue_local(tree, target);
        }

        Ok(())
    }

    // ── the tick ────────────────────────────────────────────────

    /// Run one unit of work. Returns false once both queues are empty
    /// (after emitting `Finished` exactly once per scan).
    pub fn tick(&mut self, tree: &mut Tree, ctx: &ScanContext) -> bool {
        if self.ready.is_empty() {
            if !self.blocked.is_empty() {
                return true; // waiting for an unblock
            }
            if self.busy {
                self.busy = false;
                tree.emit(TreeEvent::Finished);
            }
            return false;
        }

        match self.ready.pop_front().expect("checked non-empty") {
            ReadJob::Cache(mut job) => {
                if job.read_chunk(tree, ctx.excludes) {
                    tree.read_job_finished(job.dir());
                } else {
                    // Not done yet: the cache job stays at the head so its
                    // chunks replay in order.
                    self.ready.push_front(ReadJob::Cache(job));
                }
            }
            ReadJob::LocalDir { dir } => self.read_local_dir(tree, ctx, dir),
        }

        if self.is_empty() {
            if self.busy {
                self.busy = false;
                tree.emit(TreeEvent::Finished);
            }
            return false;
        }

        true
    }

    /// Abort the scan: every queued job's directory (and its ancestors)
    /// goes to `Aborted`, the queues drain, `Aborted` fires once.
    pub fn abort(&mut self, tree: &mut Tree) {
        if self.is_empty() {
            return;
        }

        for job in self.ready.iter().chain(self.blocked.iter()) {
            if tree.is_valid(job.dir()) {
                tree.read_job_aborted(job.dir());
            }
        }

        for job in self.ready.drain(..).chain(self.blocked.drain(..)) {
            if tree.is_valid(job.dir()) {
                tree.read_job_finished(job.dir());
            }
        }

        self.busy = false;
        tree.emit(TreeEvent::Aborted);
    }

    // ── queue management ────────────────────────────────────────

    fn enqueue_local(&mut self, tree: &mut Tree, dir: NodeId) {
        tree.read_job_added(dir);
        self.ready.push_back(ReadJob::LocalDir { dir });
    }

    fn enqueue_cache(&mut self, tree: &mut Tree, job: CacheReadJob) {
        tree.read_job_added(job.dir());
        self.ready.push_back(ReadJob::Cache(job));
    }

    /// Park a job that needs an out-of-band event before it can run.
    pub fn add_blocked(&mut self, tree: &mut Tree, job: ReadJob) {
        tree.read_job_added(job.dir());
        self.blocked.push(job);
    }

    /// The event a blocked job was waiting for arrived: move it to the
    /// ready queue's tail.
    pub fn unblock(&mut self, dir: NodeId) {
        let mut index = 0;

        while index < self.blocked.len() {
            if self.blocked[index].dir() == dir {
                let job = self.blocked.remove(index);
                self.ready.push_back(job);
            } else {
                index += 1;
            }
        }
    }

    /// Drop every queued job whose directory lies in `subtree`.
    fn kill_subtree(&mut self, tree: &mut Tree, subtree: NodeId) {
        let mut kept = VecDeque::new();

        for job in self.ready.drain(..) {
            if tree.is_valid(job.dir()) && tree.is_in_subtree(job.dir(), subtree) {
                debug!("Killing read job for {}", tree.debug_url(job.dir()));
                tree.read_job_finished(job.dir());
            } else {
                kept.push_back(job);
            }
        }
        self.ready = kept;

        let mut kept = Vec::new();
        for job in self.blocked.drain(..) {
            if tree.is_valid(job.dir()) && tree.is_in_subtree(job.dir(), subtree) {
                tree.read_job_finished(job.dir());
            } else {
                kept.push(job);
            }
        }
        self.blocked = kept;
    }

    // ── the local read unit ─────────────────────────────────────

    /// One unit of work: read all entries of one directory, create child
    /// nodes, queue jobs for subdirectories.
    fn read_local_dir(&mut self, tree: &mut Tree, ctx: &ScanContext, dir: NodeId) {
        let url = tree.url(dir);

        let entries = match std::fs::read_dir(&url) {
            Ok(entries) => entries,
            Err(err) => {
                // opendir gives little detail; record the error and move on.
                warn!("opendir({url}) failed: {err}");
                tree.set_read_state(dir, ReadState::Error);
                Self::finish_reading(tree, dir);
                tree.read_job_finished(dir);
                return;
            }
        };

        tree.set_read_state(dir, ReadState::Reading);
        tree.emit(TreeEvent::StartingRead(dir));

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();

            let full = if url.ends_with('/') {
                format!("{url}{name}")
            } else {
                format!("{url}/{name}")
            };

            match std::fs::symlink_metadata(&full) {
                Ok(meta) if meta.is_dir() => {
                    self.process_subdir(tree, ctx, dir, &name, &full, &meta);
                }
                Ok(meta) => {
                    if name == DEFAULT_CACHE_NAME && meta.is_file() {
                        if self.try_cache_takeover(tree, dir, &full) {
                            // This job is gone, and so is its directory.
                            return;
                        }
                        // A cache file for some other directory is not
                        // worth showing as content.
                    } else if ctx.ignores.matches(&full, &name) {
                        tree.insert_ignored(dir, Node::file_from_metadata(&name, &meta));
                    } else {
                        tree.insert_child(dir, Node::file_from_metadata(&name, &meta));
                    }
                }
                Err(err) => {
                    warn!("lstat({full}) failed: {err}");

                    // Keep a placeholder so the incomplete read is visible.
                    let child = tree.insert_child(dir, Node::placeholder_dir(&name));
                    tree.finalize_local(child);
                    tree.set_read_state(child, ReadState::Error);
                }
            }
        }

        tree.set_read_state(dir, ReadState::Finished);
        Self::finish_reading(tree, dir);
        tree.read_job_finished(dir);
    }

    fn process_subdir(
        &mut self,
        tree: &mut Tree,
        ctx: &ScanContext,
        parent: NodeId,
        name: &str,
        full: &str,
        meta: &std::fs::Metadata,
    ) {
        let node = Node::dir_from_metadata(name, meta);

        let sub = if ctx.ignores.matches(full, name) {
            // Ignored directories live (and get scanned) in the attic;
            // the attic boundary keeps them out of the outer sums.
            tree.insert_ignored(parent, node)
        } else {
            tree.insert_child(parent, node)
        };

        if ctx.excludes.matches(full, name) {
            tree.node_mut(sub).is_excluded = true;
            tree.set_read_state(sub, ReadState::OnRequestOnly);
            Self::finish_reading(tree, sub);
            return;
        }

        if !crossing_filesystems(tree, ctx.mounts, parent, sub) {
            self.enqueue_local(tree, sub);
            return;
        }

        // The subdirectory we just found is a mount point.
        tree.node_mut(sub).is_mount_point = true;

        if ctx.cross_filesystems {
            self.enqueue_local(tree, sub);
        } else {
            tree.set_read_state(sub, ReadState::OnRequestOnly);
            Self::finish_reading(tree, sub);
        }
    }

    /// A `.qdirstat.cache.gz` whose first directory is the one being
    /// scanned replaces this whole read: drop the queued jobs below,
    /// delete the partial subtree and let a cache job rebuild it under
    /// the parent.
    fn try_cache_takeover(&mut self, tree: &mut Tree, dir: NodeId, cache_path: &str) -> bool {
        let dir_url = tree.url(dir);
        let path = Path::new(cache_path);

        let Some(first_dir) = CacheReader::first_dir(path) else {
            warn!("Can't make sense of cache file {cache_path}");
            return false;
        };

        if first_dir != dir_url {
            warn!("NOT using cache file {cache_path} with dir {first_dir} for {dir_url}");
            return false;
        }

        let parent = tree.node(dir).parent.unwrap_or_else(|| tree.root());

        let reader = match CacheReader::open(path, Some(parent)) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("Not using cache file {cache_path}: {err}");
                return false;
            }
        };

        debug!("Using cache file {cache_path} for {dir_url}");

        self.kill_subtree(tree, dir);
        tree.set_read_state(parent, ReadState::Reading);
        self.enqueue_cache(tree, CacheReadJob::new(reader, parent));

        // Retire this job, then drop everything it produced so far.
        tree.read_job_finished(dir);
        tree.delete_subtree(dir);

        true
    }

    /// Post-read notifications for one directory, in the observable
    /// order: finalize_local before read_job_finished.
    fn finish_reading(tree: &mut Tree, dir: NodeId) {
        tree.finalize_local(dir);
        tree.emit(TreeEvent::ReadJobFinished(dir));
    }
}

// ───────────────────────────────────────── mount boundary ────

/// Is the child on a different filesystem than its parent? A differing
/// device id alone is not enough: bind mounts and btrfs subvolumes show
/// a new id for the same backing device, so the mount table's device
/// names get the final say.
pub(crate) fn crossing_filesystems(
    tree: &Tree,
    mounts: &MountTable,
    parent: NodeId,
    child: NodeId,
) -> bool {
    if tree.node(parent).device == tree.node(child).device {
        return false;
    }

    let child_device = mounts
        .find_by_path(&tree.url(child))
        .map(|m| m.device().to_string());

    let parent_device = tree
        .find_nearest_mount_point(parent)
        .and_then(|mp| mounts.find_by_path(&tree.url(mp)))
        .map(|m| m.device().to_string())
        .or_else(|| {
            let device = tree.device();
            (!device.is_empty()).then(|| device.to_string())
        });

    let crossing = match (&parent_device, &child_device) {
        (Some(parent_device), Some(child_device)) => parent_device != child_device,
        _ => true,
    };

    if crossing {
        info!(
            "File system boundary at mount point {} on device {}",
            tree.url(child),
            child_device.as_deref().unwrap_or("<unknown>")
        );
    } else {
        info!(
            "Mount point {} is still on the same device {}",
            tree.url(child),
            child_device.as_deref().unwrap_or("<unknown>")
        );
    }

    crossing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::ReadState;
    use crate::core::tree::TreeEvent;
    use std::collections::HashSet;
    use std::fs;
    use std::io::Write as _;
    use tokio::sync::mpsc::unbounded_channel;

    fn ctx<'a>(
        mounts: &'a MountTable,
        excludes: &'a ExcludeRules,
        ignores: &'a IgnoreFilters,
    ) -> ScanContext<'a> {
        ScanContext {
            mounts,
            excludes,
            ignores,
            cross_filesystems: false,
        }
    }

    fn scan(tree: &mut Tree, scanner: &mut Scanner, ctx: &ScanContext, path: &Path) {
        scanner.start(tree, ctx, path).expect("scan start");
        while scanner.tick(tree, ctx) {}
    }

    fn write_file(path: &Path, len: usize) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(&vec![b'x'; len]).unwrap();
    }

    #[test]
    fn scan_builds_tree_with_correct_sums() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        write_file(&base.join("a.dat"), 1000);
        write_file(&base.join("b.dat"), 2000);
        fs::create_dir(base.join("sub")).unwrap();
        write_file(&base.join("sub/c.dat"), 4000);

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        let top = tree.first_toplevel().expect("toplevel");
        assert_eq!(tree.url(top), base.to_string_lossy());
        assert_eq!(tree.read_state(top), ReadState::Finished);
        assert_eq!(tree.pending_read_jobs(top), 0);
        assert_eq!(tree.total_files(top), 3);
        assert_eq!(tree.total_subdirs(top), 1);

        // Own dir sizes vary by filesystem; file bytes must be included.
        let files_total = 1000 + 2000 + 4000;
        assert!(tree.total_size(top) >= files_total as u64);

        let sub = tree.locate(&format!("{}/sub", base.display()), false).unwrap();
        assert_eq!(tree.read_state(sub), ReadState::Finished);
        // Only files below: finalize reparented them, no dot entry left.
        assert!(tree.dot_entry(sub).is_none());
        assert_eq!(tree.children(sub).len(), 1);
    }

    #[test]
    fn event_ordering_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        write_file(&base.join("f"), 10);
        fs::create_dir(base.join("d")).unwrap();

        let (tx, mut rx) = unbounded_channel();
        let mut tree = Tree::new(Some(tx));
        let mut scanner = Scanner::new();

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);
        scan(&mut tree, &mut scanner, &ctx, &base);

        let top = tree.first_toplevel().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        let pos = |event: &TreeEvent| events.iter().position(|e| e == event);

        let starting = pos(&TreeEvent::StartingRead(top)).expect("starting_read");
        let finalize = pos(&TreeEvent::FinalizeLocal(top)).expect("finalize_local");
        let finished_job = pos(&TreeEvent::ReadJobFinished(top)).expect("read_job_finished");

        assert!(starting < finalize);
        assert!(finalize < finished_job);

        // child_added for direct children lands between the two.
        for (i, event) in events.iter().enumerate() {
            if let TreeEvent::ChildAdded(child) = event {
                if tree.is_valid(*child) && tree.node(*child).parent == Some(top) {
                    assert!(i > starting && i < finalize);
                }
            }
        }

        // Tree-level finished fires exactly once.
        let finished_count = events.iter().filter(|e| **e == TreeEvent::Finished).count();
        assert_eq!(finished_count, 1);
    }

    #[test]
    fn excluded_dir_stays_on_request_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir(base.join("skipme")).unwrap();
        write_file(&base.join("skipme/big.dat"), 100_000);
        write_file(&base.join("kept.dat"), 100);

        let mounts = MountTable::default();
        let excludes = ExcludeRules::from_specs(["skipme"]);
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        let skipme = tree
            .locate(&format!("{}/skipme", base.display()), false)
            .expect("excluded dir still in tree");
        assert!(tree.node(skipme).is_excluded);
        assert_eq!(tree.read_state(skipme), ReadState::OnRequestOnly);
        assert_eq!(tree.total_items(skipme), 0);
        assert_eq!(tree.pending_read_jobs(skipme), 0);
    }

    #[test]
    fn ignored_entries_route_to_attic() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        write_file(&base.join("keep.txt"), 500);
        write_file(&base.join("noise.log"), 9000);

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::from_specs(["*.log"]);
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        let top = tree.first_toplevel().unwrap();
        let attic = tree.attic(top).expect("attic holds the ignored file");

        assert_eq!(tree.total_files(top), 1);
        assert!(tree.total_size(top) < 9000);
        assert_eq!(tree.total_size(attic), 9000);

        let noise = tree
            .locate(&format!("{}/noise.log", base.display()), false)
            .expect("ignored file locatable");
        assert!(tree.node(noise).is_ignored);
    }

    #[test]
    fn cache_drop_in_mid_scan() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir(base.join("b")).unwrap();
        write_file(&base.join("b/real_on_disk.txt"), 123);
        write_file(&base.join("outside.txt"), 42);

        // Hand-write a cache describing /b with different content and
        // plant it inside b.
        let b_url = format!("{}/b", base.display());
        let cache_path = base.join("b").join(DEFAULT_CACHE_NAME);
        {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            let f = fs::File::create(&cache_path).unwrap();
            let mut gz = GzEncoder::new(f, Compression::default());
            write!(
                gz,
                "[qdirstat 2.0 cache file]\nD {}\t0\t0 0 0755\t0x0\nF\tfrom_cache.txt\t4K\t0 0 0644\t0x0\n",
                crate::core::cache::url_encode(&b_url)
            )
            .unwrap();
            gz.finish().unwrap();
        }

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        // The subtree for b came from the cache, not from disk.
        let b = tree.locate(&b_url, false).expect("b exists");
        assert_eq!(tree.read_state(b), ReadState::Cached);
        assert!(tree.locate(&format!("{b_url}/from_cache.txt"), false).is_some());
        assert!(tree.locate(&format!("{b_url}/real_on_disk.txt"), false).is_none());

        // Content outside b still came from disk.
        assert!(tree
            .locate(&format!("{}/outside.txt", base.display()), false)
            .is_some());

        // No dangling read jobs anywhere.
        assert_eq!(tree.pending_read_jobs(tree.root()), 0);
    }

    #[test]
    fn abort_marks_all_queued_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        for i in 0..5 {
            fs::create_dir(base.join(format!("d{i}"))).unwrap();
            write_file(&base.join(format!("d{i}/f.dat")), 100);
        }

        let (tx, mut rx) = unbounded_channel();
        let mut tree = Tree::new(Some(tx));
        let mut scanner = Scanner::new();

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        scanner.start(&mut tree, &ctx, &base).unwrap();
        // One tick reads the base dir and enqueues the five subdir jobs.
        scanner.tick(&mut tree, &ctx);
        assert_eq!(scanner.job_count(), 5);

        scanner.abort(&mut tree);

        let top = tree.first_toplevel().unwrap();
        assert_eq!(tree.read_state(top), ReadState::Aborted);
        assert_eq!(tree.pending_read_jobs(tree.root()), 0);
        assert_eq!(tree.pending_read_jobs(top), 0);

        let mut aborted_dirs = HashSet::new();
        for &child in tree.children(top) {
            assert_eq!(tree.read_state(child), ReadState::Aborted);
            aborted_dirs.insert(child);
        }
        assert_eq!(aborted_dirs.len(), 5);

        let mut aborted_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event == TreeEvent::Aborted {
                aborted_events += 1;
            }
        }
        assert_eq!(aborted_events, 1);

        // A tick after abort does nothing.
        assert!(!scanner.tick(&mut tree, &ctx));
    }

    #[test]
    fn hardlinked_file_counted_once_per_link() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        write_file(&base.join("original"), 1024);
        fs::hard_link(base.join("original"), base.join("second")).unwrap();

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        let top = tree.first_toplevel().unwrap();
        let original = tree
            .locate(&format!("{}/original", base.display()), false)
            .unwrap();
        assert_eq!(tree.node(original).links, 2);
        assert_eq!(tree.node(original).size(), 512);

        // Both links together contribute the full size exactly once.
        let own_dir_size = tree.node(top).size();
        assert_eq!(tree.total_size(top), own_dir_size + 1024);
    }

    #[test]
    fn start_on_missing_path_fails() {
        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        let result = scanner.start(&mut tree, &ctx, Path::new("/no/such/path/anywhere"));

        assert!(matches!(result, Err(ScanError::SysCallFailed { call: "lstat", .. })));
    }

    #[test]
    fn scan_of_plain_file_finishes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        write_file(&base.join("only.dat"), 77);

        let (tx, mut rx) = unbounded_channel();
        let mut tree = Tree::new(Some(tx));
        let mut scanner = Scanner::new();

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        scanner.start(&mut tree, &ctx, &base.join("only.dat")).unwrap();
        assert!(!scanner.is_busy());

        let top = tree.first_toplevel().unwrap();
        assert!(tree.node(top).is_file());
        assert_eq!(tree.node(top).byte_size(), 77);

        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            if event == TreeEvent::Finished {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[test]
    fn blocked_jobs_defer_completion() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir(base.join("later")).unwrap();
        write_file(&base.join("later/file"), 10);

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();

        // Insert the dir by hand and park its job in the blocked list.
        let meta = fs::symlink_metadata(&base).unwrap();
        let top = tree.insert_child(
            tree.root(),
            Node::dir_from_metadata(&base.to_string_lossy(), &meta),
        );
        let later_meta = fs::symlink_metadata(base.join("later")).unwrap();
        let later = tree.insert_child(top, Node::dir_from_metadata("later", &later_meta));

        scanner.busy = true;
        scanner.add_blocked(&mut tree, ReadJob::LocalDir { dir: later });

        // Blocked only: the tick waits without finishing.
        assert!(scanner.tick(&mut tree, &ctx));
        assert!(scanner.is_busy());
        assert_eq!(tree.pending_read_jobs(later), 1);

        scanner.unblock(later);
        while scanner.tick(&mut tree, &ctx) {}

        assert!(!scanner.is_busy());
        assert_eq!(tree.read_state(later), ReadState::Finished);
        assert_eq!(tree.pending_read_jobs(top), 0);
    }

    #[test]
    fn refresh_rescans_a_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir(base.join("sub")).unwrap();
        write_file(&base.join("sub/first"), 100);

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        let sub = tree.locate(&format!("{}/sub", base.display()), false).unwrap();
        assert_eq!(tree.total_files(sub), 1);

        // The filesystem changes, then the subtree is refreshed.
        write_file(&base.join("sub/second"), 200);
        scanner.refresh(&mut tree, &ctx, &[sub]).unwrap();
        while scanner.tick(&mut tree, &ctx) {}

        let sub = tree.locate(&format!("{}/sub", base.display()), false).unwrap();
        assert_eq!(tree.total_files(sub), 2);
        assert_eq!(tree.read_state(sub), ReadState::Finished);
        assert_eq!(tree.pending_read_jobs(tree.root()), 0);
    }

    #[test]
    fn refresh_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir(base.join("sub")).unwrap();
        write_file(&base.join("sub/data"), 1234);
        write_file(&base.join("other"), 55);

        let mounts = MountTable::default();
        let excludes = ExcludeRules::new();
        let ignores = IgnoreFilters::new();
        let ctx = ctx(&mounts, &excludes, &ignores);

        let mut tree = Tree::new(None);
        let mut scanner = Scanner::new();
        scan(&mut tree, &mut scanner, &ctx, &base);

        let snapshot = |tree: &mut Tree| {
            let sub = tree.locate(&format!("{}/sub", base.display()), false).unwrap();
            (
                tree.total_size(sub),
                tree.total_items(sub),
                tree.total_files(sub),
                tree.latest_mtime(sub),
            )
        };

        let sub = tree.locate(&format!("{}/sub", base.display()), false).unwrap();
        scanner.refresh(&mut tree, &ctx, &[sub]).unwrap();
        while scanner.tick(&mut tree, &ctx) {}
        let first = snapshot(&mut tree);

        let sub = tree.locate(&format!("{}/sub", base.display()), false).unwrap();
        scanner.refresh(&mut tree, &ctx, &[sub]).unwrap();
        while scanner.tick(&mut tree, &ctx) {}
        let second = snapshot(&mut tree);

        assert_eq!(first, second);
    }

    #[test]
    fn crossing_check_consults_mount_table() {
        let mounts = MountTable::parse(
            "/dev/sda1 / ext4 rw 0 0\n\
             /dev/sda1 /mnt/bind ext4 rw 0 0\n\
             /dev/sdb1 /mnt/other ext4 rw 0 0\n",
            HashSet::new(),
        );

        let mut tree = Tree::new(None);
        let mut root_dir = Node::dir_from_cache("/", libc::S_IFDIR | 0o755, 0, 0, Some(0), Some(0));
        root_dir.device = 1;
        let top = tree.insert_child(tree.root(), root_dir);
        tree.set_device("/dev/sda1".to_string());

        let mut bind = Node::dir_from_cache("mnt", libc::S_IFDIR | 0o755, 0, 0, Some(0), Some(0));
        bind.device = 1;
        let mnt = tree.insert_child(top, bind);

        // Same device id: never a crossing.
        assert!(!crossing_filesystems(&tree, &mounts, top, mnt));

        // Different device id but same device name (bind mount).
        let mut bind2 = Node::dir_from_cache("bind", libc::S_IFDIR | 0o755, 0, 0, Some(0), Some(0));
        bind2.device = 2;
        let bind2 = tree.insert_child(mnt, bind2);
        assert!(!crossing_filesystems(&tree, &mounts, mnt, bind2));

        // Different device id and different device name: crossing.
        let mut other = Node::dir_from_cache("other", libc::S_IFDIR | 0o755, 0, 0, Some(0), Some(0));
        other.device = 3;
        let other = tree.insert_child(mnt, other);
        assert!(crossing_filesystems(&tree, &mounts, mnt, other));
    }
}
