//! Cache file reader and writer.
//!
//! A cache file is a gzip-compressed, line-oriented ASCII snapshot of a
//! scanned tree. The writer serializes depth-first pre-order: a directory
//! line, then its file children, then its subdirectories. The reader is
//! re-entrant across units of work (at most N lines per call) and can
//! graft its decoded subtree into an existing tree below an anchor
//! directory, which is how the mid-scan cache drop-in works.
//!
//! Two format versions exist: 2.0 carries uid/gid/permissions between the
//! size and mtime fields, 1.0 does not. Both are read; 2.0 is written
//! whenever the tree knows its owners.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, error};

use crate::core::exclude::ExcludeRules;
use crate::core::node::{Node, NodeId, ReadState};
use crate::core::tree::{clean_path, Tree, TreeEvent};

/// Conventional cache file name the scanner watches out for.
pub const DEFAULT_CACHE_NAME: &str = ".qdirstat.cache.gz";

/// The reader gives up after this many syntax/consistency errors.
const MAX_ERROR_COUNT: u32 = 1000;

/// Lines replayed per unit of work.
pub const CACHE_READ_CHUNK: usize = 1000;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

// ───────────────────────────────────────── errors ────────────

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("can't open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: unknown cache file format")]
    BadHeader { path: PathBuf, line: usize },

    #[error("{path}:{line}: incompatible cache file version")]
    BadVersion { path: PathBuf, line: usize },

    #[error("cannot write a cache for an empty tree")]
    EmptyTree,
}

// ───────────────────────────────────────── writer ────────────

/// Serializes a tree to a gzip-compressed cache file.
pub struct CacheWriter {
    with_uid_gid_perm: bool,
}

impl CacheWriter {
    /// Write the whole tree (from the first toplevel) to `path`.
    /// Version 2.0 is emitted when the toplevel knows its uid, 1.0
    /// otherwise (a tree itself restored from a v1.0 cache).
    pub fn write(tree: &Tree, path: &Path) -> Result<(), CacheError> {
        let toplevel = tree.first_toplevel().ok_or(CacheError::EmptyTree)?;
        Self::write_subtree(tree, toplevel, path)
    }

    /// Write one subtree to `path`.
    pub fn write_subtree(tree: &Tree, subtree: NodeId, path: &Path) -> Result<(), CacheError> {
        let file = File::create(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut out = GzEncoder::new(BufWriter::new(file), Compression::default());

        let writer = CacheWriter {
            with_uid_gid_perm: tree.node(subtree).has_uid(),
        };

        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        writer.write_header(&mut out).map_err(io_err)?;
        writer.write_node(&mut out, tree, subtree).map_err(io_err)?;
        out.finish().map_err(io_err)?;

        Ok(())
    }

    fn write_header(&self, out: &mut impl Write) -> std::io::Result<()> {
        let version = if self.with_uid_gid_perm { "2.0" } else { "1.0" };
        writeln!(out, "[qdirstat {version} cache file]")?;
        writeln!(out, "# Do not edit!")?;
        writeln!(out, "#")?;

        if self.with_uid_gid_perm {
            writeln!(
                out,
                "# Type  path                            size     uid   gid  perm.       mtime      <optional fields>"
            )?;
        } else {
            writeln!(
                out,
                "# Type  path                            size    mtime      <optional fields>"
            )?;
        }

        writeln!(out, "#")
    }

    /// Pre-order: this item, then its file children, then subdirectories.
    fn write_node(&self, out: &mut impl Write, tree: &Tree, id: NodeId) -> std::io::Result<()> {
        if !tree.node(id).is_dot_entry() {
            self.write_item(out, tree, id)?;
        }

        if let Some(dot) = tree.dot_entry(id) {
            self.write_node(out, tree, dot)?;
        }

        for &child in tree.children(id) {
            self.write_node(out, tree, child)?;
        }

        Ok(())
    }

    fn write_item(&self, out: &mut impl Write, tree: &Tree, id: NodeId) -> std::io::Result<()> {
        let node = tree.node(id);

        let is_dir_line = node.is_dir_kind() && !node.is_pseudo_dir();

        let file_type = if is_dir_line {
            "D"
        } else if node.is_file() {
            "F"
        } else if node.is_symlink() {
            "L"
        } else if crate::core::format::is_block_device(node.mode) {
            "BlockDev"
        } else if crate::core::format::is_char_device(node.mode) {
            "CharDev"
        } else if crate::core::format::is_fifo(node.mode) {
            "FIFO"
        } else if crate::core::format::is_socket(node.mode) {
            "Socket"
        } else {
            "F"
        };

        write!(out, "{file_type}")?;

        if is_dir_line {
            // Directories re-anchor with their absolute path.
            write!(out, " {:<30}", url_encode(&tree.url(id)))?;
        } else {
            // Everything else is relative to the last directory line.
            write!(out, "\t{:<24}", url_encode(&node.name))?;
        }

        write!(out, "\t{}", format_size_field(node.byte_size()))?;

        if self.with_uid_gid_perm {
            write!(
                out,
                "\t{}  {}  0{:o}",
                node.uid.unwrap_or(0),
                node.gid.unwrap_or(0),
                node.mode & 0o7777
            )?;
        }

        write!(out, "\t0x{:x}", node.mtime as u64)?;

        if node.is_sparse {
            write!(out, "\tblocks: {}", node.blocks())?;
        }

        if node.is_file() && node.links > 1 {
            write!(out, "\tlinks: {}", node.links)?;
        }

        writeln!(out)
    }
}

// ───────────────────────────────────────── reader ────────────

/// Incremental cache decoder. One [`read`](CacheReader::read) call
/// consumes a bounded number of lines; [`finalize`](CacheReader::finalize)
/// runs once the stream is exhausted.
pub struct CacheReader {
    path: PathBuf,
    input: BufReader<GzDecoder<File>>,
    line_no: usize,
    ok: bool,
    eof: bool,
    error_count: u32,
    with_uid_gid_perm: bool,
    /// The node the decoded subtree is grafted under ("anchor"); for a
    /// standalone read this becomes the first directory created.
    toplevel: Option<NodeId>,
    last_dir: Option<NodeId>,
    last_excluded_url: Option<String>,
}

impl CacheReader {
    /// Open a cache file and check its header. `anchor` is the node the
    /// decoded subtree will be grafted under (None for a fresh tree).
    pub fn open(path: &Path, anchor: Option<NodeId>) -> Result<Self, CacheError> {
        let file = File::open(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut reader = Self {
            path: path.to_path_buf(),
            input: BufReader::new(GzDecoder::new(file)),
            line_no: 0,
            ok: true,
            eof: false,
            error_count: 0,
            with_uid_gid_perm: false,
            toplevel: anchor,
            last_dir: None,
            last_excluded_url: None,
        };

        reader.check_header()?;
        Ok(reader)
    }

    /// Peek at the first directory a cache file declares, without
    /// touching any tree. The scanner uses this to decide whether a cache
    /// file found mid-scan actually describes the directory it sits in.
    pub fn first_dir(path: &Path) -> Option<String> {
        let mut reader = Self::open(path, None).ok()?;

        while let Some(line) = reader.next_line() {
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields.len() < 2 {
                return None;
            }
            if fields[0].eq_ignore_ascii_case("D") {
                return Some(clean_path(&url_decode(fields[1])));
            }
        }

        None
    }

    pub fn is_done(&self) -> bool {
        self.eof || !self.ok
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Replay at most `max_lines` data lines into the tree. Returns true
    /// while there is more to read.
    pub fn read(&mut self, tree: &mut Tree, excludes: &ExcludeRules, max_lines: usize) -> bool {
        let mut count = 0;

        while count < max_lines && !self.is_done() {
            match self.next_line() {
                Some(line) => {
                    self.add_item(tree, excludes, &line);
                    count += 1;
                }
                None => break,
            }
        }

        !self.is_done()
    }

    /// Walk the decoded subtree bottom-up: every directory that is not
    /// `OnRequestOnly` and has no read error becomes `Cached`, gets its
    /// dot entry pruned and a `read_job_finished` notification.
    pub fn finalize(&self, tree: &mut Tree) {
        debug!("Cache reading finished for {}", self.path.display());

        if let Some(toplevel) = self.toplevel {
            self.finalize_recursive(tree, toplevel);
        }
    }

    fn finalize_recursive(&self, tree: &mut Tree, dir: NodeId) {
        let children: Vec<NodeId> = tree.children(dir).to_vec();

        for child in children {
            let node = tree.node(child);
            if node.is_dir_kind() && !node.is_pseudo_dir() {
                self.finalize_recursive(tree, child);
            }
        }

        if tree.node(dir).is_root() {
            return;
        }

        let state = tree.read_state(dir);

        if state != ReadState::OnRequestOnly {
            if state != ReadState::Error {
                tree.set_read_state(dir, ReadState::Cached);
            }

            tree.finalize_local(dir);
            tree.emit(TreeEvent::ReadJobFinished(dir));
        }
    }

    // ── line input ──────────────────────────────────────────────

    /// Next data line, skipping blanks and comments. Returns None at EOF
    /// or on a read error (which is fatal for the whole decode).
    fn next_line(&mut self) -> Option<String> {
        loop {
            let mut line = String::new();
            self.line_no += 1;

            match self.input.read_line(&mut line) {
                Ok(0) => {
                    self.eof = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    error!("{}:{}: read error: {err}", self.path.display(), self.line_no);
                    self.ok = false;
                    return None;
                }
            }

            let trimmed = line.trim();

            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                return Some(trimmed.to_string());
            }
        }
    }

    fn check_header(&mut self) -> Result<(), CacheError> {
        let Some(line) = self.next_line() else {
            return Err(CacheError::BadHeader {
                path: self.path.clone(),
                line: self.line_no,
            });
        };

        // Accept   [qdirstat <version> cache file]
        // or       [kdirstat <version> cache file]
        let fields: Vec<&str> = line.split_whitespace().collect();

        let shape_ok = fields.len() == 4
            && (fields[0] == "[qdirstat" || fields[0] == "[kdirstat")
            && fields[2] == "cache"
            && fields[3] == "file]";

        if !shape_ok {
            self.ok = false;
            return Err(CacheError::BadHeader {
                path: self.path.clone(),
                line: self.line_no,
            });
        }

        match fields[1].parse::<f32>() {
            Ok(version) => {
                self.with_uid_gid_perm = version > 1.99;
                Ok(())
            }
            Err(_) => {
                self.ok = false;
                Err(CacheError::BadVersion {
                    path: self.path.clone(),
                    line: self.line_no,
                })
            }
        }
    }

    // ── item decoding ───────────────────────────────────────────

    fn add_item(&mut self, tree: &mut Tree, excludes: &ExcludeRules, line: &str) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let expected = if self.with_uid_gid_perm { 7 } else { 4 };

        if fields.len() < expected {
            error!(
                "{}:{}: expected at least {expected} fields, saw {}",
                self.path.display(),
                self.line_no,
                fields.len()
            );
            self.set_read_error(tree, self.last_dir);
            self.count_error(tree);
            return;
        }

        let mut n = 0;
        let type_str = fields[n];
        n += 1;
        let raw_path = fields[n];
        n += 1;
        let size_str = fields[n];
        n += 1;

        let (uid_str, gid_str, perm_str) = if self.with_uid_gid_perm {
            let triple = (fields[n], fields[n + 1], fields[n + 2]);
            n += 3;
            (Some(triple.0), Some(triple.1), Some(triple.2))
        } else {
            (None, None, None)
        };

        let mtime_str = fields[n];
        n += 1;

        // Optional trailing key/value pairs.
        let mut blocks: Option<u64> = None;
        let mut links: u64 = 1;

        while n + 1 < fields.len() {
            let keyword = fields[n];
            let value = fields[n + 1];
            n += 2;

            if keyword.eq_ignore_ascii_case("blocks:") {
                blocks = value.parse().ok();
            } else if keyword.eq_ignore_ascii_case("links:") {
                links = value.parse().unwrap_or(1);
            }
        }

        let type_mode = match type_str.to_ascii_uppercase().as_str() {
            "F" => libc::S_IFREG,
            "D" => libc::S_IFDIR,
            "L" => libc::S_IFLNK,
            "BLOCKDEV" => libc::S_IFBLK,
            "CHARDEV" => libc::S_IFCHR,
            "FIFO" => libc::S_IFIFO,
            "SOCKET" => libc::S_IFSOCK,
            _ => libc::S_IFREG,
        };

        let Some(size) = parse_size_field(size_str) else {
            error!(
                "{}:{}: malformed size {size_str:?}",
                self.path.display(),
                self.line_no
            );
            self.set_read_error(tree, self.last_dir);
            self.count_error(tree);
            return;
        };

        let uid = uid_str.and_then(|s| s.parse::<u32>().ok());
        let gid = gid_str.and_then(|s| s.parse::<u32>().ok());
        let perm = perm_str
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .unwrap_or(0);
        let mode = type_mode | perm;

        let Some(mtime) = parse_mtime(mtime_str) else {
            error!(
                "{}:{}: malformed mtime {mtime_str:?}",
                self.path.display(),
                self.line_no
            );
            self.set_read_error(tree, self.last_dir);
            self.count_error(tree);
            return;
        };

        let full_path = clean_path(&url_decode(raw_path));
        let is_absolute = full_path.starts_with('/');
        let (path, name) = split_path(&full_path);

        // Everything below an excluded directory is skipped wholesale;
        // relative entries right after the excluded line belong to it too.
        if let Some(excluded) = &self.last_excluded_url {
            if is_absolute {
                if path == *excluded || path.starts_with(&format!("{excluded}/")) {
                    return;
                }
            } else if self.last_dir.is_none() {
                return;
            }
        }

        let parent = self.find_parent(tree, is_absolute, &path);

        let Some(parent) = parent else {
            error!(
                "{}:{}: could not locate parent {path:?} for {name}",
                self.path.display(),
                self.line_no
            );
            self.count_error(tree);
            return;
        };

        if type_str.eq_ignore_ascii_case("D") {
            // A directory directly under the invisible root keeps its
            // whole absolute path as its name.
            let node_name = if parent == tree.root() { full_path.as_str() } else { name };

            let dir = tree.insert_child(
                parent,
                Node::dir_from_cache(node_name, mode, size, mtime, uid, gid),
            );
            self.last_dir = Some(dir);

            if self.toplevel.is_none() {
                self.toplevel = Some(dir);
            }

            if Some(dir) != self.toplevel {
                let url = tree.url(dir);

                if excludes.matches(&url, name) {
                    debug!("Excluding {url} while reading cache");
                    tree.node_mut(dir).is_excluded = true;
                    tree.set_read_state(dir, ReadState::OnRequestOnly);
                    tree.finalize_local(dir);
                    tree.emit(TreeEvent::ReadJobFinished(dir));

                    self.last_excluded_url = Some(url);
                    self.last_dir = None;
                }
            }
        } else {
            tree.insert_child(
                parent,
                Node::file_from_cache(name, mode, size, mtime, uid, gid, blocks, links),
            );
        }
    }

    /// Parent lookup: the most recent directory if it matches, then the
    /// anchor's subtree, then the whole tree. An empty tree accepts the
    /// first directory directly under the root.
    fn find_parent(&self, tree: &Tree, is_absolute: bool, path: &str) -> Option<NodeId> {
        if !is_absolute {
            return self.last_dir;
        }

        if let Some(last) = self.last_dir {
            if tree.url(last) == path {
                return Some(last);
            }
        }

        if !tree.has_children(tree.root()) {
            return Some(tree.root());
        }

        if let Some(anchor) = self.toplevel {
            if let Some(found) = locate_under(tree, anchor, path) {
                if tree.node(found).is_dir_kind() {
                    return Some(found);
                }
            }
        }

        tree.locate(path, false).filter(|&id| tree.node(id).is_dir_kind())
    }

    // ── error accounting ────────────────────────────────────────

    /// A consistency error taints the subtree being decoded: set the
    /// `Error` state from `from` up to (and including) the anchor.
    fn set_read_error(&self, tree: &mut Tree, from: Option<NodeId>) {
        let mut current = from.or(self.toplevel);

        while let Some(id) = current {
            if tree.node(id).is_dir_kind() && !tree.node(id).is_root() {
                tree.set_read_state(id, ReadState::Error);
            }

            if Some(id) == self.toplevel {
                return;
            }

            current = tree.node(id).parent;
        }
    }

    fn count_error(&mut self, tree: &mut Tree) {
        self.error_count += 1;

        if self.error_count > MAX_ERROR_COUNT {
            error!("Too many errors in {} - giving up", self.path.display());
            self.ok = false;
            self.set_read_error(tree, self.last_dir);
        }
    }
}

// ───────────────────────────────────────── cache read job ────

/// A queued job replaying a cache file chunk by chunk.
pub struct CacheReadJob {
    reader: CacheReader,
    anchor: NodeId,
}

impl CacheReadJob {
    pub fn new(reader: CacheReader, anchor: NodeId) -> Self {
        Self { reader, anchor }
    }

    /// The directory this job's pending-read accounting hangs off.
    pub fn dir(&self) -> NodeId {
        self.anchor
    }

    /// One unit of work. Returns true when the decode is complete (EOF
    /// or fatal error) and the job should be retired.
    pub fn read_chunk(&mut self, tree: &mut Tree, excludes: &ExcludeRules) -> bool {
        self.reader.read(tree, excludes, CACHE_READ_CHUNK);

        if self.reader.is_done() {
            self.reader.finalize(tree);
            true
        } else {
            false
        }
    }

    pub fn ok(&self) -> bool {
        self.reader.ok()
    }
}

// ───────────────────────────────────────── field helpers ─────

/// Shortest exact suffixed form: "4K" for 4096, plain decimal otherwise.
pub fn format_size_field(size: u64) -> String {
    for (unit, suffix) in [(TB, 'T'), (GB, 'G'), (MB, 'M'), (KB, 'K')] {
        if size >= unit && size % unit == 0 {
            return format!("{}{suffix}", size / unit);
        }
    }

    size.to_string()
}

/// Decimal with an optional K/M/G/T suffix (powers of 1024).
pub fn parse_size_field(field: &str) -> Option<u64> {
    let digits_end = field
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(field.len());

    if digits_end == 0 {
        return None;
    }

    let value: u64 = field[..digits_end].parse().ok()?;

    let multiplier = match &field[digits_end..] {
        "" => 1,
        "K" => KB,
        "M" => MB,
        "G" => GB,
        "T" => TB,
        _ => 1,
    };

    Some(value * multiplier)
}

/// Mtime in the cache is hexadecimal with a 0x prefix; plain decimal and
/// octal (leading 0) are accepted as well.
fn parse_mtime(field: &str) -> Option<i64> {
    if let Some(hex) = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }

    if field.len() > 1 && field.starts_with('0') {
        return i64::from_str_radix(&field[1..], 8).ok();
    }

    field.parse().ok()
}

/// Split "/a/b/c" into ("/a/b", "c"); a bare name yields ("", name).
fn split_path(full_path: &str) -> (String, &str) {
    match full_path.rfind('/') {
        None => (String::new(), full_path),
        Some(0) => ("/".to_string(), &full_path[1..]),
        Some(pos) => (full_path[..pos].to_string(), &full_path[pos + 1..]),
    }
}

/// Resolve an absolute path inside the subtree below `anchor`.
fn locate_under(tree: &Tree, anchor: NodeId, path: &str) -> Option<NodeId> {
    if tree.node(anchor).is_root() {
        return None;
    }

    let anchor_url = tree.url(anchor);

    if path == anchor_url {
        return Some(anchor);
    }

    let rest = path.strip_prefix(&format!("{anchor_url}/"))?;

    for &child in tree.children(anchor) {
        if let Some(found) = tree.locate_in(child, rest, false) {
            return Some(found);
        }
    }

    None
}

// ───────────────────────────────────────── url escaping ──────

/// Percent-encode a path byte-wise; specials including space become %NN.
pub fn url_encode(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());

    for byte in path.bytes() {
        let keep = byte.is_ascii_alphanumeric() || b"/-._~+@:,=".contains(&byte);

        if keep {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    encoded
}

/// Decode %NN escapes; malformed escapes pass through verbatim.
pub fn url_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3);
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(value);
                i += 3;
                continue;
            }
        }

        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
