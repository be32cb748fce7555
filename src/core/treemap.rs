//! Squarified, cushion-shaded treemap layout.
//!
//! Turns a directory's cached allocated-size totals into a set of
//! non-overlapping rectangles. Children are packed in rows along the
//! short axis of the remaining rectangle while the worst aspect ratio of
//! the row keeps improving; children whose tile would fall below the
//! minimum pixel size are skipped entirely, so the work is proportional
//! to the visible tiles, not to the tree.
//!
//! The layout never mutates the tree: it reads cached totals, the node
//! kind and the child links. Rendering shades each file tile with a
//! quadratic cushion surface lit by a single directed light.

use image::{Rgb, RgbImage};

use crate::core::node::{Node, NodeId};
use crate::core::tree::Tree;

// ───────────────────────────────────────── settings ──────────

#[derive(Debug, Clone)]
pub struct TreemapSettings {
    /// Squarified layout (default) or simple strips.
    pub squarify: bool,
    pub cushion_shading: bool,
    /// Tiles below this many pixels (in either direction) are not laid
    /// out; the parent tile stays visible beneath.
    pub min_tile_size: f64,
    /// Ambient light (0..255) added to the Lambert term.
    pub ambient_light: u8,
    pub light_x: f64,
    pub light_y: f64,
    pub light_z: f64,
    /// Overdraw the right/bottom boundary when a cushion renders flat.
    pub enforce_contrast: bool,
    pub dir_gradient_start: [u8; 3],
    pub dir_gradient_end: [u8; 3],
    pub outline_color: [u8; 3],
}

impl Default for TreemapSettings {
    fn default() -> Self {
        Self {
            squarify: true,
            cushion_shading: true,
            min_tile_size: 3.0,
            ambient_light: 40,
            light_x: 0.09759,
            light_y: 0.19518,
            light_z: 0.9759,
            enforce_contrast: true,
            dir_gradient_start: [0x60, 0x60, 0x70],
            dir_gradient_end: [0x40, 0x40, 0x50],
            outline_color: [0x20, 0x20, 0x20],
        }
    }
}

// ───────────────────────────────────────── geometry ──────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn shorter(&self) -> f64 {
        self.w.min(self.h)
    }

    pub fn longer(&self) -> f64 {
        self.w.max(self.h)
    }

    /// Longer side over shorter side; 1.0 is a perfect square.
    pub fn aspect_ratio(&self) -> f64 {
        if self.shorter() <= 0.0 {
            return f64::INFINITY;
        }
        self.longer() / self.shorter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

// ───────────────────────────────────────── cushions ──────────

/// Per-tile quadratic height field `z = xx2·x² + yy2·y² + xx1·x + yy1·y`.
/// Every row placement adds a perpendicular ridge whose amplitude decays
/// with nesting depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct CushionSurface {
    xx2: f64,
    xx1: f64,
    yy2: f64,
    yy1: f64,
    ridge_count: u32,
}

impl CushionSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ridge(&mut self, dim: Orientation, rect: &Rect) {
        self.ridge_count += 1;

        match dim {
            Orientation::Horizontal => {
                self.xx2 = self.square_ridge(self.xx2, rect.x, rect.x + rect.w);
                self.xx1 = self.linear_ridge(self.xx1, rect.x, rect.x + rect.w);
            }
            Orientation::Vertical => {
                self.yy2 = self.square_ridge(self.yy2, rect.y, rect.y + rect.h);
                self.yy1 = self.linear_ridge(self.yy1, rect.y, rect.y + rect.h);
            }
        }
    }

    fn square_ridge(&self, coefficient: f64, x1: f64, x2: f64) -> f64 {
        if x2 != x1 {
            coefficient - self.ridge_coefficient() / (x2 - x1)
        } else {
            coefficient
        }
    }

    fn linear_ridge(&self, coefficient: f64, x1: f64, x2: f64) -> f64 {
        if x2 != x1 {
            coefficient + self.ridge_coefficient() * (x2 + x1) / (x2 - x1)
        } else {
            coefficient
        }
    }

    /// Ridge amplitude by nesting depth. Regressive factors found by
    /// experimenting with different nesting depths; tuning-grade.
    fn ridge_coefficient(&self) -> f64 {
        match self.ridge_count {
            0..=2 => 1.5,
            3..=4 => 1.3,
            5..=7 => 1.2,
            _ => 1.1,
        }
    }

    pub fn ridge_count(&self) -> u32 {
        self.ridge_count
    }
}

// ───────────────────────────────────────── tiles ─────────────

/// One laid-out rectangle and its subdivision.
#[derive(Debug)]
pub struct Tile {
    pub node: NodeId,
    pub rect: Rect,
    pub cushion: CushionSurface,
    pub children: Vec<Tile>,
}

impl Tile {
    /// Flat iteration over this tile and everything below it.
    pub fn descendants(&self) -> Vec<&Tile> {
        let mut result = Vec::new();
        let mut stack = vec![self];

        while let Some(tile) = stack.pop() {
            result.push(tile);
            stack.extend(tile.children.iter());
        }

        result
    }
}

// ───────────────────────────────────────── layout ────────────

/// Builds a tile hierarchy over a subtree's cached totals.
pub struct TreemapLayout<'a> {
    tree: &'a Tree,
    settings: &'a TreemapSettings,
}

impl<'a> TreemapLayout<'a> {
    pub fn new(tree: &'a Tree, settings: &'a TreemapSettings) -> Self {
        Self { tree, settings }
    }

    /// Lay out `root` (typically a directory) into `rect`. Any node can
    /// become the viewport root; rebuilding from a deeper node zooms in.
    pub fn build(&self, root: NodeId, rect: Rect) -> Tile {
        let mut tile = Tile {
            node: root,
            rect,
            cushion: CushionSurface::new(),
            children: Vec::new(),
        };

        self.create_children(&mut tile);
        tile
    }

    fn create_children(&self, tile: &mut Tile) {
        let node = self.tree.node(tile.node);

        if !node.is_dir_kind() {
            return;
        }

        let total = self.tree.total_allocated(tile.node) as f64;

        if total <= 0.0 || tile.rect.w < 1.0 || tile.rect.h < 1.0 {
            return;
        }

        if self.settings.squarify {
            self.create_squarified_children(tile, total);
        } else {
            self.create_children_simple(tile, total);
        }
    }

    // ── squarified layout ───────────────────────────────────────

    fn create_squarified_children(&self, tile: &mut Tile, total: f64) {
        let rect = tile.rect;
        let scale = rect.w * rect.h / total;
        let min_bytes = if scale > 0.0 {
            self.settings.min_tile_size / scale
        } else {
            0.0
        };

        let items = self.sorted_by_size(tile.node, min_bytes as u64);

        if items.is_empty() {
            return;
        }

        // With a minimum size in effect the skipped children still claim
        // their share of the area, so proportions stay truthful.
        let mut remaining_total = if min_bytes > 0.0 {
            total
        } else {
            items.iter().map(|&(_, size)| size as f64).sum()
        };

        let mut children_rect = rect;
        let mut index = 0;

        while index < items.len() && remaining_total > 0.0 {
            if children_rect.w < 1.0 || children_rect.h < 1.0 {
                break;
            }

            let count = self.squarify(&children_rect, remaining_total, &items[index..]);
            let row = &items[index..index + count];

            children_rect = self.layout_row(tile, children_rect, remaining_total, row);

            for &(_, size) in row {
                remaining_total -= size as f64;
            }
            index += count;
        }
    }

    /// Greedy row accumulation: take children while the worst aspect
    /// ratio of the row's tiles keeps improving. Returns how many items
    /// of `items` form the row (at least one).
    fn squarify(&self, rect: &Rect, remaining_total: f64, items: &[(NodeId, u64)]) -> usize {
        let rect_length = rect.shorter();
        let rect_height = rect.longer();

        if rect_length <= 0.0 || rect_height <= 0.0 {
            return 1;
        }

        let first_scale = items[0].1 as f64 * rect_length;
        let mut best_aspect = 0.0_f64;
        let mut sum = 0.0_f64;
        let mut count = 0;

        for &(_, size) in items {
            let size = size as f64;
            sum += size;

            if size != 0.0 && sum != 0.0 && remaining_total != 0.0 {
                let height = rect_height * sum / remaining_total;
                let first_width = first_scale / sum;
                let last_width = rect_length * size / sum;

                if height != 0.0 && first_width != 0.0 {
                    let aspect = (height / first_width).min(last_width / height);

                    if aspect < best_aspect {
                        break;
                    }
                    best_aspect = aspect;
                }
            }

            count += 1;
        }

        count.max(1)
    }

    /// Close the current row: lay its tiles along the long axis and
    /// return the shrunken remaining rectangle.
    fn layout_row(
        &self,
        tile: &mut Tile,
        rect: Rect,
        remaining_total: f64,
        row: &[(NodeId, u64)],
    ) -> Rect {
        if row.is_empty() {
            return rect;
        }

        // Subdivide along the longer side; the row spans the shorter one.
        let dir = if rect.w < rect.h {
            Orientation::Horizontal
        } else {
            Orientation::Vertical
        };

        let primary = rect.shorter();
        let sum: f64 = row.iter().map(|&(_, size)| size as f64).sum();

        if sum == 0.0 {
            return rect;
        }

        let secondary = (sum * rect.longer() / remaining_total + 0.5).floor();

        if secondary < self.settings.min_tile_size {
            return rect;
        }

        // One perpendicular ridge per row groups its tiles optically.
        let mut row_cushion = tile.cushion;

        match dir {
            Orientation::Horizontal => {
                let row_rect = Rect::new(rect.x, rect.y, primary, secondary);
                row_cushion.add_ridge(Orientation::Vertical, &row_rect);
            }
            Orientation::Vertical => {
                let row_rect = Rect::new(rect.x, rect.y, secondary, primary);
                row_cushion.add_ridge(Orientation::Horizontal, &row_rect);
            }
        }

        let mut offset = 0.0_f64;
        let mut remaining = primary;

        for &(node, size) in row {
            let mut child_size = size as f64 / sum * primary;

            // Accumulated rounding must not overflow the row.
            if child_size > remaining {
                child_size = remaining;
            }
            remaining -= child_size;

            if child_size >= self.settings.min_tile_size {
                let child_rect = match dir {
                    Orientation::Horizontal => {
                        Rect::new(rect.x + offset.round(), rect.y, child_size.ceil(), secondary)
                    }
                    Orientation::Vertical => {
                        Rect::new(rect.x, rect.y + offset.round(), secondary, child_size.ceil())
                    }
                };

                let mut child = Tile {
                    node,
                    rect: child_rect,
                    cushion: row_cushion,
                    children: Vec::new(),
                };
                child.cushion.add_ridge(dir, &child_rect);

                self.create_children(&mut child);
                tile.children.push(child);

                offset += child_size;
            }
        }

        match dir {
            Orientation::Horizontal => Rect::new(rect.x, rect.y + secondary, rect.w, rect.h - secondary),
            Orientation::Vertical => Rect::new(rect.x + secondary, rect.y, rect.w - secondary, rect.h),
        }
    }

    // ── simple strip layout ─────────────────────────────────────

    fn create_children_simple(&self, tile: &mut Tile, total: f64) {
        let rect = tile.rect;
        let dir = if rect.w > rect.h {
            Orientation::Horizontal
        } else {
            Orientation::Vertical
        };
        let child_dir = match dir {
            Orientation::Horizontal => Orientation::Vertical,
            Orientation::Vertical => Orientation::Horizontal,
        };

        let size = match dir {
            Orientation::Horizontal => rect.w,
            Orientation::Vertical => rect.h,
        };
        let scale = size / total;

        tile.cushion.add_ridge(child_dir, &rect);

        let min_bytes = (self.settings.min_tile_size / scale) as u64;
        let items = self.sorted_by_size(tile.node, min_bytes);

        let mut offset = 0.0_f64;

        for (node, item_size) in items {
            let child_size = scale * item_size as f64;

            if child_size >= self.settings.min_tile_size {
                let child_rect = match dir {
                    Orientation::Horizontal => Rect::new(rect.x + offset, rect.y, child_size, rect.h),
                    Orientation::Vertical => Rect::new(rect.x, rect.y + offset, rect.w, child_size),
                };

                let mut child = Tile {
                    node,
                    rect: child_rect,
                    cushion: tile.cushion,
                    children: Vec::new(),
                };
                child.cushion.add_ridge(dir, &child_rect);

                self.create_children(&mut child);
                tile.children.push(child);

                offset += child_size;
            }
        }
    }

    /// Direct children (plus the dot entry) in descending allocated-size
    /// order, with everything below `min_bytes` dropped up front.
    fn sorted_by_size(&self, dir: NodeId, min_bytes: u64) -> Vec<(NodeId, u64)> {
        let mut items: Vec<(NodeId, u64)> = self
            .tree
            .children(dir)
            .iter()
            .copied()
            .chain(self.tree.dot_entry(dir))
            .map(|id| (id, self.tree.total_allocated(id)))
            .filter(|&(_, size)| size >= min_bytes)
            .collect();

        items.sort_by(|a, b| b.1.cmp(&a.1));
        items
    }
}

// ───────────────────────────────────────── rendering ─────────

/// Render a laid-out tile hierarchy into an image of the given size.
pub fn render(tree: &Tree, root: &Tile, settings: &TreemapSettings, width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, Rgb([0x60, 0x60, 0x60]));
    render_tile(tree, root, settings, &mut image);
    image
}

fn render_tile(tree: &Tree, tile: &Tile, settings: &TreemapSettings, image: &mut RgbImage) {
    if tile.rect.w >= 1.0 && tile.rect.h >= 1.0 {
        let node = tree.node(tile.node);

        if node.is_dir_kind() {
            fill_dir_rect(image, &tile.rect, settings);
        } else if settings.cushion_shading {
            render_cushion(image, &tile.rect, &tile.cushion, tile_color(node), settings);
        } else {
            fill_flat(image, &tile.rect, tile_color(node), settings.outline_color);
        }
    }

    for child in &tile.children {
        render_tile(tree, child, settings, image);
    }
}

fn clamp_rect(image: &RgbImage, rect: &Rect) -> (u32, u32, u32, u32) {
    let x0 = rect.x.max(0.0) as u32;
    let y0 = rect.y.max(0.0) as u32;
    let x1 = ((rect.x + rect.w) as u32).min(image.width());
    let y1 = ((rect.y + rect.h) as u32).min(image.height());
    (x0, y0, x1, y1)
}

/// Directories get a diagonal gradient so the hierarchy shows through
/// wherever below-threshold children were skipped.
fn fill_dir_rect(image: &mut RgbImage, rect: &Rect, settings: &TreemapSettings) {
    let (x0, y0, x1, y1) = clamp_rect(image, rect);
    let start = settings.dir_gradient_start;
    let end = settings.dir_gradient_end;
    let span = (rect.w + rect.h).max(1.0);

    for y in y0..y1 {
        for x in x0..x1 {
            let t = ((x as f64 - rect.x) + (y as f64 - rect.y)) / span;
            let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
            image.put_pixel(x, y, Rgb([mix(start[0], end[0]), mix(start[1], end[1]), mix(start[2], end[2])]));
        }
    }
}

fn fill_flat(image: &mut RgbImage, rect: &Rect, color: Rgb<u8>, outline: [u8; 3]) {
    let (x0, y0, x1, y1) = clamp_rect(image, rect);

    for y in y0..y1 {
        for x in x0..x1 {
            let on_edge = x == x0 || y == y0 || x == x1 - 1 || y == y1 - 1;
            image.put_pixel(x, y, if on_edge { Rgb(outline) } else { color });
        }
    }
}

/// Per-pixel Lambert shading of a cushion surface. The surface normal of
/// the quadratic height field is (-dz/dx, -dz/dy, 1), evaluated at the
/// pixel's absolute coordinates.
fn render_cushion(
    image: &mut RgbImage,
    rect: &Rect,
    cushion: &CushionSurface,
    color: Rgb<u8>,
    settings: &TreemapSettings,
) {
    let (x0, y0, x1, y1) = clamp_rect(image, rect);

    if x1 <= x0 || y1 <= y0 {
        return;
    }

    let ambient = settings.ambient_light as f64 / 255.0;
    let diffuse = 1.0 - ambient;
    let light_x = diffuse * settings.light_x;
    let light_y = diffuse * settings.light_y;
    let light_z = diffuse * settings.light_z;

    let xx22 = cushion.xx2 * 2.0;
    let yy22 = cushion.yy2 * 2.0;

    for y in y0..y1 {
        let ny = yy22 * (y as f64 + 0.5) + cushion.yy1;

        for x in x0..x1 {
            let nx = xx22 * (x as f64 + 0.5) + cushion.xx1;

            let mut cosa = (light_z - ny * light_y - nx * light_x)
                / (nx * nx + ny * ny + 1.0).sqrt();

            if cosa < 0.0 {
                cosa = 0.0;
            }
            cosa += ambient;

            let shade = |c: u8| ((cosa * c as f64 + 0.5) as u32).min(255) as u8;
            image.put_pixel(x, y, Rgb([shade(color[0]), shade(color[1]), shade(color[2])]));
        }
    }

    if settings.enforce_contrast {
        enforce_contrast(image, x0, y0, x1, y1);
    }
}

/// If the right or bottom boundary of a tile region came out flat
/// (near-identical edge pixels), overdraw it with a contrasting shade so
/// adjacent tiles stay separable.
fn enforce_contrast(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32) {
    let width = x1 - x0;
    let height = y1 - y0;

    if width > 5 {
        let sample_x1 = x1 - 6;
        let sample_x2 = x1 - 1;
        let interval = (height / 10).max(5);
        let mut same_color: u32 = 0;
        let mut samples: u32 = 0;

        let mut y = y0 + interval;
        while y < y1 {
            if image.get_pixel(sample_x1, y) == image.get_pixel(sample_x2, y) {
                same_color += 1;
            }
            samples += 1;
            y += interval;
        }

        if samples > 0 && same_color * 10 > height {
            let contrast = contrasting_color(*image.get_pixel(sample_x2, y0 + height / 2));
            for y in y0..y1 {
                image.put_pixel(sample_x2, y, contrast);
            }
        }
    }

    if height > 5 {
        let sample_y1 = y1 - 6;
        let sample_y2 = y1 - 1;
        let interval = (width / 10).max(5);
        let mut same_color: u32 = 0;
        let mut samples: u32 = 0;

        let mut x = x0 + interval;
        while x < x1 {
            if image.get_pixel(x, sample_y1) == image.get_pixel(x, sample_y2) {
                same_color += 1;
            }
            samples += 1;
            x += interval;
        }

        if samples > 0 && same_color * 10 > width {
            let contrast = contrasting_color(*image.get_pixel(x0 + width / 2, sample_y2));
            for x in x0..x1 {
                image.put_pixel(x, sample_y2, contrast);
            }
        }
    }
}

fn contrasting_color(color: Rgb<u8>) -> Rgb<u8> {
    let gray = (color[0] as u32 * 30 + color[1] as u32 * 59 + color[2] as u32 * 11) / 100;

    if gray < 128 {
        Rgb([
            color[0].saturating_mul(2),
            color[1].saturating_mul(2),
            color[2].saturating_mul(2),
        ])
    } else {
        Rgb([color[0] / 2, color[1] / 2, color[2] / 2])
    }
}

// ───────────────────────────────────────── base colors ───────

/// Extension-to-color rule table, matched case-insensitively against the
/// last path component's suffix.
const CATEGORIES: &[(&[&str], [u8; 3])] = &[
    // images
    (
        &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff", "ico", "svg", "xcf"],
        [0xCF, 0x5F, 0xCF],
    ),
    // video
    (
        &["mp4", "mkv", "avi", "mov", "webm", "flv", "mpg", "mpeg", "wmv"],
        [0xA0, 0x40, 0xA0],
    ),
    // audio
    (
        &["mp3", "flac", "ogg", "oga", "opus", "wav", "m4a", "wma", "mid"],
        [0xB0, 0x60, 0xE0],
    ),
    // archives & compressed
    (
        &["tar", "gz", "tgz", "bz2", "xz", "zst", "lz4", "zip", "7z", "rar", "deb", "rpm"],
        [0x30, 0xA0, 0x30],
    ),
    // disk images
    (&["iso", "img", "qcow2", "vmdk", "vdi"], [0x20, 0x80, 0x50]),
    // documents
    (
        &["pdf", "ps", "doc", "docx", "odt", "xls", "xlsx", "ods", "ppt", "pptx", "odp", "epub"],
        [0x50, 0x70, 0xD0],
    ),
    // plain text & markup
    (
        &["txt", "md", "rst", "html", "htm", "xml", "json", "yaml", "yml", "toml", "ini", "csv"],
        [0x60, 0x90, 0xC0],
    ),
    // source code
    (
        &[
            "c", "h", "cc", "cpp", "hpp", "rs", "go", "py", "rb", "pl", "sh", "js", "ts", "java",
            "kt", "swift", "hs", "ml", "lua",
        ],
        [0x40, 0xB0, 0xE0],
    ),
    // object and build artifacts
    (
        &["o", "a", "so", "rlib", "obj", "lib", "class", "pyc", "pyo", "ko"],
        [0x88, 0x88, 0x88],
    ),
    // junk
    (&["bak", "old", "tmp", "temp", "swp", "core"], [0x8B, 0x6B, 0x3B]),
];

const COLOR_SYMLINK: [u8; 3] = [0x30, 0xC0, 0xC0];
const COLOR_SPECIAL: [u8; 3] = [0xC0, 0xC0, 0x30];
const COLOR_DEFAULT: [u8; 3] = [0xB0, 0xB0, 0xB0];

/// Base color of a (file) tile, chosen by filename extension.
pub fn tile_color(node: &Node) -> Rgb<u8> {
    if node.is_symlink() {
        return Rgb(COLOR_SYMLINK);
    }
    if node.is_special() {
        return Rgb(COLOR_SPECIAL);
    }

    let extension = node
        .name
        .rsplit_once('.')
        .map(|(stem, ext)| if stem.is_empty() { "" } else { ext })
        .unwrap_or("");

    if !extension.is_empty() {
        let lowered = extension.to_lowercase();

        for (extensions, color) in CATEGORIES {
            if extensions.contains(&lowered.as_str()) {
                return Rgb(*color);
            }
        }
    }

    Rgb(COLOR_DEFAULT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::Node;

    fn file(name: &str, blocks: u64) -> Node {
        // size = blocks * 512 keeps allocated == byte size.
        Node::file_from_cache(
            name,
            libc::S_IFREG | 0o644,
            blocks * 512,
            0,
            Some(0),
            Some(0),
            None,
            1,
        )
    }

    fn dir(name: &str) -> Node {
        Node::dir_from_cache(name, libc::S_IFDIR | 0o755, 0, 0, Some(0), Some(0))
    }

    /// Directory with files whose allocated sizes are proportional to
    /// `weights`, finalized so the files are direct children.
    fn weighted_tree(weights: &[u64]) -> (Tree, NodeId) {
        let mut tree = Tree::new(None);
        let top = tree.insert_child(tree.root(), dir("/map"));

        for (i, &weight) in weights.iter().enumerate() {
            tree.insert_child(top, file(&format!("f{i}"), weight));
        }

        tree.finalize_local(top);
        (tree, top)
    }

    #[test]
    fn squarified_row_closure() {
        let (tree, top) = weighted_tree(&[10, 6, 4, 3, 2, 1]);
        let settings = TreemapSettings::default();
        let layout = TreemapLayout::new(&tree, &settings);

        let root = layout.build(top, Rect::new(0.0, 0.0, 100.0, 60.0));

        assert_eq!(root.children.len(), 6, "no child is below the minimum size");

        // At least two rows: the tiles spread in both dimensions.
        let distinct_x: std::collections::HashSet<i64> =
            root.children.iter().map(|t| t.rect.x as i64).collect();
        let distinct_y: std::collections::HashSet<i64> =
            root.children.iter().map(|t| t.rect.y as i64).collect();
        assert!(distinct_x.len() >= 2);
        assert!(distinct_y.len() >= 2);

        // Squarification keeps every tile near-square; a single strip
        // would degrade the smallest tile to ~15:1 here.
        for tile in &root.children {
            assert!(
                tile.rect.aspect_ratio() <= 2.5,
                "tile {:?} too elongated",
                tile.rect
            );
        }

        // Tiles stay inside the parent rectangle.
        for tile in &root.children {
            assert!(tile.rect.x >= 0.0 && tile.rect.y >= 0.0);
            assert!(tile.rect.x + tile.rect.w <= 101.0);
            assert!(tile.rect.y + tile.rect.h <= 61.0);
        }

        // The area adds up to roughly the full rectangle.
        let area: f64 = root.children.iter().map(|t| t.rect.w * t.rect.h).sum();
        assert!(area > 0.85 * 6000.0 && area < 1.15 * 6000.0, "area {area}");
    }

    #[test]
    fn tiny_children_are_skipped() {
        // One dominant file and a swarm of one-block files in a small
        // rectangle: the swarm falls below the minimum tile size.
        let mut weights = vec![100_000];
        weights.extend(std::iter::repeat(1).take(100));
        let (tree, top) = weighted_tree(&weights);

        let settings = TreemapSettings::default();
        let layout = TreemapLayout::new(&tree, &settings);
        let root = layout.build(top, Rect::new(0.0, 0.0, 64.0, 64.0));

        assert!(root.children.len() < 10, "skipped {} tiles", 101 - root.children.len());
        assert!(!root.children.is_empty());
    }

    #[test]
    fn descending_size_order() {
        let (tree, top) = weighted_tree(&[3, 9, 1, 7]);
        let settings = TreemapSettings::default();
        let layout = TreemapLayout::new(&tree, &settings);

        let items = layout.sorted_by_size(top, 0);
        let sizes: Vec<u64> = items.iter().map(|&(_, s)| s).collect();
        assert_eq!(sizes, vec![9 * 512, 7 * 512, 3 * 512, 512]);
    }

    #[test]
    fn nested_dirs_subdivide() {
        let mut tree = Tree::new(None);
        let top = tree.insert_child(tree.root(), dir("/nest"));
        let inner = tree.insert_child(top, dir("inner"));
        tree.insert_child(inner, file("big", 1000));
        tree.insert_child(top, file("other", 1000));
        tree.finalize_local(inner);

        let settings = TreemapSettings::default();
        let layout = TreemapLayout::new(&tree, &settings);
        let root = layout.build(top, Rect::new(0.0, 0.0, 200.0, 100.0));

        // top -> { inner dir tile, dot entry tile } -> leaves
        let all = root.descendants();
        assert!(all.iter().any(|t| t.node == inner));
        let inner_tile = all.iter().find(|t| t.node == inner).unwrap();
        assert_eq!(inner_tile.children.len(), 1);

        // Leaf file tiles of the inner dir sit inside the inner tile.
        let leaf = &inner_tile.children[0];
        assert!(leaf.rect.x >= inner_tile.rect.x);
        assert!(leaf.rect.x + leaf.rect.w <= inner_tile.rect.x + inner_tile.rect.w + 1.0);
    }

    #[test]
    fn ridge_coefficient_schedule() {
        let mut cushion = CushionSurface::new();
        let rect = Rect::new(0.0, 0.0, 100.0, 100.0);

        // Depth ≤ 2 → 1.5, 3-4 → 1.3, 5-7 → 1.2, deeper → 1.1.
        let expected = [1.5, 1.5, 1.3, 1.3, 1.2, 1.2, 1.2, 1.1, 1.1];

        for &factor in &expected {
            cushion.add_ridge(Orientation::Horizontal, &rect);
            assert_eq!(cushion.ridge_coefficient(), factor);
        }
    }

    #[test]
    fn ridges_change_surface() {
        let mut cushion = CushionSurface::new();
        assert_eq!(cushion.xx2, 0.0);

        cushion.add_ridge(Orientation::Horizontal, &Rect::new(0.0, 0.0, 50.0, 50.0));
        assert!(cushion.xx2 < 0.0, "square coefficient bends downward");
        assert!(cushion.xx1 != 0.0);
        assert_eq!(cushion.yy2, 0.0, "perpendicular axis untouched");

        cushion.add_ridge(Orientation::Vertical, &Rect::new(0.0, 0.0, 50.0, 50.0));
        assert!(cushion.yy2 < 0.0);
    }

    #[test]
    fn colors_by_extension() {
        let archive = file("backup.tar", 1);
        let source = file("main.rs", 1);
        let plain = file("README", 1);
        let dotfile = file(".bashrc", 1);

        assert_eq!(tile_color(&archive), Rgb([0x30, 0xA0, 0x30]));
        assert_eq!(tile_color(&source), Rgb([0x40, 0xB0, 0xE0]));
        assert_eq!(tile_color(&plain), Rgb(COLOR_DEFAULT));
        // A leading dot is not an extension separator.
        assert_eq!(tile_color(&dotfile), Rgb(COLOR_DEFAULT));

        let link = Node::file_from_cache("ln", libc::S_IFLNK | 0o777, 1, 0, None, None, None, 1);
        assert_eq!(tile_color(&link), Rgb(COLOR_SYMLINK));

        let fifo = Node::file_from_cache("pipe", libc::S_IFIFO | 0o644, 0, 0, None, None, None, 1);
        assert_eq!(tile_color(&fifo), Rgb(COLOR_SPECIAL));
    }

    #[test]
    fn render_produces_shaded_tiles() {
        let (tree, top) = weighted_tree(&[8, 4, 2]);
        let settings = TreemapSettings::default();
        let layout = TreemapLayout::new(&tree, &settings);
        let root = layout.build(top, Rect::new(0.0, 0.0, 64.0, 48.0));

        let image = render(&tree, &root, &settings, 64, 48);
        assert_eq!(image.width(), 64);
        assert_eq!(image.height(), 48);

        // Shaded file tiles overwrite the flat background somewhere.
        let background = Rgb([0x60, 0x60, 0x60]);
        assert!(image.pixels().any(|p| *p != background));
    }

    #[test]
    fn layout_does_not_touch_the_tree() {
        let (tree, top) = weighted_tree(&[5, 3, 1]);
        let before_items = tree.total_items(top);
        let before_size = tree.total_size(top);

        let settings = TreemapSettings::default();
        let layout = TreemapLayout::new(&tree, &settings);
        let _root = layout.build(top, Rect::new(0.0, 0.0, 128.0, 96.0));

        assert_eq!(tree.total_items(top), before_items);
        assert_eq!(tree.total_size(top), before_size);
        assert_eq!(tree.children(top).len(), 3);
    }
}
