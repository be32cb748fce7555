//! Per-directory disk usage scanner.
//!
//! Scans a directory subtree (or replays a cache file), prints a
//! disk-usage summary, and can write the scanned tree back out as a
//! cache snapshot or render it as a squarified treemap PNG.

mod app;
mod config;
mod core;

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc::unbounded_channel;

use crate::app::context::AppContext;
use crate::app::runtime::{self, ScanReport};
use crate::config::AppConfig;
use crate::core::cache::CacheWriter;
use crate::core::format;
use crate::core::mounts::MountTable;
use crate::core::node::{NodeId, SortColumn, SortOrder};
use crate::core::scan::Scanner;
use crate::core::tree::Tree;
use crate::core::treemap::{self, Rect, TreemapLayout};

// ───────────────────────────────────────── CLI ───────────────

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"), about = "Per-directory disk usage scanner")]
struct Cli {
    /// Directory to scan (defaults to `.`).
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Descend into mount points on other filesystems.
    #[arg(long)]
    cross_filesystems: bool,

    /// Exclude rule (repeatable): glob, `regex:PAT`, or `path:` prefix
    /// for full-path matching.
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Ignore filter (repeatable): matching entries go to the attic and
    /// stay out of the totals.
    #[arg(long = "ignore")]
    ignores: Vec<String>,

    /// Read this cache file instead of scanning.
    #[arg(long)]
    read_cache: Option<PathBuf>,

    /// Write the scanned tree to this cache file.
    #[arg(long)]
    write_cache: Option<PathBuf>,

    /// Render a treemap PNG of the scanned tree.
    #[arg(long)]
    treemap: Option<PathBuf>,

    /// Treemap image size as WIDTHxHEIGHT.
    #[arg(long, default_value = "1024x768")]
    treemap_size: String,

    /// Rows in the largest-subtrees report.
    #[arg(long)]
    top: Option<usize>,
}

// ───────────────────────────────────────── main ──────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (only when RUST_LOG is set).
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr) // never pollute stdout
        .init();

    let cli = Cli::parse();

    let mut user_config = AppConfig::load();
    if cli.cross_filesystems {
        user_config.cross_filesystems = true;
    }
    if let Some(top) = cli.top {
        user_config.top_entries = top.clamp(1, 1000);
    }

    let mounts = MountTable::read();
    let ctx = AppContext::new(user_config, mounts, &cli.excludes, &cli.ignores);

    // ── scan (or cache replay) ────────────────────────────────
    let (events_tx, mut events_rx) = unbounded_channel();
    let mut tree = Tree::new(Some(events_tx));
    let mut scanner = Scanner::new();

    match &cli.read_cache {
        Some(cache_file) => {
            scanner
                .start_cache(&mut tree, cache_file)
                .with_context(|| format!("reading cache {}", cache_file.display()))?;
        }
        None => {
            let root = cli
                .path
                .canonicalize()
                .with_context(|| format!("resolving {}", cli.path.display()))?;
            scanner.start(&mut tree, &ctx.scan_context(), &root)?;
        }
    }

    let report = runtime::run_scan(&mut tree, &mut scanner, &ctx, &mut events_rx).await;

    print_report(&mut tree, &ctx, &report);

    // ── outputs ───────────────────────────────────────────────
    if let Some(cache_file) = &cli.write_cache {
        CacheWriter::write(&tree, cache_file)
            .with_context(|| format!("writing cache {}", cache_file.display()))?;
        println!("\nCache written to {}", cache_file.display());
    }

    if let Some(image_file) = &cli.treemap {
        let (width, height) = parse_size(&cli.treemap_size)?;
        render_treemap(&tree, &ctx, image_file, width, height)?;
        println!("\nTreemap written to {}", image_file.display());
    }

    Ok(())
}

// ───────────────────────────────────────── report ────────────

fn print_report(tree: &mut Tree, ctx: &AppContext, report: &ScanReport) {
    let Some(top) = tree.first_toplevel() else {
        println!("Nothing was read.");
        return;
    };

    // Totals from a subtree with read errors are lower bounds.
    let prefix = |tree: &Tree, id: NodeId| {
        if tree.has_error_descendant(id) {
            ">"
        } else {
            ""
        }
    };

    println!("{}", tree.url(top));
    println!(
        "Total size:     {p}{}  (allocated {p}{})",
        format::format_size(tree.total_size(top)),
        format::format_size(tree.total_allocated(top)),
        p = prefix(tree, top),
    );
    println!(
        "Items:          {}  ({} files, {} directories)",
        tree.total_items(top),
        tree.total_files(top),
        tree.total_subdirs(top),
    );
    println!("Latest mtime:   {}", format::format_time(tree.latest_mtime(top)));
    println!(
        "Read:           {} directories in {}{}",
        report.dirs_read,
        format::format_millisec(report.elapsed.as_millis() as u64),
        if report.aborted { "  (aborted)" } else { "" },
    );

    let children = tree.sorted_children(top, SortColumn::Size, SortOrder::Descending);

    if children.is_empty() {
        return;
    }

    println!("\nLargest entries:");

    for &child in children.iter().take(ctx.config.top_entries) {
        let name = tree.debug_url(child);
        let name = name.rsplit('/').next().unwrap_or(&name).to_string();
        let percent = tree
            .subtree_percent(child)
            .map(format::format_percent)
            .unwrap_or_default();

        println!(
            "  {:>10}{}  {:>6}  {}",
            format::format_size(tree.total_size(child)),
            prefix(tree, child),
            percent,
            name,
        );
    }
}

// ───────────────────────────────────────── treemap output ────

fn parse_size(spec: &str) -> Result<(u32, u32)> {
    let Some((w, h)) = spec.split_once('x') else {
        bail!("treemap size must look like 1024x768, got {spec:?}");
    };

    let width: u32 = w.parse().context("treemap width")?;
    let height: u32 = h.parse().context("treemap height")?;

    if width == 0 || height == 0 || width > 16384 || height > 16384 {
        bail!("unreasonable treemap size {width}x{height}");
    }

    Ok((width, height))
}

fn render_treemap(
    tree: &Tree,
    ctx: &AppContext,
    path: &std::path::Path,
    width: u32,
    height: u32,
) -> Result<()> {
    let Some(top) = tree.first_toplevel() else {
        bail!("nothing to render");
    };

    let settings = ctx.config.treemap_settings();
    let layout = TreemapLayout::new(tree, &settings);
    let root = layout.build(top, Rect::new(0.0, 0.0, width as f64, height as f64));

    let image = treemap::render(tree, &root, &settings, width, height);
    image
        .save(path)
        .with_context(|| format!("saving treemap to {}", path.display()))?;

    Ok(())
}
