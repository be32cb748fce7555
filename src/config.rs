//! User configuration — scan policies, treemap tuning and persistence.
//!
//! Settings are stored as a simple key-value text file at
//! `$XDG_CONFIG_HOME/dirstat/config` (default `~/.config/dirstat/config`).

use std::path::PathBuf;

use crate::core::treemap::TreemapSettings;

/// Application configuration — scan and treemap settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Descend into mount points on other filesystems.
    pub cross_filesystems: bool,
    /// Exclude rule specs (see `PatternRule::parse` for the syntax).
    pub exclude_patterns: Vec<String>,
    /// Ignore filter specs; matches go to the attic.
    pub ignore_patterns: Vec<String>,
    /// Rows shown in the largest-subtrees report.
    pub top_entries: usize,

    pub treemap_squarify: bool,
    pub treemap_cushion_shading: bool,
    pub treemap_min_tile_size: f64,
    pub treemap_ambient_light: u8,
    pub treemap_enforce_contrast: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let treemap = TreemapSettings::default();
        Self {
            cross_filesystems: false,
            exclude_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
            top_entries: 10,
            treemap_squarify: treemap.squarify,
            treemap_cushion_shading: treemap.cushion_shading,
            treemap_min_tile_size: treemap.min_tile_size,
            treemap_ambient_light: treemap.ambient_light,
            treemap_enforce_contrast: treemap.enforce_contrast,
        }
    }
}

impl AppConfig {
    /// Load config from disk, falling back to defaults.
    pub fn load() -> Self {
        let path = config_path();
        if path.exists() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                return Self::parse_config(&contents);
            }
        }
        Self::default()
    }

    /// Persist current config to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.serialise())?;
        Ok(())
    }

    /// The treemap settings this configuration describes.
    pub fn treemap_settings(&self) -> TreemapSettings {
        TreemapSettings {
            squarify: self.treemap_squarify,
            cushion_shading: self.treemap_cushion_shading,
            min_tile_size: self.treemap_min_tile_size,
            ambient_light: self.treemap_ambient_light,
            enforce_contrast: self.treemap_enforce_contrast,
            ..TreemapSettings::default()
        }
    }

    fn parse_config(s: &str) -> Self {
        let mut config = Self::default();

        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "cross_filesystems" => config.cross_filesystems = value == "true",
                "exclude" => {
                    config.exclude_patterns = split_patterns(value);
                }
                "ignore" => {
                    config.ignore_patterns = split_patterns(value);
                }
                "top_entries" => {
                    if let Ok(v) = value.parse::<usize>() {
                        config.top_entries = v.clamp(1, 1000);
                    }
                }
                "treemap_squarify" => config.treemap_squarify = value == "true",
                "treemap_cushion_shading" => config.treemap_cushion_shading = value == "true",
                "treemap_min_tile_size" => {
                    if let Ok(v) = value.parse::<f64>() {
                        // Keep this bounded for predictable layouts.
                        config.treemap_min_tile_size = v.clamp(1.0, 50.0);
                    }
                }
                "treemap_ambient_light" => {
                    if let Ok(v) = value.parse::<u32>() {
                        config.treemap_ambient_light = v.clamp(0, 200) as u8;
                    }
                }
                "treemap_enforce_contrast" => {
                    config.treemap_enforce_contrast = value == "true"
                }
                _ => {}
            }
        }

        config
    }

    fn serialise(&self) -> String {
        let lines = vec![
            "# dirstat configuration".to_string(),
            String::new(),
            "# Scan settings".to_string(),
            format!("cross_filesystems = {}", self.cross_filesystems),
            format!("exclude = {}", self.exclude_patterns.join(", ")),
            format!("ignore = {}", self.ignore_patterns.join(", ")),
            format!("top_entries = {}", self.top_entries),
            String::new(),
            "# Treemap settings".to_string(),
            format!("treemap_squarify = {}", self.treemap_squarify),
            format!("treemap_cushion_shading = {}", self.treemap_cushion_shading),
            format!("treemap_min_tile_size = {}", self.treemap_min_tile_size),
            format!("treemap_ambient_light = {}", self.treemap_ambient_light),
            format!("treemap_enforce_contrast = {}", self.treemap_enforce_contrast),
            String::new(),
        ];

        lines.join("\n")
    }
}

fn split_patterns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|p| p.trim().trim_matches('"').to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Return the config file path (`$XDG_CONFIG_HOME/dirstat/config`).
fn config_path() -> PathBuf {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        });
    config_dir.join("dirstat").join("config")
}
