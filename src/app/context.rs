//! Application context — every policy object the scanner consults,
//! constructed once in `main` and passed by reference. No globals.

use crate::config::AppConfig;
use crate::core::exclude::{ExcludeRules, IgnoreFilters};
use crate::core::mounts::MountTable;
use crate::core::scan::ScanContext;

pub struct AppContext {
    pub config: AppConfig,
    pub mounts: MountTable,
    pub excludes: ExcludeRules,
    pub ignores: IgnoreFilters,
}

impl AppContext {
    /// Combine the persisted config with per-invocation pattern specs
    /// (config patterns first, so command-line rules match later).
    pub fn new(
        config: AppConfig,
        mounts: MountTable,
        extra_excludes: &[String],
        extra_ignores: &[String],
    ) -> Self {
        let excludes = ExcludeRules::from_specs(
            config
                .exclude_patterns
                .iter()
                .map(String::as_str)
                .chain(extra_excludes.iter().map(String::as_str)),
        );

        let ignores = IgnoreFilters::from_specs(
            config
                .ignore_patterns
                .iter()
                .map(String::as_str)
                .chain(extra_ignores.iter().map(String::as_str)),
        );

        Self {
            config,
            mounts,
            excludes,
            ignores,
        }
    }

    /// The borrowed view the scanner works with.
    pub fn scan_context(&self) -> ScanContext<'_> {
        ScanContext {
            mounts: &self.mounts,
            excludes: &self.excludes,
            ignores: &self.ignores,
            cross_filesystems: self.config.cross_filesystems,
        }
    }
}
