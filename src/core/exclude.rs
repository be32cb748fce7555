//! Exclude rules and ignore filters.
//!
//! An ordered list of matchers the scanner consults for every directory
//! entry. Rules are regexes or globs, matched against either the entry's
//! full path or its basename; the first matching rule wins. The same
//! machinery backs two lists with different consequences: exclude rules
//! stop recursion (the directory stays `OnRequestOnly`), ignore filters
//! route the entry into its parent's attic.

use globset::{Glob, GlobMatcher};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },

    #[error("invalid regex pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

// ───────────────────────────────────────── one rule ──────────

#[derive(Debug)]
enum Matcher {
    Glob(GlobMatcher),
    Regex(Regex),
}

/// A single pattern plus its matching policy.
#[derive(Debug)]
pub struct PatternRule {
    pattern: String,
    matcher: Matcher,
    /// Match against the full path instead of the basename.
    full_path: bool,
}

impl PatternRule {
    pub fn glob(pattern: &str, full_path: bool) -> Result<Self, PatternError> {
        let matcher = Glob::new(pattern)
            .map_err(|source| PatternError::Glob {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();

        Ok(Self {
            pattern: pattern.to_string(),
            matcher: Matcher::Glob(matcher),
            full_path,
        })
    }

    pub fn regex(pattern: &str, full_path: bool) -> Result<Self, PatternError> {
        let matcher = Regex::new(pattern).map_err(|source| PatternError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            matcher: Matcher::Regex(matcher),
            full_path,
        })
    }

    /// Parse the config/CLI syntax:
    /// `regex:PAT`, `glob:PAT` or a bare glob; a leading `path:` switches
    /// from basename to full-path matching ("path:regex:^/var/.*").
    pub fn parse(spec: &str) -> Result<Self, PatternError> {
        let (full_path, rest) = match spec.strip_prefix("path:") {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        if let Some(pattern) = rest.strip_prefix("regex:") {
            Self::regex(pattern, full_path)
        } else if let Some(pattern) = rest.strip_prefix("glob:") {
            Self::glob(pattern, full_path)
        } else {
            Self::glob(rest, full_path)
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Does this rule match the given entry?
    pub fn matches(&self, full_path: &str, basename: &str) -> bool {
        let subject = if self.full_path { full_path } else { basename };

        match &self.matcher {
            Matcher::Glob(glob) => glob.is_match(subject),
            Matcher::Regex(regex) => regex.is_match(subject),
        }
    }
}

// ───────────────────────────────────────── rule lists ────────

/// Ordered rule list; first match wins.
#[derive(Debug, Default)]
pub struct ExcludeRules {
    rules: Vec<PatternRule>,
}

impl ExcludeRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from textual specs, skipping (and logging) invalid patterns.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut rules = Self::new();

        for spec in specs {
            match PatternRule::parse(spec) {
                Ok(rule) => rules.add(rule),
                Err(err) => tracing::error!("Ignoring exclude pattern: {err}"),
            }
        }

        rules
    }

    pub fn add(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, full_path: &str, basename: &str) -> bool {
        self.rules.iter().any(|r| r.matches(full_path, basename))
    }
}

/// Filters marking entries as "ignored": matched entries are reparented
/// into their directory's attic and excluded from ancestor sums.
#[derive(Debug, Default)]
pub struct IgnoreFilters {
    rules: Vec<PatternRule>,
}

impl IgnoreFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut filters = Self::new();

        for spec in specs {
            match PatternRule::parse(spec) {
                Ok(rule) => filters.rules.push(rule),
                Err(err) => tracing::error!("Ignoring filter pattern: {err}"),
            }
        }

        filters
    }

    pub fn add(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, full_path: &str, basename: &str) -> bool {
        self.rules.iter().any(|r| r.matches(full_path, basename))
    }
}
