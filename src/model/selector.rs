//! Include/exclude file selectors used by push and pull transfers.

use crate::error::ProxyResult;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// Glob patterns, relative to a transfer root, describing a set of files.
///
/// `*` and `?` never cross a `/`; `**` matches any number of directories.
/// A file is selected when it matches at least one include and no exclude,
/// so a selector without includes selects nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSelector {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

impl FileSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector including the given patterns
    pub fn including<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            includes: patterns.into_iter().map(Into::into).collect(),
            excludes: Vec::new(),
        }
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Union of several selectors: all includes and all excludes.
    pub fn merged<'a, I>(selectors: I) -> Self
    where
        I: IntoIterator<Item = &'a FileSelector>,
    {
        let mut merged = FileSelector::new();
        for selector in selectors {
            for include in &selector.includes {
                if !merged.includes.contains(include) {
                    merged.includes.push(include.clone());
                }
            }
            for exclude in &selector.excludes {
                if !merged.excludes.contains(exclude) {
                    merged.excludes.push(exclude.clone());
                }
            }
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }

    /// Compile the patterns into matchers
    pub fn compile(&self) -> ProxyResult<CompiledSelector> {
        Ok(CompiledSelector {
            includes: build_set(&self.includes)?,
            excludes: build_set(&self.excludes)?,
        })
    }
}

fn build_set(patterns: &[String]) -> ProxyResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_start_matches("./");
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    Ok(builder.build()?)
}

/// Compiled form of a `FileSelector`
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    includes: GlobSet,
    excludes: GlobSet,
}

impl CompiledSelector {
    /// `relative_path` uses `/` separators and no leading slash
    pub fn is_selected(&self, relative_path: &str) -> bool {
        self.includes.is_match(relative_path) && !self.excludes.is_match(relative_path)
    }
}
