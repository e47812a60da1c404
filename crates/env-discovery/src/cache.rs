//! Refresh results keyed by query scope.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::protocol::{NativeEnvKind, NativeInfo, RefreshOptions};

/// What a refresh searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    All,
    Kind(NativeEnvKind),
    Paths(Vec<PathBuf>),
}

impl RefreshScope {
    /// Cache key for this scope. Path lists are joined with `,` in the order
    /// given, so callers must pass paths in a stable order to share entries.
    pub fn key(&self) -> ScopeKey {
        match self {
            RefreshScope::All => ScopeKey("all".to_string()),
            RefreshScope::Kind(kind) => ScopeKey(kind.as_str().to_string()),
            RefreshScope::Paths(paths) => ScopeKey(
                paths
                    .iter()
                    .map(|p| p.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }

    pub fn to_options(&self) -> RefreshOptions {
        match self {
            RefreshScope::All => RefreshOptions::default(),
            RefreshScope::Kind(kind) => RefreshOptions {
                search_kind: Some(*kind),
                search_paths: None,
            },
            RefreshScope::Paths(paths) => RefreshOptions {
                search_kind: None,
                search_paths: Some(paths.clone()),
            },
        }
    }
}

impl From<Option<NativeEnvKind>> for RefreshScope {
    fn from(kind: Option<NativeEnvKind>) -> Self {
        kind.map_or(RefreshScope::All, RefreshScope::Kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last known result per scope.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    entries: HashMap<ScopeKey, Vec<NativeInfo>>,
}

impl DiscoveryCache {
    pub fn get(&self, key: &ScopeKey) -> Option<&Vec<NativeInfo>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: ScopeKey, items: Vec<NativeInfo>) {
        self.entries.insert(key, items);
    }

    pub fn remove(&mut self, key: &ScopeKey) -> Option<Vec<NativeInfo>> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
