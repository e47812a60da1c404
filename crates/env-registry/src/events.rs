//! Change notifications published by registries.

use std::path::PathBuf;
use std::sync::Arc;

use crate::model::{BackendKind, PythonEnvironment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct EnvironmentChange {
    pub kind: ChangeKind,
    pub environment: Arc<PythonEnvironment>,
}

/// The collection changed. All `Remove` entries come before all `Add` entries.
#[derive(Debug, Clone)]
pub struct EnvironmentsChanged {
    pub backend: BackendKind,
    pub changes: Vec<EnvironmentChange>,
}

impl EnvironmentsChanged {
    /// Build a batch from separate lists, removals first.
    pub fn new(
        backend: BackendKind,
        removed: Vec<Arc<PythonEnvironment>>,
        added: Vec<Arc<PythonEnvironment>>,
    ) -> Self {
        let changes = removed
            .into_iter()
            .map(|environment| EnvironmentChange {
                kind: ChangeKind::Remove,
                environment,
            })
            .chain(added.into_iter().map(|environment| EnvironmentChange {
                kind: ChangeKind::Add,
                environment,
            }))
            .collect();
        Self { backend, changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// The selected environment for a project (or the global default, when
/// `project` is `None`) changed.
#[derive(Debug, Clone)]
pub struct EnvironmentChanged {
    pub backend: BackendKind,
    pub project: Option<PathBuf>,
    pub old: Option<Arc<PythonEnvironment>>,
    pub new: Option<Arc<PythonEnvironment>>,
}
