//! Projects known to the host, and path normalization for assignment keys.

use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// A folder (or single file) the user works in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub root: PathBuf,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = normalize_path(&root.into());
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        Self { name, root }
    }
}

/// Supplies the set of open projects.
pub trait ProjectSource: Send + Sync {
    fn projects(&self) -> Vec<Project>;

    /// The innermost project containing `path`.
    fn project_for(&self, path: &Path) -> Option<Project> {
        let path = normalize_path(path);
        self.projects()
            .into_iter()
            .filter(|project| path.starts_with(&project.root))
            .max_by_key(|project| project.root.components().count())
    }
}

/// A fixed, editable list of projects.
#[derive(Debug, Default)]
pub struct StaticProjects {
    projects: RwLock<Vec<Project>>,
}

impl StaticProjects {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            projects: RwLock::new(roots.into_iter().map(Project::new).collect()),
        }
    }

    pub fn add(&self, root: impl Into<PathBuf>) {
        let project = Project::new(root);
        let mut projects = self.projects.write().unwrap();
        if !projects.iter().any(|p| p.root == project.root) {
            projects.push(project);
        }
    }

    pub fn remove(&self, root: &Path) {
        let root = normalize_path(root);
        self.projects.write().unwrap().retain(|p| p.root != root);
    }
}

impl ProjectSource for StaticProjects {
    fn projects(&self) -> Vec<Project> {
        self.projects.read().unwrap().clone()
    }
}

/// Absolute, lexically cleaned path used as an assignment key. Does not touch
/// the filesystem, so it works for paths that no longer exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    #[cfg(target_os = "windows")]
    {
        PathBuf::from(normalized.to_string_lossy().to_lowercase())
    }
    #[cfg(not(target_os = "windows"))]
    {
        normalized
    }
}
