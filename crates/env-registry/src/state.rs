//! Persisted key-value state and the per-backend assignment view over it.
//!
//! Everything lives in one JSON object on disk:
//!
//! ```json
//! {
//!   "venv:projects": { "/work/app": { "environment_path": "...", "updated_at": "..." } },
//!   "venv:global": { "environment_path": "...", "updated_at": "..." }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RegistryError;
use crate::model::BackendKind;
use crate::projects::normalize_path;

/// Default state file (`~/.cache/pyenvs/state.json` on Linux).
pub fn default_state_path() -> PathBuf {
    env_discovery::default_cache_dir().join("state.json")
}

/// A JSON object persisted as a whole file on every write.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    data: StdMutex<Map<String, Value>>,
}

impl StateStore {
    /// Load `path`, starting empty when it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("[state] Ignoring corrupt state file {:?}: {}", path, e);
                Map::new()
            }),
            Err(_) => Map::new(),
        };
        Self {
            path: Some(path),
            data: StdMutex::new(data),
        }
    }

    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: StdMutex::new(Map::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().unwrap();
        let value = data.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[state] Ignoring unreadable entry {:?}: {}", key, e);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RegistryError> {
        let value = serde_json::to_value(value).map_err(|e| self.error(e.to_string()))?;
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), value);
        self.flush(&data)
    }

    pub fn remove(&self, key: &str) -> Result<(), RegistryError> {
        let mut data = self.data.lock().unwrap();
        if data.remove(key).is_some() {
            self.flush(&data)?;
        }
        Ok(())
    }

    /// Write the whole object. Called with the data lock held so writes are
    /// serialized.
    fn flush(&self, data: &Map<String, Value>) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.error(e.to_string()))?;
        }
        let contents =
            serde_json::to_string_pretty(data).map_err(|e| self.error(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(|e| self.error(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| self.error(e.to_string()))?;
        Ok(())
    }

    fn error(&self, message: String) -> RegistryError {
        RegistryError::State {
            path: self.path.clone().unwrap_or_default(),
            message,
        }
    }
}

/// A persisted choice of environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub environment_path: PathBuf,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn now(environment_path: impl Into<PathBuf>) -> Self {
        Self {
            environment_path: environment_path.into(),
            updated_at: Utc::now(),
        }
    }
}

/// One backend's project assignments and global default.
#[derive(Debug, Clone)]
pub struct Assignments {
    store: Arc<StateStore>,
    backend: BackendKind,
}

impl Assignments {
    pub fn new(store: Arc<StateStore>, backend: BackendKind) -> Self {
        Self { store, backend }
    }

    fn projects_key(&self) -> String {
        format!("{}:projects", self.backend.namespace())
    }

    fn global_key(&self) -> String {
        format!("{}:global", self.backend.namespace())
    }

    fn projects(&self) -> HashMap<String, Assignment> {
        self.store.get(&self.projects_key()).unwrap_or_default()
    }

    /// Every project assignment, keyed by normalized project root.
    pub fn all(&self) -> HashMap<PathBuf, Assignment> {
        self.projects()
            .into_iter()
            .map(|(root, assignment)| (PathBuf::from(root), assignment))
            .collect()
    }

    pub fn project(&self, root: &Path) -> Option<Assignment> {
        let key = normalize_path(root).to_string_lossy().into_owned();
        self.projects().remove(&key)
    }

    /// Record (or with `None`, forget) the environment chosen for `root`.
    pub fn set_project(&self, root: &Path, environment_path: Option<&Path>) -> Result<(), RegistryError> {
        let key = normalize_path(root).to_string_lossy().into_owned();
        let mut projects = self.projects();
        match environment_path {
            Some(path) => {
                projects.insert(key, Assignment::now(path));
            }
            None => {
                if projects.remove(&key).is_none() {
                    return Ok(());
                }
            }
        }
        self.store.set(&self.projects_key(), &projects)
    }

    pub fn global(&self) -> Option<Assignment> {
        self.store.get(&self.global_key())
    }

    pub fn set_global(&self, environment_path: Option<&Path>) -> Result<(), RegistryError> {
        match environment_path {
            Some(path) => self.store.set(&self.global_key(), &Assignment::now(path)),
            None => self.store.remove(&self.global_key()),
        }
    }

    /// Forget every assignment for this backend.
    pub fn clear(&self) -> Result<(), RegistryError> {
        self.store.remove(&self.projects_key())?;
        self.store.remove(&self.global_key())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = Arc::new(StateStore::open(&path));
        let venv = Assignments::new(store, BackendKind::Venv);
        venv.set_project(Path::new("/work/app"), Some(Path::new("/work/app/.venv/bin/python")))
            .unwrap();
        venv.set_global(Some(Path::new("/usr/bin/python3"))).unwrap();

        let reopened = Assignments::new(Arc::new(StateStore::open(&path)), BackendKind::Venv);
        assert_eq!(
            reopened.project(Path::new("/work/app/")).unwrap().environment_path,
            PathBuf::from("/work/app/.venv/bin/python")
        );
        assert_eq!(
            reopened.global().unwrap().environment_path,
            PathBuf::from("/usr/bin/python3")
        );

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["venv:projects"]["/work/app"]["updated_at"].is_string());
    }

    #[test]
    fn test_namespaces_are_separate() {
        let store = Arc::new(StateStore::in_memory());
        let venv = Assignments::new(store.clone(), BackendKind::Venv);
        let conda = Assignments::new(store, BackendKind::Conda);

        venv.set_project(Path::new("/work/app"), Some(Path::new("/a"))).unwrap();
        assert!(conda.project(Path::new("/work/app")).is_none());

        conda.set_global(Some(Path::new("/opt/conda/bin/python"))).unwrap();
        venv.clear().unwrap();
        assert!(venv.project(Path::new("/work/app")).is_none());
        assert!(conda.global().is_some());
    }

    #[test]
    fn test_unassign() {
        let venv = Assignments::new(Arc::new(StateStore::in_memory()), BackendKind::Venv);
        venv.set_project(Path::new("/p"), Some(Path::new("/p/.venv/bin/python"))).unwrap();
        venv.set_project(Path::new("/p"), None).unwrap();
        assert!(venv.all().is_empty());
        // Forgetting something never assigned is fine.
        venv.set_project(Path::new("/q"), None).unwrap();
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = StateStore::open(&path);
        assert!(store.get::<Value>("venv:global").is_none());
        store.set("venv:global", &serde_json::json!({"x": 1})).unwrap();
        assert!(store.get::<Value>("venv:global").is_some());
    }
}
