//! One backend's environments, project assignments and global default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use env_discovery::{DiscoveryService, NativeInfo, RefreshScope, ShutdownHandle};
use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::backends::{venv_interpreter, Backend};
use crate::error::RegistryError;
use crate::events::{EnvironmentChanged, EnvironmentsChanged};
use crate::model::{preference_order, BackendKind, PythonEnvironment};
use crate::projects::{normalize_path, ProjectSource};
use crate::state::{Assignments, StateStore};

const EVENT_CAPACITY: usize = 64;

/// Target of [`EnvironmentRegistry::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetScope {
    Global,
    Project(PathBuf),
    /// Apply the same choice to several projects.
    Projects(Vec<PathBuf>),
}

/// Filter for [`EnvironmentRegistry::get_environments`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentsScope {
    All,
    /// Environments not tied to any project.
    Global,
    Project(PathBuf),
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Sorted by preference (newest version first).
    collection: Vec<Arc<PythonEnvironment>>,
    /// Normalized project root -> selected environment.
    project_map: HashMap<PathBuf, Arc<PythonEnvironment>>,
    global: Option<Arc<PythonEnvironment>>,
}

impl RegistryState {
    fn find(&self, path: &Path) -> Option<Arc<PythonEnvironment>> {
        self.collection
            .iter()
            .find(|env| env.matches_path(path))
            .cloned()
    }
}

fn same_environment(a: Option<&Arc<PythonEnvironment>>, b: Option<&Arc<PythonEnvironment>>) -> bool {
    a.map(|env| &env.id) == b.map(|env| &env.id)
}

/// Pick an environment for `root` when nothing is assigned.
///
/// A lone candidate in the project's subtree is taken as is. With several,
/// they are ordered by version (newest first), then name, then path, and the
/// first one whose own project is exactly `root` wins. Otherwise nothing is
/// picked.
pub fn select_for_project(
    collection: &[Arc<PythonEnvironment>],
    root: &Path,
) -> Option<Arc<PythonEnvironment>> {
    let mut candidates: Vec<_> = collection
        .iter()
        .filter(|env| env.is_within(root))
        .cloned()
        .collect();
    if candidates.len() == 1 {
        return candidates.pop();
    }
    candidates.sort_by(|a, b| preference_order(a, b));
    candidates
        .into_iter()
        .find(|env| env.project.as_deref().map(normalize_path).as_deref() == Some(root))
}

pub struct EnvironmentRegistry {
    kind: BackendKind,
    backend: Arc<dyn Backend>,
    discovery: Arc<DiscoveryService>,
    projects: Arc<dyn ProjectSource>,
    assignments: Assignments,
    state: StdMutex<RegistryState>,
    initialized: OnceCell<()>,
    /// Held while the collection is being replaced.
    update_lock: Mutex<()>,
    cancel: CancellationToken,
    environments_tx: broadcast::Sender<EnvironmentsChanged>,
    environment_tx: broadcast::Sender<EnvironmentChanged>,
}

impl EnvironmentRegistry {
    pub fn new(
        backend: Arc<dyn Backend>,
        discovery: Arc<DiscoveryService>,
        projects: Arc<dyn ProjectSource>,
        store: Arc<StateStore>,
    ) -> Self {
        let kind = backend.kind();
        let (environments_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (environment_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind,
            backend,
            discovery,
            projects,
            assignments: Assignments::new(store, kind),
            state: StdMutex::new(RegistryState::default()),
            initialized: OnceCell::new(),
            update_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            environments_tx,
            environment_tx,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Load the collection from discovery. Runs once; concurrent callers
    /// wait for the same load. A failed load leaves the registry empty.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                let _guard = self.update_lock.lock().await;
                match self
                    .discovery
                    .refresh(false, &RefreshScope::All, &self.cancel)
                    .await
                {
                    Ok(items) => self.apply(&items, None).await,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("[registry:{}] Initial discovery failed: {}", self.kind, e),
                }
                info!(
                    "[registry:{}] Initialized with {} environments",
                    self.kind,
                    self.state.lock().unwrap().collection.len()
                );
            })
            .await;
    }

    /// Changes to the collection, one batch per refresh.
    pub fn subscribe_environments(&self) -> broadcast::Receiver<EnvironmentsChanged> {
        self.environments_tx.subscribe()
    }

    /// Changes to the selected environment of a project or the global default.
    pub fn subscribe_environment(&self) -> broadcast::Receiver<EnvironmentChanged> {
        self.environment_tx.subscribe()
    }

    /// Current collection without waiting for initialization.
    pub fn environments(&self) -> Vec<Arc<PythonEnvironment>> {
        self.state.lock().unwrap().collection.clone()
    }

    fn project_root(&self, path: &Path) -> PathBuf {
        self.projects
            .project_for(path)
            .map(|project| project.root)
            .unwrap_or_else(|| normalize_path(path))
    }

    /// Environment for `scope`: the owning project's selection, or the global
    /// default when there is no scope, no owning project, or no selection.
    pub async fn get(&self, scope: Option<&Path>) -> Option<Arc<PythonEnvironment>> {
        if let Some(path) = scope {
            if let Some(env) = self.get_project(path).await {
                return Some(env);
            }
        }
        self.get_global().await
    }

    /// The selection for the project owning `path` (or for `path` itself when
    /// no project owns it), without the global fallback. A selection whose
    /// interpreter is gone from disk is dropped and the project falls back to
    /// what the heuristic picks among the remaining environments.
    pub async fn get_project(&self, path: &Path) -> Option<Arc<PythonEnvironment>> {
        self.initialize().await;
        let root = self.project_root(path);
        let env = self.state.lock().unwrap().project_map.get(&root).cloned()?;
        if path_exists(&env.environment_path).await {
            return Some(env);
        }

        debug!(
            "[registry:{}] Dropping stale selection {:?} for {:?}",
            self.kind, env.environment_path, root
        );
        let persisted = self
            .assignments
            .project(&root)
            .is_some_and(|a| env.matches_path(&a.environment_path));
        if persisted {
            if let Err(e) = self.assignments.set_project(&root, None) {
                warn!("[registry:{}] Failed to clear stale assignment: {}", self.kind, e);
            }
        }

        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            if !same_environment(state.project_map.get(&root), Some(&env)) {
                // Replaced while we were checking the disk.
                return state.project_map.get(&root).cloned();
            }
            let remaining = without(&state.collection, &env);
            let new = select_for_project(&remaining, &root);
            let old = match &new {
                Some(replacement) => state.project_map.insert(root.clone(), replacement.clone()),
                None => state.project_map.remove(&root),
            };
            (old, new)
        };
        self.notify_selection(Some(root), old, new.clone());
        new
    }

    /// The global default. A global whose interpreter is gone from disk is
    /// cleared, persisted or not, and the backend's default among the
    /// remaining environments takes its place.
    async fn get_global(&self) -> Option<Arc<PythonEnvironment>> {
        self.initialize().await;
        let global = self.state.lock().unwrap().global.clone()?;
        if path_exists(&global.environment_path).await {
            return Some(global);
        }

        debug!(
            "[registry:{}] Dropping stale global {:?}",
            self.kind, global.environment_path
        );
        let persisted = self
            .assignments
            .global()
            .is_some_and(|a| global.matches_path(&a.environment_path));
        if persisted {
            if let Err(e) = self.assignments.set_global(None) {
                warn!("[registry:{}] Failed to clear stale global: {}", self.kind, e);
            }
        }

        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            if !same_environment(state.global.as_ref(), Some(&global)) {
                return state.global.clone();
            }
            let remaining = without(&state.collection, &global);
            let new = self.backend.default_global(&remaining);
            let old = std::mem::replace(&mut state.global, new.clone());
            (old, new)
        };
        self.notify_selection(None, old, new.clone());
        new
    }

    pub async fn get_environments(&self, scope: EnvironmentsScope) -> Vec<Arc<PythonEnvironment>> {
        self.initialize().await;
        let collection = self.environments();
        match scope {
            EnvironmentsScope::All => collection,
            EnvironmentsScope::Global => {
                let projects = self.projects.projects();
                collection
                    .into_iter()
                    .filter(|env| {
                        env.project.is_none()
                            && !projects.iter().any(|project| env.is_within(&project.root))
                    })
                    .collect()
            }
            EnvironmentsScope::Project(path) => {
                let root = self.project_root(&path);
                collection
                    .into_iter()
                    .filter(|env| env.is_within(&root))
                    .collect()
            }
        }
    }

    /// Select `environment` (or, with `None`, clear the selection) and
    /// persist it. An event fires only for selections that actually change.
    pub async fn set(
        &self,
        scope: SetScope,
        environment: Option<Arc<PythonEnvironment>>,
    ) -> Result<(), RegistryError> {
        self.initialize().await;
        if let Some(env) = &environment {
            if env.backend != self.kind {
                return Err(RegistryError::WrongBackend {
                    id: env.id.to_string(),
                    expected: self.kind,
                    actual: env.backend,
                });
            }
        }

        match scope {
            SetScope::Global => self.set_global(environment),
            SetScope::Project(path) => self.set_projects(std::slice::from_ref(&path), environment),
            SetScope::Projects(paths) => self.set_projects(&paths, environment),
        }
    }

    fn set_global(&self, environment: Option<Arc<PythonEnvironment>>) -> Result<(), RegistryError> {
        self.assignments
            .set_global(environment.as_ref().map(|env| env.environment_path.as_path()))?;
        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            let new = environment.or_else(|| self.backend.default_global(&state.collection));
            let old = std::mem::replace(&mut state.global, new.clone());
            (old, new)
        };
        self.notify_selection(None, old, new);
        Ok(())
    }

    fn set_projects(
        &self,
        paths: &[PathBuf],
        environment: Option<Arc<PythonEnvironment>>,
    ) -> Result<(), RegistryError> {
        for path in paths {
            let root = self.project_root(path);
            self.assignments.set_project(
                &root,
                environment.as_ref().map(|env| env.environment_path.as_path()),
            )?;

            let (old, new) = {
                let mut state = self.state.lock().unwrap();
                let new = environment
                    .clone()
                    .or_else(|| select_for_project(&state.collection, &root));
                let old = match &new {
                    Some(env) => state.project_map.insert(root.clone(), env.clone()),
                    None => state.project_map.remove(&root),
                };
                (old, new)
            };
            self.notify_selection(Some(root), old, new);
        }
        Ok(())
    }

    fn notify_selection(
        &self,
        project: Option<PathBuf>,
        old: Option<Arc<PythonEnvironment>>,
        new: Option<Arc<PythonEnvironment>>,
    ) {
        if same_environment(old.as_ref(), new.as_ref()) {
            return;
        }
        debug!(
            "[registry:{}] Selection for {:?} changed to {:?}",
            self.kind,
            project,
            new.as_ref().map(|env| env.id.as_str())
        );
        let _ = self.environment_tx.send(EnvironmentChanged {
            backend: self.kind,
            project,
            old,
            new,
        });
    }

    /// Re-run discovery (always a hard refresh) for everything, or for the
    /// project owning `scope`, and publish what changed.
    pub async fn refresh(&self, scope: Option<&Path>) -> Result<(), RegistryError> {
        self.initialize().await;
        let _guard = self.update_lock.lock().await;

        let within = scope.map(|path| self.project_root(path));
        let refresh_scope = match &within {
            Some(root) => RefreshScope::Paths(vec![root.clone()]),
            None => RefreshScope::All,
        };
        let items = self
            .discovery
            .refresh(true, &refresh_scope, &self.cancel)
            .await?;
        self.apply(&items, within.as_deref()).await;
        Ok(())
    }

    /// Replace the collection (or its part under `within`) with `items`.
    async fn apply(&self, items: &[NativeInfo], within: Option<&Path>) {
        let in_scope = |env: &PythonEnvironment| within.map_or(true, |root| env.is_within(root));

        let mut discovered: Vec<Arc<PythonEnvironment>> = Vec::new();
        for env in items
            .iter()
            .filter_map(NativeInfo::as_environment)
            .filter_map(|info| self.backend.build(info))
            .filter(|env| in_scope(env))
        {
            if !discovered.iter().any(|seen| seen.id == env.id) {
                discovered.push(Arc::new(env));
            }
        }

        let batch = {
            let mut state = self.state.lock().unwrap();
            let (previous, mut kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.collection)
                .into_iter()
                .partition(|env| in_scope(&**env));

            let removed: Vec<_> = previous
                .iter()
                .filter(|old| !discovered.iter().any(|new| new == *old))
                .cloned()
                .collect();
            let mut added = Vec::new();
            for new in discovered {
                match previous.iter().find(|old| **old == new) {
                    Some(unchanged) => kept.push(unchanged.clone()),
                    None => {
                        added.push(new.clone());
                        kept.push(new);
                    }
                }
            }
            kept.sort_by(|a, b| preference_order(a, b));
            state.collection = kept;
            EnvironmentsChanged::new(self.kind, removed, added)
        };

        if !batch.is_empty() {
            debug!(
                "[registry:{}] {} environment changes",
                self.kind,
                batch.changes.len()
            );
            let _ = self.environments_tx.send(batch);
        }
        self.rebuild_selections().await;
    }

    /// Recompute every project's selection and the global default from the
    /// persisted assignments and the current collection.
    async fn rebuild_selections(&self) {
        let collection = self.environments();
        let persisted = self.assignments.all();
        let mut project_map = HashMap::new();

        let mut roots: Vec<PathBuf> = self
            .projects
            .projects()
            .into_iter()
            .map(|project| project.root)
            .collect();
        // Assignments made for paths outside every known project.
        for root in persisted.keys() {
            if !roots.contains(root) {
                roots.push(root.clone());
            }
        }

        for root in roots {
            let mut chosen = None;
            if let Some(assignment) = persisted.get(&root) {
                chosen = collection
                    .iter()
                    .find(|env| env.matches_path(&assignment.environment_path))
                    .cloned();
                if chosen.is_none() && !path_exists(&assignment.environment_path).await {
                    debug!(
                        "[registry:{}] Clearing stale assignment for {:?}",
                        self.kind, root
                    );
                    if let Err(e) = self.assignments.set_project(&root, None) {
                        warn!("[registry:{}] Failed to clear stale assignment: {}", self.kind, e);
                    }
                }
            }
            if let Some(env) = chosen.or_else(|| select_for_project(&collection, &root)) {
                project_map.insert(root, env);
            }
        }

        let mut global = None;
        if let Some(assignment) = self.assignments.global() {
            global = collection
                .iter()
                .find(|env| env.matches_path(&assignment.environment_path))
                .cloned();
            if global.is_none() && !path_exists(&assignment.environment_path).await {
                if let Err(e) = self.assignments.set_global(None) {
                    warn!("[registry:{}] Failed to clear stale global: {}", self.kind, e);
                }
            }
        }
        let global = global.or_else(|| self.backend.default_global(&collection));

        let changes = {
            let mut state = self.state.lock().unwrap();
            let mut changes = Vec::new();
            for (root, new) in &project_map {
                let old = state.project_map.get(root);
                if !same_environment(old, Some(new)) {
                    changes.push((Some(root.clone()), old.cloned(), Some(new.clone())));
                }
            }
            for (root, old) in &state.project_map {
                if !project_map.contains_key(root) {
                    changes.push((Some(root.clone()), Some(old.clone()), None));
                }
            }
            if !same_environment(state.global.as_ref(), global.as_ref()) {
                changes.push((None, state.global.clone(), global.clone()));
            }
            state.project_map = project_map;
            state.global = global;
            changes
        };
        for (project, old, new) in changes {
            self.notify_selection(project, old, new);
        }
    }

    /// Add one environment to the collection, publishing it as a change.
    fn adopt(&self, env: Arc<PythonEnvironment>) -> Arc<PythonEnvironment> {
        let (env, batch) = {
            let mut state = self.state.lock().unwrap();
            match state.collection.iter().position(|known| known.id == env.id) {
                Some(index) if state.collection[index] == env => {
                    return state.collection[index].clone();
                }
                Some(index) => {
                    let old = std::mem::replace(&mut state.collection[index], env.clone());
                    (env.clone(), EnvironmentsChanged::new(self.kind, vec![old], vec![env]))
                }
                None => {
                    state.collection.push(env.clone());
                    state.collection.sort_by(|a, b| preference_order(a, b));
                    (env.clone(), EnvironmentsChanged::new(self.kind, vec![], vec![env]))
                }
            }
        };
        let _ = self.environments_tx.send(batch);
        env
    }

    /// Resolve a path this registry may not know yet (an interpreter or an
    /// environment directory). Returns `None` when it belongs to another
    /// backend or is not an environment, so the next registry can try.
    pub async fn resolve(&self, path: &Path) -> Option<Arc<PythonEnvironment>> {
        self.initialize().await;
        if let Some(env) = self.state.lock().unwrap().find(path) {
            return Some(env);
        }

        let is_dir = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        let executable = if is_dir {
            venv_interpreter(path)
        } else {
            path.to_path_buf()
        };

        let info = match self.discovery.resolve(&executable, &self.cancel).await {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                debug!("[registry:{}] Could not resolve {:?}: {}", self.kind, path, e);
                return None;
            }
        };
        let env = self.backend.build(&info)?;
        info!("[registry:{}] Adopting {}", self.kind, env.display_name);
        Some(self.adopt(Arc::new(env)))
    }

    /// Create an environment for the project owning `scope` and select it.
    pub async fn create(
        &self,
        scope: &Path,
        cancel: &CancellationToken,
    ) -> Result<Arc<PythonEnvironment>, RegistryError> {
        self.initialize().await;
        let root = self.project_root(scope);
        let created = self.backend.create(&root, cancel).await?;

        let mut info = created.clone();
        if let Some(executable) = &created.executable {
            match self.discovery.resolve(executable, &self.cancel).await {
                Ok(Some(mut resolved)) if resolved.kind.is_some_and(|k| self.kind.owns(k)) => {
                    resolved.project.get_or_insert_with(|| root.clone());
                    info = resolved;
                }
                Ok(_) => {}
                Err(e) => debug!("[registry:{}] Resolve after create failed: {}", self.kind, e),
            }
        }

        let env = self
            .backend
            .build(&info)
            .ok_or_else(|| RegistryError::NotFound {
                backend: self.kind,
                path: root.clone(),
            })?;
        let env = self.adopt(Arc::new(env));
        self.set(SetScope::Project(root), Some(env.clone())).await?;
        Ok(env)
    }

    /// Delete an environment from disk and forget it.
    pub async fn remove(
        &self,
        environment: &PythonEnvironment,
        cancel: &CancellationToken,
    ) -> Result<(), RegistryError> {
        if environment.backend != self.kind {
            return Err(RegistryError::WrongBackend {
                id: environment.id.to_string(),
                expected: self.kind,
                actual: environment.backend,
            });
        }
        self.initialize().await;
        let _guard = self.update_lock.lock().await;
        self.backend.remove(environment, cancel).await?;

        let removed = {
            let mut state = self.state.lock().unwrap();
            let index = state
                .collection
                .iter()
                .position(|env| env.id == environment.id);
            index.map(|index| state.collection.remove(index))
        };
        if let Some(removed) = removed {
            let _ = self
                .environments_tx
                .send(EnvironmentsChanged::new(self.kind, vec![removed], vec![]));
        }

        for (root, assignment) in self.assignments.all() {
            if environment.matches_path(&assignment.environment_path) {
                self.assignments.set_project(&root, None)?;
            }
        }
        if self
            .assignments
            .global()
            .is_some_and(|a| environment.matches_path(&a.environment_path))
        {
            self.assignments.set_global(None)?;
        }
        self.rebuild_selections().await;
        Ok(())
    }

    /// Forget every persisted assignment for this backend.
    pub fn clear_cache(&self) -> Result<(), RegistryError> {
        self.assignments.clear()?;
        let mut state = self.state.lock().unwrap();
        state.project_map.clear();
        state.global = self.backend.default_global(&state.collection);
        Ok(())
    }

    /// Cancel in-flight discovery started by this registry.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn shutdown_handle(self: &Arc<Self>) -> ShutdownHandle {
        let registry = self.clone();
        ShutdownHandle::from_fn(move || registry.shutdown())
    }
}

fn without(
    collection: &[Arc<PythonEnvironment>],
    stale: &PythonEnvironment,
) -> Vec<Arc<PythonEnvironment>> {
    collection
        .iter()
        .filter(|env| env.id != stale.id)
        .cloned()
        .collect()
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnvironmentId;
    use env_discovery::NativeEnvKind;

    fn env(prefix: &str, version: &str, project: Option<&str>) -> Arc<PythonEnvironment> {
        let prefix = PathBuf::from(prefix);
        Arc::new(PythonEnvironment {
            id: EnvironmentId::new(BackendKind::Venv, &prefix),
            backend: BackendKind::Venv,
            kind: NativeEnvKind::Venv,
            name: prefix.file_name().unwrap().to_string_lossy().into_owned(),
            display_name: format!("Python {version}"),
            version: Some(version.to_string()),
            environment_path: prefix.join("bin").join("python"),
            sys_prefix: prefix,
            exec_info: None,
            group: None,
            project: project.map(PathBuf::from),
        })
    }

    #[cfg(unix)]
    #[test]
    fn test_single_candidate_is_selected() {
        let collection = vec![env("/work/p/.venv", "3.10.0", None)];
        let picked = select_for_project(&collection, Path::new("/work/p")).unwrap();
        assert_eq!(picked.sys_prefix, PathBuf::from("/work/p/.venv"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exact_project_match_wins_among_several() {
        let collection = vec![
            env("/work/p/a/.venv", "3.12.0", Some("/work/p/a")),
            env("/work/p/b/.venv", "3.10.0", Some("/work/p")),
        ];
        let picked = select_for_project(&collection, Path::new("/work/p")).unwrap();
        assert_eq!(picked.version.as_deref(), Some("3.10.0"));
    }

    #[cfg(unix)]
    #[test]
    fn test_several_candidates_without_match_pick_nothing() {
        let collection = vec![
            env("/work/p/a/.venv", "3.12.0", Some("/work/p/a")),
            env("/work/p/b/.venv", "3.10.0", Some("/work/p/b")),
            env("/elsewhere/.venv", "3.13.0", None),
        ];
        assert!(select_for_project(&collection, Path::new("/work/p")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_newest_exact_match_preferred() {
        let collection = vec![
            env("/work/p/old", "3.9.0", Some("/work/p")),
            env("/work/p/new", "3.12.0", Some("/work/p")),
        ];
        let picked = select_for_project(&collection, Path::new("/work/p")).unwrap();
        assert_eq!(picked.version.as_deref(), Some("3.12.0"));
    }
}
