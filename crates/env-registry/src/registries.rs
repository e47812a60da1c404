//! The set of registries for one session.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use env_discovery::{DiscoveryService, NativeInfo, RefreshScope, ShutdownHandle};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::backends::{CondaBackend, SystemBackend, VenvBackend};
use crate::model::{BackendKind, PythonEnvironment};
use crate::projects::ProjectSource;
use crate::registry::EnvironmentRegistry;
use crate::state::StateStore;
use crate::tools::Tools;

/// Every registered backend, in resolution order.
pub struct Registries {
    registries: Vec<Arc<EnvironmentRegistry>>,
    discovery: Arc<DiscoveryService>,
    shutdown: StdMutex<ShutdownHandle>,
}

impl Registries {
    /// Register venv, system and conda. Conda is skipped, with an info log,
    /// when no conda executable can be found.
    pub async fn register_all(
        discovery: Arc<DiscoveryService>,
        projects: Arc<dyn ProjectSource>,
        store: Arc<StateStore>,
        tools: Arc<Tools>,
    ) -> Self {
        let system = Arc::new(EnvironmentRegistry::new(
            Arc::new(SystemBackend),
            discovery.clone(),
            projects.clone(),
            store.clone(),
        ));
        let venv = Arc::new(EnvironmentRegistry::new(
            Arc::new(VenvBackend::new(tools.clone(), Some(system.clone()))),
            discovery.clone(),
            projects.clone(),
            store.clone(),
        ));
        let mut registries = vec![venv, system];

        let hint = match discovery
            .refresh(false, &RefreshScope::All, &CancellationToken::new())
            .await
        {
            Ok(items) => items
                .iter()
                .filter_map(NativeInfo::as_manager)
                .find(|manager| manager.tool.eq_ignore_ascii_case("conda"))
                .map(|manager| manager.executable.clone()),
            Err(e) => {
                debug!("[registry] No manager hint for conda: {}", e);
                None
            }
        };
        match tools.conda(hint.as_deref()).await {
            Some(conda) => registries.push(Arc::new(EnvironmentRegistry::new(
                Arc::new(CondaBackend::new(conda)),
                discovery.clone(),
                projects,
                store,
            ))),
            None => info!("[registry] Conda not found, conda environments are unavailable"),
        }

        Self::from_registries(discovery, registries)
    }

    /// Wrap registries built elsewhere. Resolution follows the given order.
    pub fn from_registries(
        discovery: Arc<DiscoveryService>,
        registries: Vec<Arc<EnvironmentRegistry>>,
    ) -> Self {
        let mut shutdown = ShutdownHandle::new();
        shutdown.adopt(discovery.shutdown_handle());
        for registry in &registries {
            shutdown.adopt(registry.shutdown_handle());
        }
        Self {
            registries,
            discovery,
            shutdown: StdMutex::new(shutdown),
        }
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<EnvironmentRegistry>> {
        self.registries.iter().find(|registry| registry.kind() == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EnvironmentRegistry>> {
        self.registries.iter()
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub async fn initialize(&self) {
        futures::future::join_all(self.registries.iter().map(|registry| registry.initialize())).await;
    }

    /// Ask each registry in turn; the first one that claims the path wins.
    pub async fn resolve(&self, path: &Path) -> Option<Arc<PythonEnvironment>> {
        for registry in &self.registries {
            if let Some(env) = registry.resolve(path).await {
                return Some(env);
            }
        }
        None
    }

    /// The environment that applies at `scope`: any registry's project
    /// selection first, then the first registry with a global default.
    pub async fn environment_for(&self, scope: Option<&Path>) -> Option<Arc<PythonEnvironment>> {
        if let Some(path) = scope {
            for registry in &self.registries {
                if let Some(env) = registry.get_project(path).await {
                    return Some(env);
                }
            }
        }
        for registry in &self.registries {
            if let Some(env) = registry.get(None).await {
                return Some(env);
            }
        }
        None
    }

    /// Release the worker and cancel everything in flight.
    pub fn shutdown(&self) {
        self.shutdown.lock().unwrap().shutdown();
    }
}
