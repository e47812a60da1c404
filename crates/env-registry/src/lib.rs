//! Per-backend registries of Python environments.
//!
//! Each backend (virtual environments, system interpreters, conda) gets an
//! [`EnvironmentRegistry`] holding:
//!
//! - the environments discovery found for it,
//! - which environment is selected for each open project,
//! - a global default for everything outside a project.
//!
//! Selections persist across restarts in a JSON [`StateStore`]. Registries
//! publish collection changes (removals before additions) and selection
//! changes over `tokio::sync::broadcast` channels.
//!
//! [`Registries`] bundles the backends for one session and tries them in
//! order when resolving an unknown path.

pub mod backends;
pub mod error;
pub mod events;
pub mod model;
pub mod projects;
pub mod registries;
pub mod registry;
pub mod state;
pub mod tools;

pub use backends::{Backend, CondaBackend, SystemBackend, VenvBackend};
pub use error::RegistryError;
pub use events::{ChangeKind, EnvironmentChange, EnvironmentChanged, EnvironmentsChanged};
pub use model::{
    BackendKind, CommandLine, EnvironmentGroup, EnvironmentId, ExecInfo, PythonEnvironment,
    ShellKind,
};
pub use projects::{normalize_path, Project, ProjectSource, StaticProjects};
pub use registries::Registries;
pub use registry::{EnvironmentRegistry, EnvironmentsScope, SetScope};
pub use state::{default_state_path, Assignment, Assignments, StateStore};
pub use tools::{run_tool, ToolError, Tools};
