//! The terminal surface the controller drives.
//!
//! Terminals are owned by a host (an editor, a multiplexer). The controller
//! only needs to send input, optionally run commands through shell
//! integration, and hear about terminals opening and closing.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use env_registry::{PythonEnvironment, Registries, ShellKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(Uuid);

impl TerminalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TerminalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reported by shell integration once a command has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandCompletion {
    pub exit_code: Option<i32>,
}

/// A terminal capability that runs a command and reports when it is done.
pub trait ShellIntegration: Send + Sync {
    fn execute_command(&self, command: String) -> BoxFuture<'_, anyhow::Result<CommandCompletion>>;
}

pub trait Terminal: Send + Sync {
    fn id(&self) -> TerminalId;

    fn name(&self) -> String;

    fn shell(&self) -> ShellKind;

    /// Initial working directory, used to pick the environment on open.
    fn cwd(&self) -> Option<PathBuf>;

    /// Present once the shell has announced integration support. May appear
    /// some time after the terminal opens, or never.
    fn shell_integration(&self) -> Option<Arc<dyn ShellIntegration>>;

    /// Send one line of input. The host appends the newline.
    fn send_text(&self, text: &str) -> anyhow::Result<()>;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct TerminalOptions {
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

#[derive(Clone)]
pub enum TerminalEvent {
    Opened(Arc<dyn Terminal>),
    Closed(TerminalId),
}

/// Creates terminals and reports their lifecycle.
pub trait TerminalHost: Send + Sync {
    fn create_terminal(&self, options: TerminalOptions) -> anyhow::Result<Arc<dyn Terminal>>;

    fn terminals(&self) -> Vec<Arc<dyn Terminal>>;

    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent>;
}

/// Which environment applies to a terminal opened in a directory.
pub trait EnvironmentSource: Send + Sync {
    fn environment_for<'a>(
        &'a self,
        scope: Option<&'a Path>,
    ) -> BoxFuture<'a, Option<Arc<PythonEnvironment>>>;
}

impl EnvironmentSource for Registries {
    fn environment_for<'a>(
        &'a self,
        scope: Option<&'a Path>,
    ) -> BoxFuture<'a, Option<Arc<PythonEnvironment>>> {
        Registries::environment_for(self, scope).boxed()
    }
}
