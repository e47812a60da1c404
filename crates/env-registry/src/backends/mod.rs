//! Backend-specific behavior: which environments a registry owns, how their
//! records and activation commands are built, and how they are created and
//! removed.

pub mod conda;
pub mod system;
pub mod venv;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use env_discovery::NativeEnvInfo;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::model::{
    display_name, BackendKind, CommandLine, EnvironmentId, ExecInfo, PythonEnvironment, ShellKind,
};

pub use conda::CondaBackend;
pub use system::SystemBackend;
pub use venv::VenvBackend;

pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Turn a worker record into an environment, or `None` when the record is
    /// not one of ours or lacks an interpreter.
    fn build(&self, info: &NativeEnvInfo) -> Option<PythonEnvironment>;

    /// Global default when nothing is persisted.
    fn default_global(&self, _environments: &[Arc<PythonEnvironment>]) -> Option<Arc<PythonEnvironment>> {
        None
    }

    /// Create an environment for `project`. Returns what is known about the
    /// new environment before the worker has resolved it.
    fn create<'a>(
        &'a self,
        _project: &'a Path,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<NativeEnvInfo, RegistryError>> {
        let backend = self.kind();
        async move {
            Err(RegistryError::Unsupported {
                backend,
                operation: "create",
            })
        }
        .boxed()
    }

    fn remove<'a>(
        &'a self,
        _environment: &'a PythonEnvironment,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), RegistryError>> {
        let backend = self.kind();
        async move {
            Err(RegistryError::Unsupported {
                backend,
                operation: "remove",
            })
        }
        .boxed()
    }
}

/// Directory holding a virtual environment's scripts.
pub(crate) fn scripts_dir(prefix: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        prefix.join("Scripts")
    }
    #[cfg(not(target_os = "windows"))]
    {
        prefix.join("bin")
    }
}

/// Interpreter inside a virtual environment.
pub(crate) fn venv_interpreter(prefix: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        scripts_dir(prefix).join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        scripts_dir(prefix).join("python")
    }
}

/// Prefix owning `executable`: the parent of its `bin`/`Scripts` directory,
/// or its own directory for layouts with the interpreter at the root.
fn prefix_of(executable: &Path) -> Option<PathBuf> {
    let dir = executable.parent()?;
    let in_scripts = dir
        .file_name()
        .map(|name| name == "bin" || name == "Scripts")
        .unwrap_or(false);
    if in_scripts {
        dir.parent().map(Path::to_path_buf)
    } else {
        Some(dir.to_path_buf())
    }
}

/// The fields every backend fills the same way. `interpreter_in` locates the
/// interpreter when the worker only reported a prefix.
pub(crate) fn base_record(
    backend: BackendKind,
    info: &NativeEnvInfo,
    interpreter_in: fn(&Path) -> PathBuf,
) -> Option<PythonEnvironment> {
    let kind = info.kind?;
    if !backend.owns(kind) {
        return None;
    }
    let environment_path = info
        .executable
        .clone()
        .or_else(|| info.prefix.as_deref().map(interpreter_in))?;
    let sys_prefix = info
        .prefix
        .clone()
        .or_else(|| prefix_of(&environment_path))?;
    let name = info
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| sys_prefix.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "python".to_string());

    // System interpreters routinely share one prefix (`/usr`).
    let identity = match backend {
        BackendKind::System => &environment_path,
        BackendKind::Venv | BackendKind::Conda => &sys_prefix,
    };

    Some(PythonEnvironment {
        id: EnvironmentId::new(backend, identity),
        backend,
        kind,
        display_name: display_name(info.version.as_deref(), Some(name.as_str())),
        name,
        version: info.version.clone(),
        environment_path,
        sys_prefix,
        exec_info: None,
        group: None,
        project: info.project.clone(),
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Activation tables for a virtual environment whose scripts live in `bin`.
pub(crate) fn venv_exec_info(executable: &Path) -> ExecInfo {
    let run = CommandLine::new(path_arg(executable));
    let mut info = ExecInfo::new(run.clone());
    info.activated_run = Some(run);

    let Some(bin) = executable.parent() else {
        return info;
    };
    let script = |name: &str| path_arg(&bin.join(name));
    let source = |name: &str| vec![CommandLine::new("source").arg(script(name))];

    for shell in [ShellKind::Bash, ShellKind::Zsh, ShellKind::Sh, ShellKind::Unknown] {
        info.activation.insert(shell, source("activate"));
    }
    // Git Bash on Windows wants forward slashes.
    info.activation.insert(
        ShellKind::GitBash,
        vec![CommandLine::new("source").arg(script("activate").replace('\\', "/"))],
    );
    info.activation.insert(ShellKind::Fish, source("activate.fish"));
    info.activation.insert(ShellKind::Csh, source("activate.csh"));
    info.activation.insert(ShellKind::Tcsh, source("activate.csh"));
    info.activation.insert(
        ShellKind::Nu,
        vec![CommandLine::new("overlay").arg("use").arg(script("activate.nu"))],
    );
    info.activation.insert(
        ShellKind::Pwsh,
        vec![CommandLine::new("&").arg(script("Activate.ps1"))],
    );
    info.activation
        .insert(ShellKind::Cmd, vec![CommandLine::new(script("activate.bat"))]);

    info.deactivation
        .insert(ShellKind::Unknown, vec![CommandLine::new("deactivate")]);
    info.deactivation.insert(
        ShellKind::Nu,
        vec![CommandLine::new("overlay").arg("hide").arg("activate")],
    );
    info
}
