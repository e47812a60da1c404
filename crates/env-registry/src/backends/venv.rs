//! Virtual environments: venv, virtualenv, uv, pipenv, poetry, pyenv-virtualenv.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use env_discovery::{NativeEnvInfo, NativeEnvKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::info;
use tokio_util::sync::CancellationToken;

use super::{base_record, venv_exec_info, venv_interpreter, Backend};
use crate::error::RegistryError;
use crate::model::{BackendKind, PythonEnvironment};
use crate::registry::EnvironmentRegistry;
use crate::tools::{run_tool, ToolError, Tools};

/// Directory name used for environments created here.
pub const VENV_DIR: &str = ".venv";

pub struct VenvBackend {
    tools: Arc<Tools>,
    /// Where to look for the interpreter new environments are built from.
    system: Option<Arc<EnvironmentRegistry>>,
}

impl VenvBackend {
    pub fn new(tools: Arc<Tools>, system: Option<Arc<EnvironmentRegistry>>) -> Self {
        Self { tools, system }
    }

    /// The system registry's global, else the first python on PATH.
    async fn base_python(&self) -> Result<std::path::PathBuf, RegistryError> {
        if let Some(system) = &self.system {
            if let Some(env) = system.get(None).await {
                return Ok(env.environment_path.clone());
            }
        }
        self.tools
            .base_python()
            .await
            .ok_or_else(|| ToolError::NotFound("python".to_string()).into())
    }
}

impl Backend for VenvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Venv
    }

    fn build(&self, info: &NativeEnvInfo) -> Option<PythonEnvironment> {
        let mut env = base_record(BackendKind::Venv, info, venv_interpreter)?;
        env.exec_info = Some(venv_exec_info(&env.environment_path));
        Some(env)
    }

    fn create<'a>(
        &'a self,
        project: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<NativeEnvInfo, RegistryError>> {
        async move {
            let python = self.base_python().await?;
            let prefix = project.join(VENV_DIR);
            info!("[registry:venv] Creating {:?} with {:?}", prefix, python);

            run_tool(
                &python,
                [OsStr::new("-m"), OsStr::new("venv"), prefix.as_os_str()],
                cancel,
            )
            .await?;

            Ok(NativeEnvInfo {
                name: Some(VENV_DIR.to_string()),
                executable: Some(venv_interpreter(&prefix)),
                kind: Some(NativeEnvKind::Venv),
                prefix: Some(prefix),
                project: Some(project.to_path_buf()),
                ..Default::default()
            })
        }
        .boxed()
    }

    fn remove<'a>(
        &'a self,
        environment: &'a PythonEnvironment,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), RegistryError>> {
        async move {
            let prefix = &environment.sys_prefix;
            // Only delete directories that really are virtual environments.
            if !tokio::fs::try_exists(prefix.join("pyvenv.cfg")).await.unwrap_or(false) {
                return Err(RegistryError::NotFound {
                    backend: BackendKind::Venv,
                    path: prefix.clone(),
                });
            }
            info!("[registry:venv] Removing {:?}", prefix);
            tokio::fs::remove_dir_all(prefix).await?;
            Ok(())
        }
        .boxed()
    }
}
