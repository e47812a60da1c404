//! Conda environments, driven through the `conda` executable.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use env_discovery::{NativeEnvInfo, NativeEnvKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::info;
use tokio_util::sync::CancellationToken;

use super::{base_record, Backend};
use crate::error::RegistryError;
use crate::model::{
    preference_order, BackendKind, CommandLine, EnvironmentGroup, ExecInfo, PythonEnvironment,
    ShellKind,
};
use crate::tools::run_tool;

/// Directory name used for environments created here.
pub const CONDA_DIR: &str = ".conda";

const BASE: &str = "base";

pub struct CondaBackend {
    conda: PathBuf,
}

fn conda_interpreter(prefix: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        prefix.join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        prefix.join("bin").join("python")
    }
}

impl CondaBackend {
    pub fn new(conda: impl Into<PathBuf>) -> Self {
        Self {
            conda: conda.into(),
        }
    }

    pub fn conda(&self) -> &Path {
        &self.conda
    }

    /// Named environments live under an `envs` directory (or are `base`);
    /// everything else is addressed by prefix.
    fn group_of(env: &PythonEnvironment) -> EnvironmentGroup {
        let under_envs = env
            .sys_prefix
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|dir| dir == "envs");
        if under_envs || env.name == BASE {
            EnvironmentGroup::Named
        } else {
            EnvironmentGroup::Prefix
        }
    }

    fn exec_info(&self, env: &PythonEnvironment, group: EnvironmentGroup) -> ExecInfo {
        let conda = self.conda.to_string_lossy().into_owned();
        let prefix = env.sys_prefix.to_string_lossy().into_owned();
        let target = match group {
            EnvironmentGroup::Named => env.name.clone(),
            EnvironmentGroup::Prefix => prefix.clone(),
        };

        let mut info = ExecInfo::new(CommandLine::new(
            env.environment_path.to_string_lossy().into_owned(),
        ));
        info.activated_run = Some(
            CommandLine::new(conda.clone())
                .arg("run")
                .arg("--prefix")
                .arg(prefix)
                .arg("python"),
        );
        info.activation.insert(
            ShellKind::Unknown,
            vec![CommandLine::new(conda.clone()).arg("activate").arg(target)],
        );
        info.deactivation.insert(
            ShellKind::Unknown,
            vec![CommandLine::new(conda).arg("deactivate")],
        );
        info
    }
}

impl Backend for CondaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Conda
    }

    fn build(&self, info: &NativeEnvInfo) -> Option<PythonEnvironment> {
        let mut env = base_record(BackendKind::Conda, info, conda_interpreter)?;
        let group = Self::group_of(&env);
        env.exec_info = Some(self.exec_info(&env, group));
        env.group = Some(group);
        Some(env)
    }

    /// `base` when present, else the newest environment.
    fn default_global(&self, environments: &[Arc<PythonEnvironment>]) -> Option<Arc<PythonEnvironment>> {
        environments
            .iter()
            .find(|env| env.name == BASE)
            .or_else(|| environments.iter().min_by(|a, b| preference_order(a, b)))
            .cloned()
    }

    fn create<'a>(
        &'a self,
        project: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<NativeEnvInfo, RegistryError>> {
        async move {
            let prefix = project.join(CONDA_DIR);
            info!("[registry:conda] Creating {:?}", prefix);
            run_tool(
                &self.conda,
                [
                    OsStr::new("create"),
                    OsStr::new("--prefix"),
                    prefix.as_os_str(),
                    OsStr::new("python"),
                    OsStr::new("--yes"),
                ],
                cancel,
            )
            .await?;

            Ok(NativeEnvInfo {
                name: Some(CONDA_DIR.to_string()),
                executable: Some(conda_interpreter(&prefix)),
                kind: Some(NativeEnvKind::Conda),
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
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), RegistryError>> {
        async move {
            info!("[registry:conda] Removing {:?}", environment.sys_prefix);
            run_tool(
                &self.conda,
                [
                    OsStr::new("env"),
                    OsStr::new("remove"),
                    OsStr::new("--prefix"),
                    environment.sys_prefix.as_os_str(),
                    OsStr::new("--yes"),
                ],
                cancel,
            )
            .await?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn conda_env(prefix: &str, name: Option<&str>, version: &str) -> PythonEnvironment {
        CondaBackend::new("/opt/conda/bin/conda")
            .build(&NativeEnvInfo {
                prefix: Some(PathBuf::from(prefix)),
                name: name.map(String::from),
                kind: Some(NativeEnvKind::Conda),
                version: Some(version.to_string()),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_groups_and_activation_target() {
        let named = conda_env("/opt/conda/envs/ml", Some("ml"), "3.11.5");
        assert_eq!(named.group, Some(EnvironmentGroup::Named));
        let activate = &named.exec_info.as_ref().unwrap().activation_for(ShellKind::Zsh).unwrap()[0];
        assert_eq!(activate.args, vec!["activate", "ml"]);

        let prefixed = conda_env("/work/app/.conda", None, "3.12.0");
        assert_eq!(prefixed.group, Some(EnvironmentGroup::Prefix));
        let exec = prefixed.exec_info.as_ref().unwrap();
        assert_eq!(
            exec.activation_for(ShellKind::Fish).unwrap()[0].args,
            vec!["activate", "/work/app/.conda"]
        );
        assert_eq!(
            exec.activated_run.as_ref().unwrap().args,
            vec!["run", "--prefix", "/work/app/.conda", "python"]
        );
        assert_eq!(
            exec.deactivation_for(ShellKind::Bash).unwrap()[0].args,
            vec!["deactivate"]
        );
    }

    #[test]
    fn test_global_prefers_base() {
        let backend = CondaBackend::new("conda");
        let envs = vec![
            Arc::new(conda_env("/opt/conda/envs/new", Some("new"), "3.12.0")),
            Arc::new(conda_env("/opt/conda", Some("base"), "3.9.0")),
        ];
        assert_eq!(backend.default_global(&envs).unwrap().name, "base");

        let without_base = vec![
            Arc::new(conda_env("/opt/conda/envs/old", Some("old"), "3.8.0")),
            Arc::new(conda_env("/opt/conda/envs/new", Some("new"), "3.12.0")),
        ];
        assert_eq!(backend.default_global(&without_base).unwrap().name, "new");
    }
}
