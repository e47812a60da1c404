//! Interpreters installed on the machine (distro packages, python.org,
//! Homebrew, pyenv, Windows Store). Read-only.

use std::path::Path;
use std::sync::Arc;

use env_discovery::NativeEnvInfo;

use super::{base_record, Backend};
use crate::model::{preference_order, BackendKind, CommandLine, ExecInfo, PythonEnvironment};

#[derive(Debug, Default)]
pub struct SystemBackend;

fn system_interpreter(prefix: &Path) -> std::path::PathBuf {
    #[cfg(target_os = "windows")]
    {
        prefix.join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        prefix.join("bin").join("python3")
    }
}

impl Backend for SystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::System
    }

    fn build(&self, info: &NativeEnvInfo) -> Option<PythonEnvironment> {
        let mut env = base_record(BackendKind::System, info, system_interpreter)?;
        let run = CommandLine::new(env.environment_path.to_string_lossy().into_owned());
        let mut exec_info = ExecInfo::new(run.clone());
        exec_info.activated_run = Some(run);
        env.exec_info = Some(exec_info);
        Some(env)
    }

    /// The newest interpreter.
    fn default_global(&self, environments: &[Arc<PythonEnvironment>]) -> Option<Arc<PythonEnvironment>> {
        environments
            .iter()
            .min_by(|a, b| preference_order(a, b))
            .cloned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use env_discovery::NativeEnvKind;
    use std::path::PathBuf;

    fn system(executable: &str, version: &str) -> Arc<PythonEnvironment> {
        Arc::new(
            SystemBackend
                .build(&NativeEnvInfo {
                    executable: Some(PathBuf::from(executable)),
                    prefix: Some(PathBuf::from("/usr")),
                    kind: Some(NativeEnvKind::LinuxGlobal),
                    version: Some(version.to_string()),
                    ..Default::default()
                })
                .unwrap(),
        )
    }

    #[test]
    fn test_system_has_no_activation() {
        let env = system("/usr/bin/python3.11", "3.11.2");
        let exec = env.exec_info.as_ref().unwrap();
        assert!(exec.activation.is_empty());
        assert_eq!(exec.run.executable, "/usr/bin/python3.11");
    }

    #[test]
    fn test_global_is_highest_version() {
        let envs = vec![
            system("/usr/bin/python3.9", "3.9.18"),
            system("/usr/local/bin/python3.12", "3.12.1"),
            system("/usr/bin/python3.11", "3.11.2"),
        ];
        let global = SystemBackend.default_global(&envs).unwrap();
        assert_eq!(global.version.as_deref(), Some("3.12.1"));
    }
}
