//! Environment records and the types that describe how to use them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use env_discovery::NativeEnvKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A source of environments. Each backend has its own registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Venv,
    System,
    Conda,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Venv, BackendKind::System, BackendKind::Conda];

    /// Namespace for ids and persisted state.
    pub fn namespace(&self) -> &'static str {
        match self {
            BackendKind::Venv => "venv",
            BackendKind::System => "system",
            BackendKind::Conda => "conda",
        }
    }

    /// Whether environments of `kind` belong to this backend.
    pub fn owns(&self, kind: NativeEnvKind) -> bool {
        BackendKind::for_native_kind(kind) == Some(*self)
    }

    pub fn for_native_kind(kind: NativeEnvKind) -> Option<BackendKind> {
        match kind {
            NativeEnvKind::Venv
            | NativeEnvKind::VenvUv
            | NativeEnvKind::VirtualEnv
            | NativeEnvKind::VirtualEnvWrapper
            | NativeEnvKind::Pipenv
            | NativeEnvKind::Poetry
            | NativeEnvKind::PyenvVirtualEnv => Some(BackendKind::Venv),
            NativeEnvKind::GlobalPaths
            | NativeEnvKind::LinuxGlobal
            | NativeEnvKind::MacPythonOrg
            | NativeEnvKind::MacCommandLineTools
            | NativeEnvKind::MacXCode
            | NativeEnvKind::Homebrew
            | NativeEnvKind::Pyenv
            | NativeEnvKind::WindowsStore
            | NativeEnvKind::WindowsRegistry => Some(BackendKind::System),
            NativeEnvKind::Conda => Some(BackendKind::Conda),
            NativeEnvKind::Pixi | NativeEnvKind::Unknown => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "venv" => Ok(BackendKind::Venv),
            "system" => Ok(BackendKind::System),
            "conda" => Ok(BackendKind::Conda),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// `"{backend}:{first 12 hex chars of sha256(prefix)}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    pub fn new(backend: BackendKind, prefix: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(prefix.to_string_lossy().as_bytes());
        let hash = hex::encode(hasher.finalize());
        EnvironmentId(format!("{}:{}", backend.namespace(), &hash[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shells with distinct activation syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Zsh,
    Sh,
    Fish,
    Csh,
    Tcsh,
    Nu,
    Pwsh,
    Cmd,
    GitBash,
    Unknown,
}

impl ShellKind {
    /// Guess the shell from its executable path (`/bin/zsh`, `pwsh.exe`, ...).
    pub fn detect(shell_path: &Path) -> ShellKind {
        let name = shell_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let under_git = shell_path
            .components()
            .any(|c| c.as_os_str().to_string_lossy().eq_ignore_ascii_case("git"));
        if name == "bash" && under_git {
            return ShellKind::GitBash;
        }
        name.parse().unwrap_or(ShellKind::Unknown)
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Sh => "sh",
            ShellKind::Fish => "fish",
            ShellKind::Csh => "csh",
            ShellKind::Tcsh => "tcsh",
            ShellKind::Nu => "nu",
            ShellKind::Pwsh => "pwsh",
            ShellKind::Cmd => "cmd",
            ShellKind::GitBash => "gitbash",
            ShellKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for ShellKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bash" => Ok(ShellKind::Bash),
            "zsh" => Ok(ShellKind::Zsh),
            "sh" | "dash" => Ok(ShellKind::Sh),
            "fish" => Ok(ShellKind::Fish),
            "csh" => Ok(ShellKind::Csh),
            "tcsh" => Ok(ShellKind::Tcsh),
            "nu" | "nushell" => Ok(ShellKind::Nu),
            "pwsh" | "powershell" => Ok(ShellKind::Pwsh),
            "cmd" => Ok(ShellKind::Cmd),
            "gitbash" | "git-bash" => Ok(ShellKind::GitBash),
            other => Err(format!("unknown shell: {other}")),
        }
    }
}

/// One command: an executable plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandLine {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// How to run an environment's interpreter and how to activate it in a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecInfo {
    pub run: CommandLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_run: Option<CommandLine>,
    #[serde(default)]
    pub activation: HashMap<ShellKind, Vec<CommandLine>>,
    #[serde(default)]
    pub deactivation: HashMap<ShellKind, Vec<CommandLine>>,
}

impl ExecInfo {
    pub fn new(run: CommandLine) -> Self {
        Self {
            run,
            activated_run: None,
            activation: HashMap::new(),
            deactivation: HashMap::new(),
        }
    }

    /// Activation commands for `shell`, falling back to the `Unknown` entry.
    pub fn activation_for(&self, shell: ShellKind) -> Option<&[CommandLine]> {
        lookup(&self.activation, shell)
    }

    pub fn deactivation_for(&self, shell: ShellKind) -> Option<&[CommandLine]> {
        lookup(&self.deactivation, shell)
    }
}

fn lookup(table: &HashMap<ShellKind, Vec<CommandLine>>, shell: ShellKind) -> Option<&[CommandLine]> {
    table
        .get(&shell)
        .or_else(|| table.get(&ShellKind::Unknown))
        .map(Vec::as_slice)
}

/// How a conda environment is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentGroup {
    Named,
    Prefix,
}

/// A discovered environment. Never mutated; a re-discovery produces a new
/// record that replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonEnvironment {
    pub id: EnvironmentId,
    pub backend: BackendKind,
    pub kind: NativeEnvKind,
    pub name: String,
    pub display_name: String,
    pub version: Option<String>,
    /// The interpreter.
    pub environment_path: PathBuf,
    pub sys_prefix: PathBuf,
    pub exec_info: Option<ExecInfo>,
    pub group: Option<EnvironmentGroup>,
    /// Project the worker associated with this environment, if any.
    pub project: Option<PathBuf>,
}

impl PythonEnvironment {
    /// Whether this record describes `path`, given as an interpreter or a prefix.
    pub fn matches_path(&self, path: &Path) -> bool {
        self.environment_path == path || self.sys_prefix == path
    }

    /// Whether the environment lives in, or was created for, `root`.
    pub fn is_within(&self, root: &Path) -> bool {
        self.sys_prefix.starts_with(root)
            || self.project.as_deref().is_some_and(|p| p.starts_with(root))
    }
}

/// `Python 3.12.1 (.venv)`, or without the name when there is none.
pub fn display_name(version: Option<&str>, name: Option<&str>) -> String {
    let version = version.unwrap_or("(unknown version)");
    match name {
        Some(name) if !name.is_empty() => format!("Python {} ({})", version, name),
        _ => format!("Python {}", version),
    }
}

/// Numeric components of a version string: `"3.12.1rc1"` -> `[3, 12, 1]`.
fn version_parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Compare two optional versions; a missing version sorts lowest.
pub fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => version_parts(a).cmp(&version_parts(b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Version descending, then name, then interpreter path.
pub fn preference_order(a: &PythonEnvironment, b: &PythonEnvironment) -> Ordering {
    compare_versions(b.version.as_deref(), a.version.as_deref())
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.environment_path.cmp(&b.environment_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_ownership() {
        assert!(BackendKind::Venv.owns(NativeEnvKind::Poetry));
        assert!(BackendKind::System.owns(NativeEnvKind::Homebrew));
        assert!(BackendKind::Conda.owns(NativeEnvKind::Conda));
        assert!(!BackendKind::Venv.owns(NativeEnvKind::Conda));
        assert_eq!(BackendKind::for_native_kind(NativeEnvKind::Unknown), None);
    }

    #[test]
    fn test_environment_id() {
        let id = EnvironmentId::new(BackendKind::Venv, Path::new("/work/app/.venv"));
        let (namespace, hash) = id.as_str().split_once(':').unwrap();
        assert_eq!(namespace, "venv");
        assert_eq!(hash.len(), 12);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, EnvironmentId::new(BackendKind::Venv, Path::new("/work/app/.venv")));
        assert_ne!(id, EnvironmentId::new(BackendKind::Conda, Path::new("/work/app/.venv")));
    }

    #[test]
    fn test_shell_detection() {
        assert_eq!(ShellKind::detect(Path::new("/bin/zsh")), ShellKind::Zsh);
        assert_eq!(ShellKind::detect(Path::new("/usr/local/bin/fish")), ShellKind::Fish);
        assert_eq!(ShellKind::detect(Path::new("pwsh.exe")), ShellKind::Pwsh);
        assert_eq!(
            ShellKind::detect(Path::new("/c/Program Files/Git/bin/bash.exe")),
            ShellKind::GitBash
        );
        assert_eq!(ShellKind::detect(Path::new("/bin/xonsh")), ShellKind::Unknown);
    }

    #[test]
    fn test_activation_falls_back_to_unknown() {
        let mut info = ExecInfo::new(CommandLine::new("python"));
        info.activation.insert(
            ShellKind::Unknown,
            vec![CommandLine::new("source").arg("bin/activate")],
        );
        info.activation.insert(
            ShellKind::Fish,
            vec![CommandLine::new("source").arg("bin/activate.fish")],
        );

        assert_eq!(info.activation_for(ShellKind::Fish).unwrap()[0].args[0], "bin/activate.fish");
        assert_eq!(info.activation_for(ShellKind::Tcsh).unwrap()[0].args[0], "bin/activate");
        assert!(info.deactivation_for(ShellKind::Bash).is_none());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(Some("3.12.1"), Some(".venv")), "Python 3.12.1 (.venv)");
        assert_eq!(display_name(Some("3.11.0"), None), "Python 3.11.0");
    }

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions(Some("3.10.4"), Some("3.9.18")), Ordering::Greater);
        assert_eq!(compare_versions(Some("3.12.0rc1"), Some("3.12.0")), Ordering::Equal);
        assert_eq!(compare_versions(None, Some("2.7")), Ordering::Less);
    }
}
