//! External tools: cancellable subprocesses and memoized tool lookup.
//!
//! Probes are instance state on [`Tools`], not process globals. The first
//! successful probe is kept for the lifetime of the `Tools` value; a failed
//! probe is not cached, so a tool installed later is picked up on the next
//! call.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Error type for tool subprocesses.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0} was not found")]
    NotFound(String),

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to run tool: {0}")]
    Io(#[from] std::io::Error),

    /// The caller cancelled; the subprocess was killed.
    #[error("Tool invocation cancelled")]
    Cancelled,
}

/// Run `program args...` to completion and return its stdout.
///
/// Cancelling `cancel` kills the child and yields [`ToolError::Cancelled`].
pub async fn run_tool<I, S>(
    program: &Path,
    args: I,
    cancel: &CancellationToken,
) -> Result<String, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let tool = program.display().to_string();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!("[tools] Running {:?}", command.as_std());

    let child = command.spawn().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ToolError::NotFound(tool.clone())
        } else {
            ToolError::Io(e)
        }
    })?;

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            info!("[tools] Cancelled {}", tool);
            return Err(ToolError::Cancelled);
        }
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Interpreter names tried when looking for a base python.
#[cfg(target_os = "windows")]
const PYTHON_CANDIDATES: &[&str] = &["python", "py"];
#[cfg(not(target_os = "windows"))]
const PYTHON_CANDIDATES: &[&str] = &["python3", "python"];

/// Lazily probed tool locations.
#[derive(Debug, Default)]
pub struct Tools {
    conda_override: Option<PathBuf>,
    /// Only try the override and the worker's hint, never `conda` on PATH.
    no_path_lookup: bool,
    conda: OnceCell<PathBuf>,
    python: OnceCell<PathBuf>,
}

impl Tools {
    pub fn new(conda_override: Option<PathBuf>) -> Self {
        Self {
            conda_override,
            ..Default::default()
        }
    }

    pub fn without_path_lookup(mut self) -> Self {
        self.no_path_lookup = true;
        self
    }

    /// Find a working conda: the configured override, then `manager_hint`
    /// (the executable the worker reported), then `conda` on PATH.
    pub async fn conda(&self, manager_hint: Option<&Path>) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        candidates.extend(self.conda_override.clone());
        candidates.extend(manager_hint.map(Path::to_path_buf));
        if !self.no_path_lookup {
            candidates.push(PathBuf::from("conda"));
        }

        self.conda
            .get_or_try_init(|| first_working(candidates, "conda"))
            .await
            .ok()
            .cloned()
    }

    /// Find a python on PATH to create virtual environments with.
    pub async fn base_python(&self) -> Option<PathBuf> {
        let candidates = PYTHON_CANDIDATES.iter().map(PathBuf::from).collect();
        self.python
            .get_or_try_init(|| first_working(candidates, "python"))
            .await
            .ok()
            .cloned()
    }
}

/// Return the first candidate that answers `--version`.
async fn first_working(candidates: Vec<PathBuf>, tool: &str) -> Result<PathBuf, ToolError> {
    let cancel = CancellationToken::new();
    for candidate in candidates {
        match run_tool(&candidate, ["--version"], &cancel).await {
            Ok(version) => {
                info!("[tools] Using {} at {:?} ({})", tool, candidate, version.trim());
                return Ok(candidate);
            }
            Err(e) => debug!("[tools] {:?} is not usable: {}", candidate, e),
        }
    }
    Err(ToolError::NotFound(tool.to_string()))
}
