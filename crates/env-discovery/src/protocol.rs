//! Wire protocol for the discovery worker.
//!
//! The worker speaks JSON-RPC 2.0 over its stdio. Requests flow from us to the
//! worker (`configure`, `refresh`, `resolve`); the worker streams
//! `environment` / `manager` notifications while a refresh is running and may
//! send `log` / `telemetry` notifications at any time.
//!
//! Field names are camelCase on the wire.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_CONFIGURE: &str = "configure";
pub const METHOD_REFRESH: &str = "refresh";
pub const METHOD_RESOLVE: &str = "resolve";

/// Kind of environment as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeEnvKind {
    Conda,
    Pixi,
    Homebrew,
    Pyenv,
    GlobalPaths,
    PyenvVirtualEnv,
    Pipenv,
    Poetry,
    MacPythonOrg,
    MacCommandLineTools,
    LinuxGlobal,
    MacXCode,
    Venv,
    VenvUv,
    VirtualEnv,
    VirtualEnvWrapper,
    WindowsStore,
    WindowsRegistry,
    #[serde(other)]
    Unknown,
}

impl NativeEnvKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeEnvKind::Conda => "Conda",
            NativeEnvKind::Pixi => "Pixi",
            NativeEnvKind::Homebrew => "Homebrew",
            NativeEnvKind::Pyenv => "Pyenv",
            NativeEnvKind::GlobalPaths => "GlobalPaths",
            NativeEnvKind::PyenvVirtualEnv => "PyenvVirtualEnv",
            NativeEnvKind::Pipenv => "Pipenv",
            NativeEnvKind::Poetry => "Poetry",
            NativeEnvKind::MacPythonOrg => "MacPythonOrg",
            NativeEnvKind::MacCommandLineTools => "MacCommandLineTools",
            NativeEnvKind::LinuxGlobal => "LinuxGlobal",
            NativeEnvKind::MacXCode => "MacXCode",
            NativeEnvKind::Venv => "Venv",
            NativeEnvKind::VenvUv => "VenvUv",
            NativeEnvKind::VirtualEnv => "VirtualEnv",
            NativeEnvKind::VirtualEnvWrapper => "VirtualEnvWrapper",
            NativeEnvKind::WindowsStore => "WindowsStore",
            NativeEnvKind::WindowsRegistry => "WindowsRegistry",
            NativeEnvKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for NativeEnvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NativeEnvKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .ok()
            .filter(|kind| *kind != NativeEnvKind::Unknown)
            .ok_or_else(|| format!("unknown environment kind: {s}"))
    }
}

/// A tool that manages environments (conda, poetry, pyenv, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeEnvManagerInfo {
    pub tool: String,
    pub executable: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// An environment as reported by the worker. Every field is optional; a
/// streamed environment may be missing `version` or `prefix` until it has
/// been resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeEnvInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NativeEnvKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<NativeEnvManagerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlinks: Option<Vec<PathBuf>>,
}

impl NativeEnvInfo {
    /// Whether the worker left out version or prefix and a `resolve`
    /// follow-up is needed to complete the record.
    pub fn is_incomplete(&self) -> bool {
        self.version.is_none() || self.prefix.is_none()
    }
}

/// One item of a refresh result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeInfo {
    Environment(NativeEnvInfo),
    Manager(NativeEnvManagerInfo),
}

impl NativeInfo {
    pub fn as_environment(&self) -> Option<&NativeEnvInfo> {
        match self {
            NativeInfo::Environment(env) => Some(env),
            NativeInfo::Manager(_) => None,
        }
    }

    pub fn as_manager(&self) -> Option<&NativeEnvManagerInfo> {
        match self {
            NativeInfo::Environment(_) => None,
            NativeInfo::Manager(manager) => Some(manager),
        }
    }
}

/// Parameters for `configure`. Must be sent before any other request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureOptions {
    pub workspace_directories: Vec<PathBuf>,
    pub environment_directories: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poetry_executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_directory: Option<PathBuf>,
}

/// Parameters for `refresh`. Both fields absent means "search everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_kind: Option<NativeEnvKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_paths: Option<Vec<PathBuf>>,
}

/// Result of `refresh`, sent once all notifications have been streamed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    /// Scan duration in milliseconds.
    #[serde(default)]
    pub duration: u64,
}

/// Parameters for `resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveParams {
    pub executable: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
    #[serde(other)]
    Unknown,
}

impl WorkerLogLevel {
    pub fn to_log_level(self) -> log::Level {
        match self {
            WorkerLogLevel::Error => log::Level::Error,
            WorkerLogLevel::Warning => log::Level::Warn,
            WorkerLogLevel::Info => log::Level::Info,
            WorkerLogLevel::Debug | WorkerLogLevel::Unknown => log::Level::Debug,
            WorkerLogLevel::Trace => log::Level::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: WorkerLogLevel,
    pub message: String,
}

/// Notifications the worker can send.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Environment(NativeEnvInfo),
    Manager(NativeEnvManagerInfo),
    Log(LogMessage),
    Telemetry(Value),
    Other { method: String, params: Value },
}

impl Notification {
    /// Build a typed notification from a method name and its params.
    pub fn from_parts(method: &str, params: Value) -> Result<Self, serde_json::Error> {
        Ok(match method {
            "environment" => Notification::Environment(serde_json::from_value(params)?),
            "manager" => Notification::Manager(serde_json::from_value(params)?),
            "log" => Notification::Log(serde_json::from_value(params)?),
            "telemetry" => Notification::Telemetry(params),
            other => Notification::Other {
                method: other.to_string(),
                params,
            },
        })
    }
}

/// Outgoing request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RequestMessage<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Any message read from the worker, before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RpcErrorObject>,
    },
    Notification(Notification),
    /// A request from the worker. We never serve these.
    Request { id: u64, method: String },
}

impl IncomingMessage {
    pub fn classify(self) -> Result<Incoming, serde_json::Error> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Ok(Incoming::Request { id, method }),
            (None, Some(method)) => Ok(Incoming::Notification(Notification::from_parts(
                &method,
                self.params,
            )?)),
            (Some(id), None) => {
                let outcome = match self.error {
                    Some(error) => Err(error),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Ok(Incoming::Response { id, outcome })
            }
            (None, None) => Err(serde::de::Error::custom(
                "message has neither an id nor a method",
            )),
        }
    }
}
