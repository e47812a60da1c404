//! Settings persistence for envctl.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/pyenvs/settings.json
//! - Linux: ~/.config/pyenvs/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\pyenvs\settings.json

use std::path::{Path, PathBuf};

use env_discovery::DiscoveryConfig;
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker binary and search locations
    pub discovery: DiscoveryConfig,

    /// Where project assignments are kept (default: ~/.cache/pyenvs/state.json)
    pub state_file: Option<PathBuf>,

    /// Project roots known in addition to the ones named on the command line
    pub projects: Vec<PathBuf>,
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pyenvs")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if the file doesn't exist
/// or can't be parsed
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()));
    match parsed {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[settings] Ignoring {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.discovery.worker_path, PathBuf::from("pet"));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"discovery": {"worker_path": "/opt/pet/bin/pet"}, "projects": ["/work/app"]}"#,
        )
        .unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.discovery.worker_path, PathBuf::from("/opt/pet/bin/pet"));
        assert!(settings.discovery.cache_directory.is_some());
        assert_eq!(settings.projects, vec![PathBuf::from("/work/app")]);
        assert!(settings.state_file.is_none());
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), Settings::default());
    }
}
