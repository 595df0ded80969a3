//! Persistent settings.
//!
//! Settings live in a JSON file (default `~/.config/picluster/config.json`).
//! Passwords are never part of the schema.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::board::{self, BoardKind};
use crate::gateway::DEFAULT_PROGRAM;
use crate::provision::{
    NodeConnectionSpec, PollConfig, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_WAIT_BUDGET_SECS,
};

/// Environment variable overriding the settings path.
pub const CONFIG_ENV: &str = "PICLUSTER_CONFIG";

/// Errors reading, writing or validating settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Filesystem error.
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed settings file.
    #[error("Failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Home directory could not be determined.
    #[error("Could not determine home directory")]
    NoHome,

    /// Settings values out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Network mode of the ClusterHAT image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// NAT through the controller (`pN.local` hostnames).
    #[default]
    Cnat,
    /// Bridged onto the LAN.
    Cbridge,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cnat => write!(f, "cnat"),
            Self::Cbridge => write!(f, "cbridge"),
        }
    }
}

/// Stored SSH parameters for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSsh {
    /// SSH destination.
    pub user_host: String,
    /// Private key path.
    pub keyfile: PathBuf,
}

impl NodeSsh {
    /// Default entry: `pi@<label>.local` with `~/.ssh/id_rsa`.
    #[must_use]
    pub fn default_for(label: &str) -> Self {
        Self {
            user_host: format!("pi@{label}.local"),
            keyfile: default_keyfile(),
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Selected board, `None` to auto-detect.
    pub board: Option<BoardKind>,
    /// Network mode.
    pub mode: NetworkMode,
    /// Board control program.
    pub program: String,
    /// Reachability wait budget in seconds.
    pub wait_budget_secs: u64,
    /// Reachability poll interval in seconds.
    pub poll_interval_secs: u64,
    /// Per-node SSH parameters.
    pub ssh: BTreeMap<String, NodeSsh>,
    /// Last save time.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        let max = board::max_node_count();
        let ssh = (1..=max)
            .map(|i| {
                let label = format!("p{i}");
                let entry = NodeSsh::default_for(&label);
                (label, entry)
            })
            .collect();

        Self {
            board: None,
            mode: NetworkMode::default(),
            program: DEFAULT_PROGRAM.to_string(),
            wait_budget_secs: DEFAULT_WAIT_BUDGET_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            ssh,
            updated_at: None,
        }
    }
}

impl Settings {
    /// Default settings path.
    ///
    /// # Errors
    /// Returns [`ConfigError::NoHome`] when no config directory is known.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("picluster").join("config.json"))
            .ok_or(ConfigError::NoHome)
    }

    /// Load settings, falling back to defaults when the file is missing.
    ///
    /// Missing node entries are filled in from the defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        for (label, entry) in Self::default().ssh {
            settings.ssh.entry(label).or_insert(entry);
        }

        info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Write settings, creating the parent directory.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self, path: &Path) -> Result<(), ConfigError> {
        self.updated_at = Some(Utc::now());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                action: "create directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            action: "write",
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Saved settings");
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for a zero poll interval or a wait
    /// budget shorter than one interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.wait_budget_secs < self.poll_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "wait_budget_secs ({}) must be at least poll_interval_secs ({})",
                self.wait_budget_secs, self.poll_interval_secs
            )));
        }
        if self.program.trim().is_empty() {
            return Err(ConfigError::Invalid("program must not be empty".to_string()));
        }
        Ok(())
    }

    /// Reachability wait settings.
    #[must_use]
    pub fn poll_config(&self) -> PollConfig {
        PollConfig::from_secs(self.wait_budget_secs, self.poll_interval_secs)
    }

    /// SSH parameters for `label`, defaulted when not stored.
    #[must_use]
    pub fn node_ssh(&self, label: &str) -> NodeSsh {
        self.ssh
            .get(label)
            .cloned()
            .unwrap_or_else(|| NodeSsh::default_for(label))
    }

    /// Store SSH parameters for `label`.
    pub fn set_node_ssh(&mut self, label: impl Into<String>, ssh: NodeSsh) {
        self.ssh.insert(label.into(), ssh);
    }

    /// Connection spec for `label` without a password.
    #[must_use]
    pub fn connection(&self, label: &str) -> NodeConnectionSpec {
        let ssh = self.node_ssh(label);
        NodeConnectionSpec::new(label, ssh.user_host, ssh.keyfile)
    }
}

/// `~/.ssh/id_rsa`, or a relative `.ssh/id_rsa` without a home directory.
#[must_use]
pub fn default_keyfile() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("id_rsa")
}

/// Create `~/.ssh` with mode 0700 if it does not exist.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_ssh_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".ssh");
    ensure_private_dir(&dir)?;
    Ok(dir)
}

fn ensure_private_dir(dir: &Path) -> Result<(), ConfigError> {
    if dir.is_dir() {
        return Ok(());
    }

    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
        action: "create directory",
        path: dir.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(
            |source| ConfigError::Io {
                action: "set permissions on",
                path: dir.to_path_buf(),
                source,
            },
        )?;
    }

    debug!(path = %dir.display(), "Created private directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_node() {
        let settings = Settings::default();
        assert_eq!(settings.ssh.len(), 6);
        assert_eq!(settings.ssh["p3"].user_host, "pi@p3.local");
        assert!(settings.ssh["p3"].keyfile.ends_with(".ssh/id_rsa"));
        assert_eq!(settings.program, "clusterctrl");
        assert_eq!(settings.poll_config(), PollConfig::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_merges_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"board":"triple","poll_interval_secs":2,"ssh":{"p1":{"user_host":"admin@10.0.0.11","keyfile":"/keys/p1"}}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.board, Some(BoardKind::Triple));
        assert_eq!(settings.poll_interval_secs, 2);
        assert_eq!(settings.wait_budget_secs, 120);
        assert_eq!(settings.ssh["p1"].user_host, "admin@10.0.0.11");
        assert_eq!(settings.ssh["p6"].user_host, "pi@p6.local");
        assert_eq!(settings.mode, NetworkMode::Cnat);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_round_trip_without_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut settings = Settings::default();
        settings.board = Some(BoardKind::A6);
        settings.set_node_ssh(
            "p2",
            NodeSsh {
                user_host: "pi@172.19.181.2".to_string(),
                keyfile: PathBuf::from("/keys/cluster"),
            },
        );
        settings.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("password"));

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.board, Some(BoardKind::A6));
        assert_eq!(loaded.ssh["p2"].user_host, "pi@172.19.181.2");
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_validate_rejects_bad_poll_values() {
        let mut settings = Settings::default();
        settings.poll_interval_secs = 0;
        assert!(settings.validate().is_err());

        settings.poll_interval_secs = 10;
        settings.wait_budget_secs = 5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_connection_has_no_password() {
        let settings = Settings::default();
        let spec = settings.connection("p2");
        assert_eq!(spec.label, "p2");
        assert_eq!(spec.user_host, "pi@p2.local");
        assert!(spec.password.is_none());
    }

    #[test]
    fn test_ensure_private_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join(".ssh");
        ensure_private_dir(&ssh).unwrap();
        assert!(ssh.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&ssh).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
