//! Project settings stored in `.gitsync.toml`.
//!
//! ```toml
//! [project]
//! name = "demo"
//! branch = "main"
//!
//! [server]
//! host = "192.168.12.4"
//! user = "prince"
//! port = 22
//! remote_path = "~/projects"
//! ssh_key_path = "~/.ssh/id_ed25519"
//!
//! [bundle]
//! directory = ".gitsync-bundles"
//! backup_directory = "backups"
//! max_history = 10
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteEndpoint;

pub const CONFIG_FILE: &str = ".gitsync.toml";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_BUNDLE_DIR: &str = ".gitsync-bundles";
pub const DEFAULT_BACKUP_DIR: &str = "backups";
pub const DEFAULT_MAX_HISTORY: usize = 10;

const GITIGNORE_FILE: &str = ".gitignore";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No .gitsync.toml found at {}. Run 'gitsync init' first", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config field '{0}' must not be empty")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory on the server that holds the project and in-flight bundles.
    pub remote_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default = "default_bundle_dir")]
    pub directory: String,
    #[serde(default = "default_backup_dir")]
    pub backup_directory: String,
    /// Bundles kept in `directory`; 0 means the default.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            directory: default_bundle_dir(),
            backup_directory: default_backup_dir(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bundle_dir() -> String {
    DEFAULT_BUNDLE_DIR.to_string()
}

fn default_backup_dir() -> String {
    DEFAULT_BACKUP_DIR.to_string()
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

impl Config {
    pub fn new(
        project: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            project: ProjectConfig {
                name: project.into(),
                branch: default_branch(),
            },
            server: ServerConfig {
                host: host.into(),
                user: user.into(),
                port: DEFAULT_PORT,
                remote_path: remote_path.into(),
                ssh_key_path: None,
            },
            bundle: BundleConfig::default(),
        }
    }

    /// Read, default and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), project = %config.project.name, "loaded config");
        Ok(config)
    }

    /// Parse TOML text, filling zero and empty values with defaults.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(text)?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.server.port == 0 {
            self.server.port = DEFAULT_PORT;
        }
        if self.project.branch.trim().is_empty() {
            self.project.branch = default_branch();
        }
        if self.bundle.directory.trim().is_empty() {
            self.bundle.directory = default_bundle_dir();
        }
        if self.bundle.backup_directory.trim().is_empty() {
            self.bundle.backup_directory = default_backup_dir();
        }
        if self.bundle.max_history == 0 {
            self.bundle.max_history = DEFAULT_MAX_HISTORY;
        }
        if self
            .server
            .ssh_key_path
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            self.server.ssh_key_path = None;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("project.name", &self.project.name),
            ("server.host", &self.server.host),
            ("server.user", &self.server.user),
            ("server.remote_path", &self.server.remote_path),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(field));
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "saved config");
        Ok(())
    }

    pub fn endpoint(&self) -> RemoteEndpoint {
        let endpoint = RemoteEndpoint::new(&self.server.host, self.server.port, &self.server.user);
        match &self.server.ssh_key_path {
            Some(key) => endpoint.with_key_path(key),
            None => endpoint,
        }
    }

    /// Resolve a configured directory against the repository root.
    pub fn resolve_path(&self, repo_root: &Path, configured: &str) -> PathBuf {
        let path = Path::new(configured);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_root.join(path)
        }
    }
}

/// Append ignore rules for bundles to `.gitignore` under `repo_root`,
/// skipping rules already present. Returns the rules that were added.
pub fn update_gitignore(repo_root: &Path, bundle_dir: &str) -> std::io::Result<Vec<String>> {
    let path = repo_root.join(GITIGNORE_FILE);
    let existing = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let wanted = [
        format!("{}/", bundle_dir.trim_end_matches('/')),
        "*.bundle".to_string(),
    ];
    let present: Vec<&str> = existing.lines().map(str::trim).collect();
    let missing: Vec<String> = wanted
        .into_iter()
        .filter(|rule| !present.contains(&rule.as_str()))
        .collect();
    if missing.is_empty() {
        return Ok(missing);
    }

    let mut text = existing;
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str("\n# GitSync\n");
    for rule in &missing {
        text.push_str(rule);
        text.push('\n');
    }
    fs::write(&path, text)?;
    Ok(missing)
}
