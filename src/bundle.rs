//! Bundle artifact naming and the local bundle history.
//!
//! Every bundle is named `{project}-{role}-{YYYYmmdd-HHMMSS}.bundle`. The
//! timestamp has second resolution, so two snapshots of the same role taken
//! in the same second share a name and the later one overwrites the earlier.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;

use crate::remote::join_remote;

/// File extension of git bundles.
pub const BUNDLE_EXTENSION: &str = "bundle";

/// Timestamp embedded in bundle names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Length of a rendered [`TIMESTAMP_FORMAT`].
const TIMESTAMP_LEN: usize = 15;

/// What a bundle is a snapshot of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleRole {
    /// Snapshot of the remote repository, taken for a pull.
    Server,
    /// Snapshot of the local repository, taken for a push.
    Local,
    /// Archival snapshot of the remote repository.
    Backup,
    Custom(String),
}

impl fmt::Display for BundleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Local => write!(f, "local"),
            Self::Backup => write!(f, "backup"),
            Self::Custom(role) => write!(f, "{role}"),
        }
    }
}

/// Deterministic bundle file name for `project`, `role` and `timestamp`.
pub fn bundle_name<Tz>(project: &str, role: &BundleRole, timestamp: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!(
        "{project}-{role}-{}.{BUNDLE_EXTENSION}",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

/// One bundle in flight: where it lives on each side of the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleArtifact {
    pub name: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Bytes moved by the transfer, once it has happened.
    pub size: Option<u64>,
}

impl BundleArtifact {
    pub fn new(name: impl Into<String>, remote_dir: &str, local_dir: &Path) -> Self {
        let name = name.into();
        Self {
            remote_path: join_remote(remote_dir, &name),
            local_path: local_dir.join(&name),
            name,
            size: None,
        }
    }
}

/// A bundle kept in the local bundle directory.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub created: DateTime<Local>,
}

/// Recover the creation time embedded in a bundle name.
pub fn parse_bundle_timestamp(name: &str) -> Option<DateTime<Local>> {
    let stem = name.strip_suffix(BUNDLE_EXTENSION)?.strip_suffix('.')?;
    let start = stem.len().checked_sub(TIMESTAMP_LEN)?;
    let raw = stem.get(start..)?;
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Every `.bundle` file in `dir`, newest first.
///
/// A directory that does not exist yet is an empty history.
pub fn list_history(dir: &Path) -> io::Result<Vec<HistoryEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut history = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXTENSION) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let created = parse_bundle_timestamp(&name).unwrap_or_else(|| {
            DateTime::<Local>::from(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH))
        });
        history.push(HistoryEntry {
            name,
            path,
            size: metadata.len(),
            created,
        });
    }

    history.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));
    Ok(history)
}

/// Delete the oldest bundles so at most `keep` remain. Returns what was removed.
///
/// A bundle that cannot be removed is logged and skipped.
pub fn prune_history(dir: &Path, keep: usize) -> io::Result<Vec<PathBuf>> {
    let history = list_history(dir)?;
    let mut removed = Vec::new();
    for entry in history.into_iter().skip(keep) {
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                tracing::debug!(path = %entry.path.display(), "pruned old bundle");
                removed.push(entry.path);
            }
            Err(e) => {
                tracing::warn!(path = %entry.path.display(), error = %e, "failed to prune bundle");
            }
        }
    }
    Ok(removed)
}
