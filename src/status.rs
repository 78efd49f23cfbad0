//! Read-only comparison of the local repository and its server copy.
//!
//! Nothing here creates artifacts or changes either side; running the
//! comparator twice over unchanged repositories reports the same facts.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::git::{GitError, LocalRepo};
use crate::remote::{Connector, RemoteError, RemoteSession, with_session};
use crate::sync::scripts;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Failed to inspect local repository: {0}")]
    Local(#[from] GitError),

    #[error("Failed to query server: {0}")]
    Remote(#[from] RemoteError),
}

/// Facts reported by the server-side status script. Missing keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteRepoState {
    pub exists: Option<bool>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub clean: Option<bool>,
    pub dirty_files: Option<usize>,
    /// Output lines that were not `KEY:value` pairs.
    #[serde(skip)]
    pub ignored_lines: usize,
}

/// Parse `KEY:value` lines leniently.
///
/// Lines without a colon, unknown keys and unparsable values are skipped;
/// the output of a remote shell is not trusted to be stable.
pub fn parse_remote_status(output: &str) -> RemoteRepoState {
    let mut state = RemoteRepoState::default();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            state.ignored_lines += 1;
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "EXISTS" => state.exists = parse_bool(value),
            "BRANCH" => state.branch = Some(value.to_string()).filter(|v| !v.is_empty()),
            "COMMIT" => state.last_commit = Some(value.to_string()).filter(|v| !v.is_empty()),
            "CLEAN" => state.clean = parse_bool(value),
            "CHANGES" => state.dirty_files = value.parse().ok(),
            other => tracing::debug!(key = other, "ignoring unknown status key"),
        }
    }
    state
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Facts about the local working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalRepoState {
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub dirty_files: usize,
    /// Commits ahead of the tracked upstream; `None` without an upstream.
    pub unpushed_commits: Option<usize>,
}

impl LocalRepoState {
    pub fn inspect(repo: &LocalRepo) -> Result<Self, GitError> {
        Ok(Self {
            branch: repo.current_branch()?,
            last_commit: repo.last_commit(),
            dirty_files: repo.dirty_files()?,
            unpushed_commits: repo.unpushed_commits(),
        })
    }
}

/// Suggested next action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Recommendation {
    CommitLocalChanges { files: usize },
    InitializeRemote,
    CommitRemoteChanges { files: usize },
    Push,
    Pull,
    ForwardUpstream { commits: usize },
    InSync,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommitLocalChanges { files } => write!(
                f,
                "Commit your {files} local change(s); only committed work is synced"
            ),
            Self::InitializeRemote => {
                write!(f, "Run 'gitsync push' to create the repository on the server")
            }
            Self::CommitRemoteChanges { files } => write!(
                f,
                "Commit the {files} change(s) on the server before pulling them"
            ),
            Self::Push => write!(f, "Run 'gitsync push' if you have local changes to sync"),
            Self::Pull => write!(f, "Run 'gitsync pull' if you worked on the server"),
            Self::ForwardUpstream { commits } => write!(
                f,
                "{commits} commit(s) not on origin yet; run 'gitsync pull --push' or 'git push'"
            ),
            Self::InSync => write!(f, "Local and server are at the same commit"),
        }
    }
}

/// How the server's HEAD relates to the local HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitRelation {
    Same,
    /// The server HEAD is an ancestor of the local HEAD.
    LocalAhead,
    /// The server has commits this repository lacks.
    RemoteAhead,
    Diverged,
}

impl CommitRelation {
    /// Place the server commit summary (`<hash> <subject>`) relative to HEAD.
    /// `None` when either side has no commit to compare.
    pub fn between(
        repo: &LocalRepo,
        local: &LocalRepoState,
        remote: &RemoteRepoState,
    ) -> Option<Self> {
        let local_commit = local.last_commit.as_deref()?;
        let remote_commit = remote.last_commit.as_deref()?;
        if same_commit(local_commit, remote_commit) {
            return Some(Self::Same);
        }
        let hash = remote_commit.split_whitespace().next()?;
        if !repo.has_commit(hash) {
            return Some(Self::RemoteAhead);
        }
        Some(if repo.is_ancestor(hash, "HEAD") {
            Self::LocalAhead
        } else if repo.is_ancestor("HEAD", hash) {
            Self::RemoteAhead
        } else {
            Self::Diverged
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub local: LocalRepoState,
    pub remote: Option<RemoteRepoState>,
    pub relation: Option<CommitRelation>,
    /// Why the server could not be queried.
    pub remote_error: Option<String>,
    pub recommendations: Vec<Recommendation>,
}

/// Where a diff was measured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffBase {
    /// The server's HEAD commit.
    RemoteHead(String),
    /// The local tracking branch, used when the server is out of reach.
    Upstream { reference: String, reason: String },
}

impl fmt::Display for DiffBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteHead(commit) => {
                write!(f, "remote HEAD ({})", commit.get(..7).unwrap_or(commit))
            }
            Self::Upstream { reference, .. } => write!(f, "{reference}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffReport {
    pub base: DiffBase,
    /// Local commits the base does not have, newest first.
    pub commits: Vec<String>,
    /// `git diff --stat` between the base and HEAD.
    pub stat: String,
    /// The base commit is unknown locally; pull before diffing.
    pub base_missing_locally: bool,
}

/// Compares local and server state for one project.
pub struct StatusComparator<C: Connector> {
    connector: C,
    repo: LocalRepo,
    remote_repo: String,
    branch: String,
}

impl<C: Connector> StatusComparator<C> {
    pub fn new(
        connector: C,
        repo: LocalRepo,
        remote_repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            repo,
            remote_repo: remote_repo.into(),
            branch: branch.into(),
        }
    }

    /// Inspect both sides. An unreachable server degrades the report
    /// instead of failing it.
    pub fn compare(&self) -> Result<StatusReport, StatusError> {
        let local = LocalRepoState::inspect(&self.repo)?;

        let (remote, remote_error) = match self.remote_state() {
            Ok(state) => (Some(state), None),
            Err(e) => {
                tracing::info!(error = %e, "server status unavailable");
                (None, Some(e.to_string()))
            }
        };

        let relation = remote
            .as_ref()
            .and_then(|remote| CommitRelation::between(&self.repo, &local, remote));
        let recommendations = recommend(&local, remote.as_ref(), relation);
        Ok(StatusReport {
            local,
            remote,
            relation,
            remote_error,
            recommendations,
        })
    }

    pub fn remote_state(&self) -> Result<RemoteRepoState, RemoteError> {
        let output = with_session(&self.connector, |session| {
            session.execute(&scripts::status_script(&self.remote_repo))
        })?;
        let state = parse_remote_status(&output);
        if state.ignored_lines > 0 {
            tracing::debug!(ignored = state.ignored_lines, "ignored malformed status lines");
        }
        Ok(state)
    }

    /// What the next push would carry. Falls back to `origin/<branch>` when
    /// the server cannot be reached.
    pub fn diff(&self) -> Result<DiffReport, StatusError> {
        let head = with_session(&self.connector, |session| {
            session.execute(&scripts::head_script(&self.remote_repo))
        });

        let base = match head {
            Ok(output) => DiffBase::RemoteHead(output.trim().to_string()),
            Err(e) if e.is_connect_failure() => {
                tracing::info!(error = %e, "server unreachable, diffing against upstream");
                DiffBase::Upstream {
                    reference: format!("origin/{}", self.branch),
                    reason: e.to_string(),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let reference = match &base {
            DiffBase::RemoteHead(commit) => commit.as_str(),
            DiffBase::Upstream { reference, .. } => reference.as_str(),
        };

        if !self.repo.has_commit(reference) {
            return Ok(DiffReport {
                base,
                commits: Vec::new(),
                stat: String::new(),
                base_missing_locally: true,
            });
        }

        Ok(DiffReport {
            commits: self.repo.commits_since(reference)?,
            stat: self.repo.diff_stat(reference)?,
            base,
            base_missing_locally: false,
        })
    }
}

/// Derive next actions from both states. Without a known `relation` both
/// directions are offered.
pub fn recommend(
    local: &LocalRepoState,
    remote: Option<&RemoteRepoState>,
    relation: Option<CommitRelation>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if local.dirty_files > 0 {
        out.push(Recommendation::CommitLocalChanges {
            files: local.dirty_files,
        });
    }

    if let Some(remote) = remote {
        if remote.exists == Some(false) {
            out.push(Recommendation::InitializeRemote);
        } else {
            if remote.clean == Some(false) {
                out.push(Recommendation::CommitRemoteChanges {
                    files: remote.dirty_files.unwrap_or(0),
                });
            }
            match relation {
                Some(CommitRelation::Same) => out.push(Recommendation::InSync),
                Some(CommitRelation::LocalAhead) => out.push(Recommendation::Push),
                Some(CommitRelation::RemoteAhead) => out.push(Recommendation::Pull),
                // Merge the server's work first, then send the result back.
                Some(CommitRelation::Diverged) | None => {
                    out.push(Recommendation::Pull);
                    out.push(Recommendation::Push);
                }
            }
        }
    }

    if let Some(commits) = local.unpushed_commits.filter(|&n| n > 0) {
        out.push(Recommendation::ForwardUpstream { commits });
    }
    out
}

/// Compare two `--oneline` summaries by hash, tolerating different
/// abbreviation lengths.
fn same_commit(a: &str, b: &str) -> bool {
    let (Some(a), Some(b)) = (a.split_whitespace().next(), b.split_whitespace().next()) else {
        return false;
    };
    a.starts_with(b) || b.starts_with(a)
}
