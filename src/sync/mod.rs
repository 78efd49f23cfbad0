//! Bundle-based synchronization with the air-gapped server.
//!
//! Three workflows share one shape: connect, move one bundle across, apply
//! it on the receiving side, then tidy up. Each runs as a small state
//! machine and records the steps it reached in a [`SyncSession`].
//!
//! ```text
//! pull:   Idle → Connected → RemoteSnapshotted → Transferred → Merged
//!              → RemoteCleaned → [UpstreamForwarded] → Done
//! push:   Idle → LocalSnapshotted → Connected → Transferred → RemoteApplied
//!              → RemoteCleaned → Done
//! backup: Idle → Connected → RemoteSnapshotted → Transferred → RemoteCleaned → Done
//! ```
//!
//! Failures before the apply step are terminal. Cleanup and upstream
//! forwarding are best effort: their failures become warnings on the session
//! and never change its outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! use gitsynq::sync::{PullOptions, SyncPlan, SyncWorkflow};
//!
//! let plan = SyncPlan::from_config(&config, &repo_root);
//! let workflow = SyncWorkflow::new(connector, plan, reporter);
//! let session = workflow.pull(&PullOptions::default());
//! if let Some(err) = session.error() {
//!     eprintln!("{err}");
//! }
//! ```

mod backup;
mod pull;
mod push;
pub mod scripts;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;

use crate::bundle::{self, BundleArtifact, BundleRole};
use crate::config::Config;
use crate::git::{GitError, LocalRepo};
use crate::remote::{Connector, RemoteError, RemoteSession, TransferDirection, join_remote};
use crate::ui::Reporter;

/// Errors that end a sync session.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Could not open a session to the server: {0}")]
    Connect(#[from] RemoteError),

    #[error("Failed to create bundle on server: {reason}")]
    RemoteBundleCreation { reason: String, output: String },

    #[error("Failed to create local bundle: {0}")]
    LocalBundle(#[source] GitError),

    #[error("Bundle transfer failed: {0}")]
    Transfer(#[source] RemoteError),

    #[error("Could not check out '{branch}': {source}")]
    Checkout {
        branch: String,
        #[source]
        source: GitError,
    },

    #[error("Merge failed: {0}")]
    MergeConflict(#[source] GitError),

    #[error("Failed to apply bundle on server: {reason}")]
    RemoteApply { reason: String, output: String },

    #[error("{} is not a git repository", .0.display())]
    NotARepository(PathBuf),
}

impl SyncError {
    /// What the operator should do next.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Connect(e) => e.hint(),
            Self::RemoteBundleCreation { .. } => Some(
                "Check that the project exists on the server and that git is installed there"
                    .into(),
            ),
            Self::Transfer(_) => Some(
                "The bundle is still on the server; run the command again to retry".into(),
            ),
            Self::Checkout { branch, .. } => Some(format!(
                "Commit or stash local changes, check out '{branch}' and pull again"
            )),
            Self::MergeConflict(_) => Some("You may need to resolve conflicts manually".into()),
            Self::RemoteApply { .. } => Some(
                "The uploaded bundle was kept on the server; fix the repository there and retry"
                    .into(),
            ),
            Self::LocalBundle(_) | Self::NotARepository(_) => None,
        }
    }

    /// Captured command output worth showing alongside the error.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::RemoteBundleCreation { output, .. } | Self::RemoteApply { output, .. } => {
                Some(output.as_str()).filter(|o| !o.trim().is_empty())
            }
            Self::LocalBundle(e) | Self::MergeConflict(e) => e.output(),
            Self::Checkout { source, .. } => source.output(),
            _ => None,
        }
    }

    /// Wrap a failed remote script, keeping whatever it printed.
    fn remote_bundle_creation(err: RemoteError) -> Self {
        let reason = err.to_string();
        let output = match err {
            RemoteError::RemoteCommandFailed { output, .. } => output,
            _ => String::new(),
        };
        Self::RemoteBundleCreation { reason, output }
    }

    fn remote_apply(err: RemoteError) -> Self {
        let reason = err.to_string();
        let output = match err {
            RemoteError::RemoteCommandFailed { output, .. } => output,
            _ => String::new(),
        };
        Self::RemoteApply { reason, output }
    }
}

/// Which way the bundle travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Local commits to the server.
    Push,
    /// Server commits to the local repository.
    Pull,
    /// Server snapshot into the backup directory.
    Backup,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// Milestones of a workflow, in the order they can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Idle,
    LocalSnapshotted,
    Connected,
    RemoteSnapshotted,
    Transferred,
    Merged,
    RemoteApplied,
    RemoteCleaned,
    UpstreamForwarded,
    Done,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::LocalSnapshotted => "local bundle created",
            Self::Connected => "connected",
            Self::RemoteSnapshotted => "remote bundle created",
            Self::Transferred => "transferred",
            Self::Merged => "merged",
            Self::RemoteApplied => "applied on server",
            Self::RemoteCleaned => "remote bundle removed",
            Self::UpstreamForwarded => "pushed to origin",
            Self::Done => "done",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug)]
pub enum SessionStatus {
    Running,
    Succeeded,
    Failed(SyncError),
}

/// Record of one workflow run. Returned to the caller, never persisted.
#[derive(Debug)]
pub struct SyncSession {
    pub direction: SyncDirection,
    /// Steps reached, in order, starting with [`SyncStep::Idle`].
    pub steps: Vec<SyncStep>,
    pub warnings: Vec<String>,
    pub artifact: Option<BundleArtifact>,
    pub status: SessionStatus,
    pub duration: Duration,
    started: Instant,
}

impl SyncSession {
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            steps: vec![SyncStep::Idle],
            warnings: Vec::new(),
            artifact: None,
            status: SessionStatus::Running,
            duration: Duration::ZERO,
            started: Instant::now(),
        }
    }

    pub fn reach(&mut self, step: SyncStep) {
        tracing::debug!(direction = %self.direction, %step, "sync step reached");
        self.steps.push(step);
    }

    pub fn has_reached(&self, step: SyncStep) -> bool {
        self.steps.contains(&step)
    }

    pub fn last_step(&self) -> SyncStep {
        self.steps.last().copied().unwrap_or(SyncStep::Idle)
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, SessionStatus::Succeeded)
    }

    pub fn error(&self) -> Option<&SyncError> {
        match &self.status {
            SessionStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything a workflow needs to know about the project, resolved up front.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub project: String,
    pub branch: String,
    /// Directory on the server holding the project repository and bundles.
    pub remote_root: String,
    pub repo_root: PathBuf,
    pub bundle_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub max_history: usize,
}

impl SyncPlan {
    pub fn from_config(config: &Config, repo_root: &Path) -> Self {
        Self {
            project: config.project.name.clone(),
            branch: config.project.branch.clone(),
            remote_root: config.server.remote_path.clone(),
            repo_root: repo_root.to_path_buf(),
            bundle_dir: config.resolve_path(repo_root, &config.bundle.directory),
            backup_dir: config.resolve_path(repo_root, &config.bundle.backup_directory),
            max_history: config.bundle.max_history,
        }
    }

    /// Path of the project repository on the server.
    pub fn remote_repo_path(&self) -> String {
        join_remote(&self.remote_root, &self.project)
    }

    fn artifact(&self, role: BundleRole, local_dir: &Path) -> BundleArtifact {
        let name = bundle::bundle_name(&self.project, &role, &Local::now());
        BundleArtifact::new(name, &self.remote_root, local_dir)
    }
}

/// Remove a truncated download so history only holds complete bundles.
fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial bundle"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "could not remove partial bundle");
        }
    }
}

/// Options for [`SyncWorkflow::pull`].
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Push the merged branch to `origin` afterwards.
    pub forward_upstream: bool,
}

/// Runs sync sessions against one server for one project.
pub struct SyncWorkflow<C: Connector> {
    connector: C,
    plan: SyncPlan,
    repo: LocalRepo,
    reporter: Arc<dyn Reporter>,
}

impl<C: Connector> SyncWorkflow<C> {
    pub fn new(connector: C, plan: SyncPlan, reporter: Arc<dyn Reporter>) -> Self {
        let repo = LocalRepo::new(&plan.repo_root);
        Self {
            connector,
            plan,
            repo,
            reporter,
        }
    }

    pub fn plan(&self) -> &SyncPlan {
        &self.plan
    }

    fn ensure_repository(&self) -> Result<(), SyncError> {
        if self.repo.is_repository() {
            Ok(())
        } else {
            Err(SyncError::NotARepository(self.plan.repo_root.clone()))
        }
    }

    fn connect_step(&self) {
        self.reporter
            .step(&format!("Connecting to {}...", self.connector.describe()));
    }

    fn connected(&self, record: &mut SyncSession) {
        record.reach(SyncStep::Connected);
        self.reporter
            .success(&format!("Connected to {}", self.connector.describe()));
    }

    /// Move the artifact across, mirroring progress into the reporter.
    fn transfer(
        &self,
        remote: &mut C::Session,
        direction: TransferDirection,
        artifact: &mut BundleArtifact,
    ) -> Result<u64, RemoteError> {
        let reporter = Arc::clone(&self.reporter);
        let mut started = false;
        let name = artifact.name.clone();
        let mut on_progress = |bytes: u64, total: Option<u64>| {
            if !started {
                reporter.transfer_started(direction, &name, total);
                started = true;
            }
            reporter.transfer_progress(bytes, total);
        };

        let bytes = remote.transfer(
            direction,
            &artifact.local_path,
            &artifact.remote_path,
            &mut on_progress,
        )?;
        artifact.size = Some(bytes);
        self.reporter.transfer_finished(bytes);
        tracing::info!(%direction, bundle = %artifact.name, bytes, "bundle transferred");
        Ok(bytes)
    }

    /// Best-effort removal of the remote bundle.
    fn clean_remote(&self, remote: &mut C::Session, record: &mut SyncSession, path: &str) {
        match remote.execute(&scripts::remove_file(path)) {
            Ok(_) => record.reach(SyncStep::RemoteCleaned),
            Err(e) => self.warn(record, format!("Could not remove {path} from the server: {e}")),
        }
    }

    fn prune_history(&self, record: &mut SyncSession) {
        match bundle::prune_history(&self.plan.bundle_dir, self.plan.max_history) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(count = removed.len(), "pruned old bundles");
            }
            Ok(_) => {}
            Err(e) => self.warn(record, format!("Could not prune bundle history: {e}")),
        }
    }

    fn warn(&self, record: &mut SyncSession, message: String) {
        tracing::debug!(direction = %record.direction, "{message}");
        self.reporter.warning(&message);
        record.warnings.push(message);
    }

    /// Settle the session's terminal status and tell the operator.
    fn conclude(&self, mut record: SyncSession, result: Result<(), SyncError>) -> SyncSession {
        record.duration = record.started.elapsed();
        match result {
            Ok(()) => {
                record.reach(SyncStep::Done);
                tracing::info!(
                    direction = %record.direction,
                    warnings = record.warnings.len(),
                    duration_ms = record.duration.as_millis() as u64,
                    "sync session finished"
                );
                record.status = SessionStatus::Succeeded;
            }
            Err(e) => {
                tracing::info!(
                    direction = %record.direction,
                    step = %record.last_step(),
                    error = %e,
                    "sync session failed"
                );
                self.reporter.failure(&e.to_string());
                if let Some(output) = e.output() {
                    self.reporter.info(output.trim());
                }
                if let Some(hint) = e.hint() {
                    self.reporter.info(&hint);
                }
                record.status = SessionStatus::Failed(e);
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_records_steps() {
        let mut session = SyncSession::new(SyncDirection::Pull);
        assert_eq!(session.last_step(), SyncStep::Idle);
        session.reach(SyncStep::Connected);
        assert!(session.has_reached(SyncStep::Connected));
        assert!(!session.succeeded());
        assert!(session.error().is_none());
    }

    #[test]
    fn test_connect_errors_keep_remote_hint() {
        let err = SyncError::from(RemoteError::NoCredentialsAvailable);
        assert!(matches!(err, SyncError::Connect(_)));
        assert!(err.hint().unwrap().contains("ssh-agent"));
    }

    #[test]
    fn test_remote_failure_output_is_kept() {
        let err = SyncError::remote_bundle_creation(RemoteError::RemoteCommandFailed {
            status: 1,
            output: "fatal: not a git repository".into(),
        });
        assert_eq!(err.output(), Some("fatal: not a git repository"));
        assert!(err.to_string().contains("status 1"));
    }

    #[test]
    fn test_plan_remote_repo_path() {
        let plan = SyncPlan {
            project: "demo".into(),
            branch: "main".into(),
            remote_root: "~/projects/".into(),
            repo_root: PathBuf::from("/work/demo"),
            bundle_dir: PathBuf::from("/work/demo/.gitsync-bundles"),
            backup_dir: PathBuf::from("/work/demo/backups"),
            max_history: 10,
        };
        assert_eq!(plan.remote_repo_path(), "~/projects/demo");

        let artifact = plan.artifact(BundleRole::Server, &plan.bundle_dir);
        assert!(artifact.name.starts_with("demo-server-"));
        assert!(artifact.remote_path.starts_with("~/projects/demo-server-"));
    }
}
