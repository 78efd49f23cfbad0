//! Local repository interface.
//!
//! Everything here shells out to the system `git` binary. Bundle encoding,
//! merging and pushing are git's business; this module only runs the
//! commands and turns exit status plus captured output into results.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed: {}", output.trim())]
    CommandFailed { command: String, output: String },
}

impl GitError {
    /// Captured git output, when the command ran at all.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { output, .. } => Some(output),
            Self::Spawn(_) => None,
        }
    }
}

/// A working tree on this machine.
#[derive(Debug, Clone)]
pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `git --version`, independent of any repository.
    pub fn git_version() -> Result<String, GitError> {
        let output = git_command(None, ["--version"]).output()?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: "--version".into(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git inside the repository, returning trimmed stdout.
    pub fn run<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let command = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(repo = %self.root.display(), %command, "running git");

        let output = git_command(Some(&self.root), &args).output()?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(GitError::CommandFailed {
                command,
                output: text,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    pub fn is_repository(&self) -> bool {
        self.run(["rev-parse", "--git-dir"]).is_ok()
    }

    /// `git bundle create <path> --all`. The parent directory is created first.
    pub fn create_bundle(&self, path: &Path) -> Result<(), GitError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        self.run([
            OsStr::new("bundle"),
            OsStr::new("create"),
            path.as_os_str(),
            OsStr::new("--all"),
        ])?;
        Ok(())
    }

    /// Make `branch` the checked-out branch so a bundle can be merged into it.
    ///
    /// A repository without commits just repoints its unborn HEAD. A branch
    /// missing locally is created from the bundle's copy of it.
    pub fn switch_branch(&self, branch: &str, bundle: &Path) -> Result<(), GitError> {
        if self.current_branch()?.as_deref() == Some(branch) {
            return Ok(());
        }
        if !self.has_commit("HEAD") {
            self.run(["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])?;
            return Ok(());
        }
        if !self.has_commit(&format!("refs/heads/{branch}")) {
            self.run([
                OsStr::new("fetch"),
                bundle.as_os_str(),
                OsStr::new(&format!("{branch}:{branch}")),
            ])?;
        }
        self.run(["checkout", branch])?;
        Ok(())
    }

    /// Merge `branch` from the bundle at `bundle` into the checked-out branch.
    ///
    /// A conflicted merge is left in the working tree for manual resolution.
    pub fn merge_bundle(&self, bundle: &Path, branch: &str) -> Result<String, GitError> {
        self.run([
            OsStr::new("pull"),
            OsStr::new("--no-rebase"),
            OsStr::new("--no-edit"),
            bundle.as_os_str(),
            OsStr::new(branch),
        ])
    }

    pub fn push_to_origin(&self, branch: &str) -> Result<String, GitError> {
        self.run(["push", "origin", branch])
    }

    /// Checked-out branch, `None` on a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let branch = self.run(["branch", "--show-current"])?;
        Ok(Some(branch.trim().to_string()).filter(|b| !b.is_empty()))
    }

    /// `git log -1 --oneline`, `None` before the first commit.
    pub fn last_commit(&self) -> Option<String> {
        self.run(["log", "-1", "--oneline"])
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn head_commit(&self) -> Result<String, GitError> {
        Ok(self.run(["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        self.run(["merge-base", "--is-ancestor", ancestor, descendant])
            .is_ok()
    }

    /// Whether `rev` names a commit present in this repository.
    pub fn has_commit(&self, rev: &str) -> bool {
        self.run(["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")])
            .is_ok()
    }

    /// Number of entries in `git status --porcelain`.
    pub fn dirty_files(&self) -> Result<usize, GitError> {
        let status = self.run(["status", "--porcelain"])?;
        Ok(status.lines().filter(|l| !l.trim().is_empty()).count())
    }

    /// Commits ahead of the upstream branch, `None` without an upstream.
    pub fn unpushed_commits(&self) -> Option<usize> {
        self.run(["rev-list", "--count", "@{u}..HEAD"])
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// The last `n` commits, one line each.
    pub fn recent_commits(&self, n: usize) -> Result<Vec<String>, GitError> {
        let log = self.run(["log", &format!("-{n}"), "--oneline"])?;
        Ok(non_empty_lines(&log))
    }

    /// Commits reachable from HEAD but not from `base`, one line each.
    pub fn commits_since(&self, base: &str) -> Result<Vec<String>, GitError> {
        let log = self.run(["log", "--oneline", &format!("{base}..HEAD")])?;
        Ok(non_empty_lines(&log))
    }

    /// `git diff --stat <base> HEAD`.
    pub fn diff_stat(&self, base: &str) -> Result<String, GitError> {
        self.run(["diff", "--stat", base, "HEAD"])
    }
}

fn git_command<I, S>(dir: Option<&Path>, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_file, git, init_repo};

    #[test]
    fn test_fresh_repository_state() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());

        assert!(repo.is_repository());
        assert_eq!(repo.current_branch().unwrap().as_deref(), Some("main"));
        assert_eq!(repo.last_commit(), None);
        assert_eq!(repo.dirty_files().unwrap(), 0);
        assert_eq!(repo.unpushed_commits(), None);
    }

    #[test]
    fn test_not_a_repository() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!LocalRepo::new(tmp.path()).is_repository());
    }

    #[test]
    fn test_dirty_files_and_log() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "one", "first");
        commit_file(tmp.path(), "a.txt", "two", "second");
        std::fs::write(tmp.path().join("a.txt"), "three").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "new").unwrap();

        assert_eq!(repo.dirty_files().unwrap(), 2);
        assert!(repo.last_commit().unwrap().ends_with("second"));
        let recent = repo.recent_commits(5).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[1].ends_with("first"));
    }

    #[test]
    fn test_bundle_roundtrip_through_merge() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = init_repo(src_dir.path());
        let dst = init_repo(dst_dir.path());
        commit_file(src_dir.path(), "a.txt", "hello", "from source");

        let bundle = src_dir.path().join("out/src.bundle");
        src.create_bundle(&bundle).unwrap();
        assert!(bundle.is_file());

        dst.merge_bundle(&bundle, "main").unwrap();
        assert_eq!(dst.head_commit().unwrap(), src.head_commit().unwrap());
        assert!(dst_dir.path().join("a.txt").is_file());
    }

    #[test]
    fn test_switch_branch_on_unborn_head() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = init_repo(src_dir.path());
        commit_file(src_dir.path(), "a.txt", "hello", "from source");
        let bundle = src_dir.path().join("s.bundle");
        src.create_bundle(&bundle).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        git(dst_dir.path(), &["init", "-q"]);
        git(dst_dir.path(), &["symbolic-ref", "HEAD", "refs/heads/master"]);
        let dst = LocalRepo::new(dst_dir.path());

        dst.switch_branch("main", &bundle).unwrap();
        assert_eq!(dst.current_branch().unwrap().as_deref(), Some("main"));

        dst.merge_bundle(&bundle, "main").unwrap();
        assert_eq!(dst.head_commit().unwrap(), src.head_commit().unwrap());
    }

    #[test]
    fn test_switch_branch_creates_missing_branch_from_bundle() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = init_repo(src_dir.path());
        commit_file(src_dir.path(), "a.txt", "base", "base");
        let dst_dir = tempfile::tempdir().unwrap();
        git(dst_dir.path(), &["clone", "-q", &src_dir.path().to_string_lossy(), "."]);
        let dst = init_repo(dst_dir.path());

        git(src_dir.path(), &["checkout", "-q", "-b", "release"]);
        commit_file(src_dir.path(), "r.txt", "r", "release work");
        let bundle = src_dir.path().join("s.bundle");
        src.create_bundle(&bundle).unwrap();

        dst.switch_branch("release", &bundle).unwrap();

        assert_eq!(dst.current_branch().unwrap().as_deref(), Some("release"));
        assert!(dst_dir.path().join("r.txt").is_file());
        assert!(dst.switch_branch("missing", &bundle).is_err());
    }

    #[test]
    fn test_is_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "one", "first");
        let first = repo.head_commit().unwrap();
        commit_file(tmp.path(), "a.txt", "two", "second");

        assert!(repo.is_ancestor(&first, "HEAD"));
        assert!(!repo.is_ancestor("HEAD", &first));
    }

    #[test]
    fn test_merge_conflict_is_reported() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = init_repo(src_dir.path());
        commit_file(src_dir.path(), "a.txt", "base", "base");

        let dst_dir = tempfile::tempdir().unwrap();
        git(dst_dir.path(), &["clone", "-q", &src_dir.path().to_string_lossy(), "."]);
        let dst = init_repo(dst_dir.path());

        commit_file(src_dir.path(), "a.txt", "theirs", "theirs");
        commit_file(dst_dir.path(), "a.txt", "ours", "ours");
        let bundle = src_dir.path().join("s.bundle");
        src.create_bundle(&bundle).unwrap();

        let err = dst.merge_bundle(&bundle, "main").unwrap_err();
        assert!(matches!(err, GitError::CommandFailed { .. }));
        assert!(err.output().unwrap().contains("CONFLICT"));
    }

    #[test]
    fn test_commits_since_and_diff_stat() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "one", "first");
        let base = repo.head_commit().unwrap();
        commit_file(tmp.path(), "b.txt", "two", "second");

        assert!(repo.has_commit(&base));
        assert!(!repo.has_commit("0123456789abcdef0123456789abcdef01234567"));
        let commits = repo.commits_since(&base).unwrap();
        assert_eq!(commits.len(), 1);
        assert!(repo.diff_stat(&base).unwrap().contains("b.txt"));
    }

    #[test]
    fn test_unpushed_commits_with_upstream() {
        let origin_dir = tempfile::tempdir().unwrap();
        git(origin_dir.path(), &["init", "-q", "--bare"]);
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "one", "first");
        git(tmp.path(), &["remote", "add", "origin", &origin_dir.path().to_string_lossy()]);
        git(tmp.path(), &["push", "-q", "-u", "origin", "main"]);

        assert_eq!(repo.unpushed_commits(), Some(0));
        commit_file(tmp.path(), "a.txt", "two", "second");
        assert_eq!(repo.unpushed_commits(), Some(1));

        repo.push_to_origin("main").unwrap();
        assert_eq!(repo.unpushed_commits(), Some(0));
    }

    #[test]
    fn test_git_version() {
        assert!(LocalRepo::git_version().unwrap().starts_with("git version"));
    }
}
