//! Shared fixtures for unit tests.
//!
//! [`LocalShellConnector`] stands in for an SSH server: commands run under
//! `sh -c` with `HOME` pointed at a scratch directory, and transfers are
//! plain file copies. Workflow tests therefore drive the real `git` on both
//! sides without a network.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::git::LocalRepo;
use crate::remote::{
    Connector, ProgressFn, RemoteError, RemoteSession, TransferDirection, copy_with_progress,
};
use crate::ui::Reporter;

const GIT_IDENTITY: [(&str, &str); 4] = [
    ("GIT_AUTHOR_NAME", "Test"),
    ("GIT_AUTHOR_EMAIL", "test@example.com"),
    ("GIT_COMMITTER_NAME", "Test"),
    ("GIT_COMMITTER_EMAIL", "test@example.com"),
];

// =============================================================================
// Remote double
// =============================================================================

#[derive(Clone)]
pub struct LocalShellConnector {
    home: PathBuf,
    refuse: bool,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    failing_downloads: Arc<AtomicUsize>,
}

impl LocalShellConnector {
    /// A "server" whose home directory is `home`.
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            refuse: false,
            connects: Arc::default(),
            closes: Arc::default(),
            failing_downloads: Arc::default(),
        }
    }

    pub fn refusing_connections(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Make the next `n` downloads stop halfway with an I/O error.
    pub fn fail_next_downloads(&self, n: usize) {
        self.failing_downloads.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connector for LocalShellConnector {
    type Session = LocalShellSession;

    fn connect(&self) -> Result<LocalShellSession, RemoteError> {
        if self.refuse {
            return Err(RemoteError::ConnectRefused {
                addr: "127.0.0.1:22".into(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(LocalShellSession {
            connector: self.clone(),
        })
    }

    fn describe(&self) -> String {
        format!("local shell in {}", self.home.display())
    }
}

pub struct LocalShellSession {
    connector: LocalShellConnector,
}

impl LocalShellSession {
    fn resolve(&self, remote: &str) -> PathBuf {
        let home = &self.connector.home;
        if remote == "~" {
            return home.clone();
        }
        if let Some(rest) = remote.strip_prefix("~/") {
            return home.join(rest);
        }
        let path = Path::new(remote);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            home.join(path)
        }
    }
}

impl RemoteSession for LocalShellSession {
    fn execute(&mut self, command: &str) -> Result<String, RemoteError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.connector.home)
            .env("HOME", &self.connector.home)
            .env("GIT_TERMINAL_PROMPT", "0")
            .envs(GIT_IDENTITY)
            .output()
            .map_err(RemoteError::ChannelIo)?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let mut text = stdout;
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(RemoteError::RemoteCommandFailed {
                status: output.status.code().unwrap_or(-1),
                output: text,
            });
        }
        Ok(stdout)
    }

    fn transfer(
        &mut self,
        direction: TransferDirection,
        local: &Path,
        remote: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let remote_path = self.resolve(remote);
        let (from, to) = match direction {
            TransferDirection::Upload => (local.to_path_buf(), remote_path),
            TransferDirection::Download => (remote_path, local.to_path_buf()),
        };
        let io_err = |source| RemoteError::TransferIo {
            path: remote.to_string(),
            source,
        };

        let mut source = File::open(&from).map_err(io_err)?;
        let total = source.metadata().map(|m| m.len()).ok();
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        if direction == TransferDirection::Download
            && self
                .connector
                .failing_downloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            let data = fs::read(&from).map_err(io_err)?;
            fs::write(&to, &data[..data.len() / 2]).map_err(io_err)?;
            return Err(io_err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset mid-transfer",
            )));
        }

        let mut dest = File::create(&to).map_err(io_err)?;
        copy_with_progress(&mut source, &mut dest, total, remote, on_progress)
    }

    fn close(self) -> Result<(), RemoteError> {
        self.connector.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Git fixtures
// =============================================================================

/// Run git in `dir`, panicking on failure. Returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .envs(GIT_IDENTITY)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialize (or reinitialize) a repository on `main` with a test identity.
pub fn init_repo(dir: &Path) -> LocalRepo {
    fs::create_dir_all(dir).expect("create repo dir");
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    LocalRepo::new(dir)
}

/// Write `contents` to `file` and commit it.
pub fn commit_file(dir: &Path, file: &str, contents: &str, message: &str) {
    let path = dir.join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, contents).expect("write file");
    git(dir, &["add", file]);
    git(dir, &["commit", "-q", "-m", message]);
}

// =============================================================================
// Reporter double
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Step(String),
    Success(String),
    Failure(String),
    Warning(String),
    Info(String),
    TransferStarted(TransferDirection, String, Option<u64>),
    Progress(u64, Option<u64>),
    TransferFinished(u64),
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<Event>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Warning(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl Reporter for RecordingReporter {
    fn step(&self, message: &str) {
        self.push(Event::Step(message.into()));
    }

    fn success(&self, message: &str) {
        self.push(Event::Success(message.into()));
    }

    fn failure(&self, message: &str) {
        self.push(Event::Failure(message.into()));
    }

    fn warning(&self, message: &str) {
        self.push(Event::Warning(message.into()));
    }

    fn info(&self, message: &str) {
        self.push(Event::Info(message.into()));
    }

    fn transfer_started(&self, direction: TransferDirection, name: &str, total: Option<u64>) {
        self.push(Event::TransferStarted(direction, name.into(), total));
    }

    fn transfer_progress(&self, bytes: u64, total: Option<u64>) {
        self.push(Event::Progress(bytes, total));
    }

    fn transfer_finished(&self, bytes: u64) {
        self.push(Event::TransferFinished(bytes));
    }
}
