//! Remote session layer for talking to the air-gapped server.
//!
//! A [`RemoteSession`] is one authenticated channel to a single host. It
//! offers exactly two primitives: running a shell command and copying a
//! whole file in either direction. Sessions are produced by a
//! [`Connector`] and are meant to be used through [`with_session`], which
//! guarantees the session is closed on every exit path.
//!
//! # Architecture
//!
//! - **auth**: ordered credential discovery (configured key, default keys, agent)
//! - **ssh**: the ssh2-backed implementation (exec channels + SFTP)
//!
//! # Example
//!
//! ```rust,ignore
//! use gitsynq::remote::{with_session, RemoteEndpoint, RemoteSession};
//! use gitsynq::remote::ssh::SshConnector;
//!
//! let connector = SshConnector::new(RemoteEndpoint::new("192.168.12.4", 22, "prince"));
//! let version = with_session(&connector, |session| session.execute("git --version"))?;
//! ```

pub mod auth;
pub mod ssh;

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Fixed timeout for establishing the TCP connection to the server.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Chunk size used when streaming files over the transfer channel.
const TRANSFER_CHUNK: usize = 32 * 1024;

/// Target host and credentials for a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Explicitly configured private key, tried before any default key.
    pub key_path: Option<PathBuf>,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            key_path: None,
        }
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// `host:port` form used for socket connections.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)?;
        if self.port != 22 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Errors raised by remote sessions.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Connection to {addr} timed out after {secs} seconds")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("Connection to {addr} refused")]
    ConnectRefused { addr: String },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("No SSH authentication methods found (checked config, defaults, and agent)")]
    NoCredentialsAvailable,

    #[error("Authentication as {user} was rejected (tried: {tried})")]
    AuthRejected { user: String, tried: String },

    #[error("Remote command exited with status {status}: {}", output.trim())]
    RemoteCommandFailed { status: i32, output: String },

    #[error("SSH channel error: {0}")]
    Channel(#[from] ssh2::Error),

    #[error("Failed to read command output: {0}")]
    ChannelIo(#[source] std::io::Error),

    #[error("Transfer of {path} failed: {source}")]
    TransferIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote session is already closed")]
    SessionClosed,

    #[error("Errors closing connection: {}", .0.join("; "))]
    Close(Vec<String>),
}

impl RemoteError {
    /// Whether the failure happened before a channel was usable.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectRefused { .. }
                | Self::Connect { .. }
                | Self::Handshake { .. }
                | Self::NoCredentialsAvailable
                | Self::AuthRejected { .. }
        )
    }

    /// Actionable guidance for the operator, when there is any.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::ConnectTimeout { addr, .. } | Self::ConnectRefused { addr } => Some(format!(
                "Check that {addr} is reachable from this machine and that sshd is listening"
            )),
            Self::NoCredentialsAvailable => Some(
                "Set server.ssh_key_path, create a key under ~/.ssh, or start ssh-agent".into(),
            ),
            Self::AuthRejected { user, .. } => Some(format!(
                "Make sure your public key is in ~{user}/.ssh/authorized_keys on the server"
            )),
            _ => None,
        }
    }
}

/// Direction of a file transfer, seen from the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Progress sink for transfers: `(bytes_so_far, total_if_known)`.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + 'a;

/// One authenticated channel to the remote host.
pub trait RemoteSession {
    /// Run one command in a fresh remote shell.
    ///
    /// Returns stdout on success. A non-zero exit status becomes
    /// [`RemoteError::RemoteCommandFailed`] carrying stdout followed by stderr.
    fn execute(&mut self, command: &str) -> Result<String, RemoteError>;

    /// Copy a whole file between `local` and `remote`, returning bytes moved.
    ///
    /// The destination's parent directory is created first. On failure the
    /// destination may hold a partial copy; callers decide what to do with it.
    fn transfer(
        &mut self,
        direction: TransferDirection,
        local: &Path,
        remote: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<u64, RemoteError>;

    /// Release every underlying handle, reporting all close errors together.
    fn close(self) -> Result<(), RemoteError>
    where
        Self: Sized;
}

/// Produces authenticated sessions for one endpoint.
pub trait Connector {
    type Session: RemoteSession;

    fn connect(&self) -> Result<Self::Session, RemoteError>;

    /// Short human-readable target, e.g. `prince@192.168.12.4`.
    fn describe(&self) -> String;
}

/// Scoped acquisition: connect, run `body`, and close the session on every
/// exit path.
///
/// A close failure after the body ran is logged, never returned, so it cannot
/// mask the body's own outcome.
pub fn with_session<C, T, E>(
    connector: &C,
    body: impl FnOnce(&mut C::Session) -> Result<T, E>,
) -> Result<T, E>
where
    C: Connector,
    E: From<RemoteError>,
{
    let mut session = connector.connect()?;
    let result = body(&mut session);
    if let Err(e) = session.close() {
        tracing::warn!(
            target_host = %connector.describe(),
            error = %e,
            "failed to close remote session"
        );
    }
    result
}

/// Stream `reader` into `writer`, reporting progress after every chunk.
///
/// When `total` is known the byte count must match it exactly; a short copy
/// is reported as a transfer error rather than silently accepted.
pub fn copy_with_progress(
    reader: &mut impl Read,
    writer: &mut impl Write,
    total: Option<u64>,
    path: &str,
    on_progress: &mut ProgressFn<'_>,
) -> Result<u64, RemoteError> {
    let io_err = |source| RemoteError::TransferIo {
        path: path.to_string(),
        source,
    };

    let mut buffer = vec![0u8; TRANSFER_CHUNK];
    let mut copied = 0u64;
    on_progress(0, total);

    loop {
        let n = reader.read(&mut buffer).map_err(io_err)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).map_err(io_err)?;
        copied += n as u64;
        on_progress(copied, total);
    }
    writer.flush().map_err(io_err)?;

    if let Some(expected) = total
        && copied != expected
    {
        return Err(io_err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("copied {copied} of {expected} bytes"),
        )));
    }

    Ok(copied)
}

/// Join a remote (POSIX) directory and a file name.
pub fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Render a remote path as a single shell word.
///
/// A leading `~` is rewritten to `"$HOME"` because quoting would stop the
/// remote shell from expanding it. Relative paths are anchored at `$HOME`
/// too, matching how SFTP resolves them, so scripts may `cd` freely.
pub fn shell_path(path: &str) -> String {
    if path == "~" || path.is_empty() {
        return "\"$HOME\"".to_string();
    }
    if path.starts_with('/') {
        return shell_words::quote(path).into_owned();
    }
    let rest = path.strip_prefix("~/").unwrap_or(path);
    if rest.is_empty() {
        "\"$HOME\"".to_string()
    } else {
        format!("\"$HOME\"/{}", shell_words::quote(rest))
    }
}

/// Render a remote path for SFTP, which resolves relative paths from the
/// login directory and never expands `~`.
pub fn sftp_path(path: &str) -> PathBuf {
    if path == "~" {
        return PathBuf::from(".");
    }
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => PathBuf::from("."),
        Some(rest) => PathBuf::from(rest),
        None => PathBuf::from(path),
    }
}
