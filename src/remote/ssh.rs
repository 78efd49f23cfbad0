//! ssh2-backed remote sessions.
//!
//! Commands run on exec channels; files move over SFTP. One [`SshSession`]
//! holds one TCP connection for the whole sync attempt.

use std::fs::{self, File};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use ssh2::{Session, Sftp};

use super::auth::{self, AuthEnvironment, Credential};
use super::{
    CONNECT_TIMEOUT, Connector, ProgressFn, RemoteEndpoint, RemoteError, RemoteSession,
    TransferDirection, copy_with_progress, sftp_path,
};

/// Opens [`SshSession`]s for one endpoint.
pub struct SshConnector {
    endpoint: RemoteEndpoint,
    auth_env: AuthEnvironment,
    timeout: Duration,
}

impl SshConnector {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            auth_env: AuthEnvironment::from_process(),
            timeout: CONNECT_TIMEOUT,
        }
    }

    /// Replace the environment used for credential discovery.
    pub fn with_auth_environment(mut self, env: AuthEnvironment) -> Self {
        self.auth_env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    fn open_tcp(&self) -> Result<TcpStream, RemoteError> {
        let addr = self.endpoint.address();
        let candidates = (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(|source| RemoteError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(addr = %candidate, error = %e, "tcp connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        });
        Err(classify_connect_error(addr, self.timeout, err))
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self) -> Result<SshSession, RemoteError> {
        // Discovery happens before any socket is opened so a machine with no
        // credentials fails fast and leaves nothing behind.
        let chain = auth::default_chain(&self.endpoint);
        let credentials = auth::discover_credentials(&chain, &self.auth_env)?;

        let addr = self.endpoint.address();
        let tcp = self.open_tcp()?;

        let mut session = Session::new().map_err(|source| RemoteError::Handshake {
            addr: addr.clone(),
            source,
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|source| RemoteError::Handshake {
                addr: addr.clone(),
                source,
            })?;

        if let Err(e) = authenticate(&session, &self.endpoint.user, &credentials) {
            let _ = session.disconnect(None, "authentication failed", None);
            return Err(e);
        }

        // Commands and transfers run to completion; only the connect phase is bounded.
        session.set_timeout(0);

        let sftp = match session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => {
                let _ = session.disconnect(None, "sftp unavailable", None);
                return Err(RemoteError::Channel(e));
            }
        };

        tracing::info!(endpoint = %self.endpoint, "ssh session established");
        Ok(SshSession {
            session,
            sftp: Some(sftp),
            closed: false,
        })
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Offer each credential in order; stop at the first one the server accepts.
fn authenticate(
    session: &Session,
    user: &str,
    credentials: &[Credential],
) -> Result<(), RemoteError> {
    for credential in credentials {
        let accepted = match credential {
            Credential::KeyFile(path) => {
                match session.userauth_pubkey_file(user, None, path, None) {
                    Ok(()) => session.authenticated(),
                    Err(e) => {
                        tracing::debug!(key = %path.display(), error = %e, "key rejected");
                        false
                    }
                }
            }
            Credential::Agent => authenticate_with_agent(session, user),
        };

        if accepted {
            tracing::debug!(credential = %credential, "authenticated");
            return Ok(());
        }
    }

    Err(RemoteError::AuthRejected {
        user: user.to_string(),
        tried: credentials
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn authenticate_with_agent(session: &Session, user: &str) -> bool {
    let attempt = || -> Result<bool, ssh2::Error> {
        let mut agent = session.agent()?;
        agent.connect()?;
        agent.list_identities()?;
        for identity in agent.identities()? {
            if agent.userauth(user, &identity).is_ok() && session.authenticated() {
                let _ = agent.disconnect();
                return Ok(true);
            }
        }
        let _ = agent.disconnect();
        Ok(false)
    };

    attempt().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "ssh-agent authentication failed");
        false
    })
}

/// Map a socket error onto the timeout / refused / other split callers rely on.
fn classify_connect_error(addr: String, timeout: Duration, err: io::Error) -> RemoteError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RemoteError::ConnectTimeout {
            addr,
            secs: timeout.as_secs(),
        },
        io::ErrorKind::ConnectionRefused => RemoteError::ConnectRefused { addr },
        _ => RemoteError::Connect { addr, source: err },
    }
}

/// A live SSH connection with an SFTP subsystem.
///
/// Closed exactly once: explicitly through [`RemoteSession::close`], or on
/// drop when an early return skipped the explicit close.
pub struct SshSession {
    session: Session,
    sftp: Option<Sftp>,
    closed: bool,
}

impl SshSession {
    fn ensure_open(&self) -> Result<(), RemoteError> {
        if self.closed {
            Err(RemoteError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn sftp(&self) -> Result<&Sftp, RemoteError> {
        self.ensure_open()?;
        self.sftp.as_ref().ok_or(RemoteError::SessionClosed)
    }

    fn shutdown(&mut self) -> Result<(), RemoteError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors = Vec::new();
        if let Some(mut sftp) = self.sftp.take()
            && let Err(e) = sftp.shutdown()
        {
            errors.push(format!("sftp: {e}"));
        }
        if let Err(e) = self.session.disconnect(None, "gitsync session closed", None) {
            errors.push(format!("ssh: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RemoteError::Close(errors))
        }
    }

    fn upload(
        &self,
        local: &Path,
        remote: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let sftp = self.sftp()?;
        let target = sftp_path(remote);
        let io_err = |source| RemoteError::TransferIo {
            path: remote.to_string(),
            source,
        };

        let mut source = File::open(local).map_err(|source| RemoteError::TransferIo {
            path: local.display().to_string(),
            source,
        })?;
        let total = source.metadata().map(|m| m.len()).ok();

        if let Some(parent) = target.parent() {
            sftp_mkdir_all(sftp, parent).map_err(io_err)?;
        }
        let mut dest = sftp.create(&target).map_err(|e| io_err(e.into()))?;

        tracing::debug!(local = %local.display(), remote = %remote, "starting upload");
        copy_with_progress(&mut source, &mut dest, total, remote, on_progress)
    }

    fn download(
        &self,
        local: &Path,
        remote: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let sftp = self.sftp()?;
        let source_path = sftp_path(remote);
        let io_err = |source| RemoteError::TransferIo {
            path: remote.to_string(),
            source,
        };

        // Size is optional in SFTP attributes; progress starts without a total.
        let total = sftp.stat(&source_path).ok().and_then(|stat| stat.size);
        let mut source = sftp.open(&source_path).map_err(|e| io_err(e.into()))?;

        if let Some(parent) = local.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| RemoteError::TransferIo {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let mut dest = File::create(local).map_err(|source| RemoteError::TransferIo {
            path: local.display().to_string(),
            source,
        })?;

        tracing::debug!(remote = %remote, local = %local.display(), ?total, "starting download");
        let copied = copy_with_progress(&mut source, &mut dest, total, remote, on_progress)?;
        dest.sync_all().map_err(|source| RemoteError::TransferIo {
            path: local.display().to_string(),
            source,
        })?;
        Ok(copied)
    }
}

impl RemoteSession for SshSession {
    fn execute(&mut self, command: &str) -> Result<String, RemoteError> {
        self.ensure_open()?;

        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        self.session.set_blocking(false);
        let drained = {
            let mut out = channel.stream(0);
            let mut err = channel.stderr();
            drain_interleaved(&mut out, &mut err, || channel.eof())
        };
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(RemoteError::ChannelIo)?;

        channel.wait_close()?;
        let status = channel.exit_status()?;

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        if status != 0 {
            let mut output = stdout;
            output.push_str(&String::from_utf8_lossy(&stderr));
            tracing::debug!(status, "remote command failed");
            return Err(RemoteError::RemoteCommandFailed { status, output });
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
        match direction {
            TransferDirection::Upload => self.upload(local, remote, on_progress),
            TransferDirection::Download => self.download(local, remote, on_progress),
        }
    }

    fn close(mut self) -> Result<(), RemoteError> {
        self.shutdown()
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "failed to close ssh session");
        }
    }
}

/// Pause between polls when neither stream has data ready.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Read two non-blocking streams in turns until `finished` reports EOF and
/// both run dry, so a chatty stderr cannot stall the remote command while
/// stdout is being read.
fn drain_interleaved(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    finished: impl Fn() -> bool,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let progressed = read_available(stdout, &mut buffer, &mut out)?
            | read_available(stderr, &mut buffer, &mut err)?;
        if progressed {
            continue;
        }
        if finished() {
            return Ok((out, err));
        }
        std::thread::sleep(DRAIN_POLL);
    }
}

/// One read attempt; `Ok(false)` when nothing was ready or the stream ended.
fn read_available(
    stream: &mut impl Read,
    buffer: &mut [u8],
    into: &mut Vec<u8>,
) -> io::Result<bool> {
    match stream.read(buffer) {
        Ok(0) => Ok(false),
        Ok(n) => {
            into.extend_from_slice(&buffer[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// `mkdir -p` over SFTP. Existing directories are left alone.
fn sftp_mkdir_all(sftp: &Sftp, dir: &Path) -> io::Result<()> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if matches!(component, Component::RootDir | Component::CurDir | Component::Prefix(_)) {
            continue;
        }
        if sftp.stat(&current).is_ok() {
            continue;
        }
        if let Err(e) = sftp.mkdir(&current, 0o755) {
            // Lost a race with another creator, or the path exists as something we can stat now.
            if sftp.stat(&current).is_err() {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn env_with_key() -> (tempfile::TempDir, AuthEnvironment) {
        let home = tempfile::tempdir().unwrap();
        fs::create_dir_all(home.path().join(".ssh")).unwrap();
        fs::write(home.path().join(".ssh/id_ed25519"), "key").unwrap();
        let env = AuthEnvironment {
            home: Some(home.path().to_path_buf()),
            agent_socket: None,
        };
        (home, env)
    }

    #[test]
    fn test_connect_without_credentials_fails_before_dialing() {
        let home = tempfile::tempdir().unwrap();
        // TEST-NET address: dialing it would hang until the timeout.
        let connector = SshConnector::new(RemoteEndpoint::new("192.0.2.1", 22, "nobody"))
            .with_auth_environment(AuthEnvironment {
                home: Some(home.path().to_path_buf()),
                agent_socket: None,
            })
            .with_timeout(Duration::from_secs(30));

        let started = std::time::Instant::now();
        let err = connector.connect().err().unwrap();

        assert!(matches!(err, RemoteError::NoCredentialsAvailable));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_connect_refused_is_distinct() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (_home, env) = env_with_key();
        let connector = SshConnector::new(RemoteEndpoint::new("127.0.0.1", port, "nobody"))
            .with_auth_environment(env)
            .with_timeout(Duration::from_secs(5));

        let err = connector.connect().err().unwrap();

        assert!(matches!(err, RemoteError::ConnectRefused { .. }), "got {err:?}");
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_classify_connect_error() {
        let timeout = Duration::from_secs(30);
        let err = classify_connect_error(
            "h:22".into(),
            timeout,
            io::Error::from(io::ErrorKind::TimedOut),
        );
        assert!(matches!(err, RemoteError::ConnectTimeout { secs: 30, .. }));
        assert_eq!(err.to_string(), "Connection to h:22 timed out after 30 seconds");

        let err = classify_connect_error(
            "h:22".into(),
            timeout,
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert!(matches!(err, RemoteError::ConnectRefused { .. }));

        let err = classify_connect_error(
            "h:22".into(),
            timeout,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, RemoteError::Connect { .. }));
    }

    #[test]
    fn test_connector_describe() {
        let connector = SshConnector::new(RemoteEndpoint::new("10.1.1.1", 22, "prince"));
        assert_eq!(connector.describe(), "prince@10.1.1.1");
        assert_eq!(connector.endpoint().port, 22);
    }

    /// Reader that plays back chunks; `None` stands for "would block".
    struct Scripted {
        steps: std::collections::VecDeque<Option<&'static str>>,
        gate: Option<std::rc::Rc<std::cell::Cell<bool>>>,
        done: Option<std::rc::Rc<std::cell::Cell<bool>>>,
    }

    impl Scripted {
        fn new(steps: Vec<Option<&'static str>>) -> Self {
            Self {
                steps: steps.into(),
                gate: None,
                done: None,
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(gate) = &self.gate
                && !gate.get()
            {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match self.steps.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk.as_bytes());
                    if self.steps.is_empty()
                        && let Some(done) = &self.done
                    {
                        done.set(true);
                    }
                    Ok(chunk.len())
                }
                Some(None) => Err(io::ErrorKind::WouldBlock.into()),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_drain_reads_stderr_while_stdout_is_blocked() {
        let stderr_done = std::rc::Rc::new(std::cell::Cell::new(false));
        // stdout stays blocked until the peer has flushed all of stderr.
        let mut out = Scripted::new(vec![Some("result\n")]);
        out.gate = Some(stderr_done.clone());
        let mut err = Scripted::new(vec![Some("warn 1\n"), None, Some("warn 2\n")]);
        err.done = Some(stderr_done.clone());

        let (stdout, stderr) =
            drain_interleaved(&mut out, &mut err, || stderr_done.get()).unwrap();

        assert_eq!(stdout, b"result\n");
        assert_eq!(stderr, b"warn 1\nwarn 2\n");
    }

    #[test]
    fn test_drain_waits_for_eof() {
        let polls = std::cell::Cell::new(0);
        let mut out = Scripted::new(vec![None, Some("a"), None, Some("b")]);
        let mut err = Scripted::new(vec![]);

        let (stdout, stderr) = drain_interleaved(&mut out, &mut err, || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        })
        .unwrap();

        assert_eq!(stdout, b"ab");
        assert!(stderr.is_empty());
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn test_drain_propagates_read_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }
        let mut err = Scripted::new(vec![]);

        let result = drain_interleaved(&mut Broken, &mut err, || true);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }
}
