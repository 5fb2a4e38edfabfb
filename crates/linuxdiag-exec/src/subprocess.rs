//! SSH through the native `ssh` client with ControlMaster multiplexing
//!
//! Every command is a short-lived `ssh` process; the first one to a host
//! becomes the master behind a per-host control socket (`ControlMaster=auto`)
//! and later ones ride on it. Going through the real client keeps the user's `~/.ssh/config`
//! working (ProxyJump, GSSAPI, smartcards) while the options below are
//! always forced.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BackendKind, ExecConfig};
use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::process::{ProcessOutcome, run_process, shell_join};
use crate::result::{CommandResult, Encoding};
use crate::traits::{Connection, Connector};

/// Exit status OpenSSH uses for its own (transport) failures
pub const SSH_CONNECTION_ERROR_CODE: i32 = 255;

/// Hard ceiling on `sun_path` for Unix domain sockets
pub const UNIX_SOCKET_PATH_MAX: usize = 108;

/// Bound on the `ssh -O exit` request sent when closing
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn short_hash(input: &str, len: usize) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..len].to_string()
}

/// Default per-user socket directory
///
/// Kept directly under `/tmp` rather than `$TMPDIR`, which can be long
/// enough on its own to push socket paths over the limit.
#[must_use]
pub fn default_control_dir() -> PathBuf {
    let base = if Path::new("/tmp").is_dir() {
        PathBuf::from("/tmp")
    } else {
        std::env::temp_dir()
    };
    base.join(format!("linuxdiag_{}", short_hash(&whoami::username(), 8)))
}

/// Control socket for `host` inside `dir`
#[must_use]
pub fn control_path(dir: &Path, host: &str) -> PathBuf {
    dir.join(format!("{}.sock", short_hash(host, 12)))
}

fn ensure_control_dir(dir: &Path) -> Result<(), ExecError> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| ExecError::IoError(format!("creating {}: {e}", dir.display())))
}

/// Remove leftover `*.sock` files; errors on individual files are ignored
fn sweep_sockets(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sock") {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => debug!(path = %path.display(), error = %e, "failed to remove socket"),
            }
        }
    }
    removed
}

/// Options shared by every connection of one connector
#[derive(Debug)]
struct SshOptions {
    control_persist: u64,
    verify_host_keys: bool,
    known_hosts: PathBuf,
    connect_timeout: Option<Duration>,
    identity: Option<PathBuf>,
    user: Option<String>,
    port: u16,
}

impl SshOptions {
    fn from_config(config: &ExecConfig, identity: Option<PathBuf>) -> Self {
        Self {
            control_persist: config.control_persist_secs,
            verify_host_keys: config.verify_host_keys,
            known_hosts: config.effective_known_hosts(),
            connect_timeout: config.connect_timeout(),
            identity,
            user: config.user.clone(),
            port: config.port,
        }
    }
}

/// One host reached through a ControlMaster socket
#[derive(Debug)]
pub struct SubprocessConnection {
    host: String,
    control_path: PathBuf,
    ssh_bin: PathBuf,
    options: Arc<SshOptions>,
    /// Held by the run that starts the master
    master_gate: tokio::sync::Mutex<()>,
    established: AtomicBool,
    closed: AtomicBool,
}

impl SubprocessConnection {
    /// Control socket backing this connection
    #[must_use]
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Full argument list (without the binary) for running `remote_command`
    ///
    /// Options given with `-o` take precedence over `~/.ssh/config`.
    #[must_use]
    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let opts = &self.options;
        let persist = if opts.control_persist == 0 {
            "no".to_string()
        } else {
            opts.control_persist.to_string()
        };

        let mut args: Vec<String> = [
            // no password or host key prompts: fail instead of hanging
            "BatchMode=yes".to_string(),
            "ServerAliveInterval=30".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "ControlMaster=auto".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            format!("ControlPersist={persist}"),
            format!(
                "StrictHostKeyChecking={}",
                if opts.verify_host_keys { "yes" } else { "no" }
            ),
            format!("UserKnownHostsFile={}", opts.known_hosts.display()),
        ]
        .into_iter()
        .flat_map(|opt| ["-o".to_string(), opt])
        .collect();

        if let Some(timeout) = opts.connect_timeout {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        if let Some(identity) = &opts.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(user) = &opts.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        // 22 leaves any Port from ~/.ssh/config in effect
        if opts.port != 22 {
            args.push("-p".to_string());
            args.push(opts.port.to_string());
        }

        args.push(self.host.clone());
        args.push(remote_command.to_string());
        args
    }

    async fn run_remote(
        &self,
        remote_cmd: &str,
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.ssh_bin);
        cmd.args(self.ssh_args(remote_cmd));

        let outcome = run_process(cmd, timeout)
            .await
            .map_err(|e| ExecError::connection(&self.host, format!("failed to execute ssh: {e}")))?;
        let duration = start.elapsed();

        match outcome {
            ProcessOutcome::TimedOut => {
                let timeout = timeout.unwrap_or(duration);
                error!(
                    host = %self.host,
                    command = %remote_cmd,
                    timeout = ?timeout,
                    "SSH command timed out"
                );
                Err(ExecError::Timeout {
                    command: remote_cmd.to_string(),
                    host: Some(self.host.clone()),
                    timeout,
                })
            }
            ProcessOutcome::Exited { status, stderr, .. } if status == SSH_CONNECTION_ERROR_CODE => {
                let message = String::from_utf8_lossy(&stderr).trim().to_string();
                error!(host = %self.host, error = %message, "SSH transport failure");
                Err(ExecError::ConnectionFailed {
                    host: self.host.clone(),
                    message,
                })
            }
            ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
            } => {
                debug!(
                    host = %self.host,
                    command = %remote_cmd,
                    status = status,
                    duration = ?duration,
                    "remote command completed"
                );
                Ok(CommandResult::from_bytes(
                    status, stdout, stderr, encoding, duration,
                ))
            }
        }
    }

    /// Run the first command to this host, which starts the master
    ///
    /// Concurrent first callers wait on the gate and then reuse the master
    /// instead of racing to create their own.
    async fn run_first(
        &self,
        remote_cmd: &str,
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError> {
        let _gate = self.master_gate.lock().await;
        if self.established.load(Ordering::SeqCst) {
            return self.run_remote(remote_cmd, timeout, encoding).await;
        }

        let result = self.run_remote(remote_cmd, timeout, encoding).await?;
        self.established.store(true, Ordering::SeqCst);
        if self.control_path.exists() {
            info!(host = %self.host, user = ?self.options.user, "SSH master established");
        } else {
            warn!(
                host = %self.host,
                path = %self.control_path.display(),
                "ssh did not create a control socket, connections will not be reused"
            );
        }
        Ok(result)
    }
}

#[async_trait]
impl Connection for SubprocessConnection {
    #[instrument(skip(self, argv, encoding), fields(host = %self.host))]
    async fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecError::connection(&self.host, "connection closed"));
        }
        let remote_cmd = shell_join(argv);
        if self.established.load(Ordering::SeqCst) {
            self.run_remote(&remote_cmd, timeout, encoding).await
        } else {
            self.run_first(&remote_cmd, timeout, encoding).await
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.control_path.exists() {
            return;
        }

        let mut cmd = Command::new(&self.ssh_bin);
        cmd.arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(&self.host);

        match run_process(cmd, Some(CLOSE_TIMEOUT)).await {
            Ok(ProcessOutcome::Exited { .. }) => {
                debug!(host = %self.host, "ControlMaster exited");
            }
            Ok(ProcessOutcome::TimedOut) => {
                debug!(host = %self.host, "ControlMaster exit timed out");
            }
            Err(e) => debug!(host = %self.host, error = %e, "ControlMaster exit failed"),
        }

        if let Err(e) = std::fs::remove_file(&self.control_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %self.control_path.display(), error = %e, "failed to remove control socket");
        }
    }

    /// Open until closed; once the master is up, only while its socket exists
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && (!self.established.load(Ordering::SeqCst) || self.control_path.exists())
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Connector for the native-client backend
#[derive(Debug)]
pub struct SubprocessConnector {
    control_dir: PathBuf,
    ssh_binary: Option<PathBuf>,
    options: Arc<SshOptions>,
    /// Keeps a temp key file alive for as long as ssh may read it
    _key: ResolvedKey,
}

impl SubprocessConnector {
    /// Prepare the socket directory and clear sockets left by a previous run
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if a configured key cannot be
    /// resolved, or `ExecError::IoError` if the socket directory cannot be
    /// created
    pub fn new(config: &ExecConfig) -> Result<Self, ExecError> {
        let key = KeySource::from_config(config, false)
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        let identity = key.path().map(Path::to_path_buf);

        let control_dir = config.control_dir.clone().unwrap_or_else(default_control_dir);
        ensure_control_dir(&control_dir)?;

        let swept = sweep_sockets(&control_dir);
        if swept > 0 {
            info!(dir = %control_dir.display(), removed = swept, "removed stale control sockets");
        }

        Ok(Self {
            control_dir,
            ssh_binary: config.ssh_binary.clone(),
            options: Arc::new(SshOptions::from_config(config, identity)),
            _key: key,
        })
    }

    /// Socket directory in use
    #[must_use]
    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    fn find_ssh_binary(&self, host: &str) -> Result<PathBuf, ExecError> {
        match &self.ssh_binary {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(ExecError::connection(
                host,
                format!("ssh binary not found at {}", path.display()),
            )),
            None => which::which("ssh")
                .map_err(|_| ExecError::connection(host, "ssh command not found in PATH")),
        }
    }

    /// Build a connection for `host`; its first command starts the master
    ///
    /// # Errors
    /// Returns `ExecError::ConnectionFailed` if no ssh client is available
    pub fn connection(&self, host: &str) -> Result<SubprocessConnection, ExecError> {
        ensure_control_dir(&self.control_dir)?;
        Ok(SubprocessConnection {
            host: host.to_string(),
            control_path: control_path(&self.control_dir, host),
            ssh_bin: self.find_ssh_binary(host)?,
            options: Arc::clone(&self.options),
            master_gate: tokio::sync::Mutex::new(()),
            established: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connector for SubprocessConnector {
    #[instrument(skip(self))]
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, ExecError> {
        let conn = self.connection(host)?;
        debug!(host, control_path = %conn.control_path().display(), "prepared ssh connection");
        Ok(Arc::new(conn))
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn shutdown(&self) {
        let removed = sweep_sockets(&self.control_dir);
        if let Err(e) = std::fs::remove_dir(&self.control_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(dir = %self.control_dir.display(), error = %e, "failed to remove control dir");
        }
        debug!(removed, "control directory swept");
    }

    fn display_target(&self, host: &str) -> String {
        match &self.options.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }
}
