//! In-process SSH using the russh crate
//!
//! Used where no native client is installed. One authenticated session per
//! host; each command gets its own channel on that session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::agent::client::AgentClient;
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BackendKind, ExecConfig};
use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::process::shell_join;
use crate::result::{CommandResult, Encoding};
use crate::traits::{Connection, Connector};

/// Keepalive probe interval
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Missed keepalives before the peer is considered dead
const KEEPALIVE_MAX: usize = 3;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    /// `None` accepts every server key
    known_hosts: Option<PathBuf>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(known_hosts) = &self.known_hosts else {
            return Ok(true);
        };

        match russh::keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            known_hosts,
        ) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, "host key not present in known_hosts");
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "host key verification failed");
                Ok(false)
            }
        }
    }
}

/// Authenticated russh session to one host
pub struct SshConnection {
    host: String,
    session: client::Handle<SshClientHandler>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Drain a channel until the server closes it
async fn collect_output(channel: &mut Channel<client::Msg>) -> (Option<i32>, Vec<u8>, Vec<u8>) {
    let mut status = None;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    // exit-status may arrive after EOF, so read until the channel closes
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                stdout.extend_from_slice(&data);
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 {
                    // stderr
                    stderr.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                status = Some(exit_status.cast_signed());
            }
            _ => {}
        }
    }

    (status, stdout, stderr)
}

#[async_trait]
impl Connection for SshConnection {
    #[instrument(skip(self, argv, encoding), fields(host = %self.host))]
    async fn run(
        &self,
        argv: &[String],
        timeout_duration: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError> {
        if !self.is_connected() {
            return Err(ExecError::connection(&self.host, "session closed"));
        }

        let cmd = shell_join(argv);
        debug!(command = %cmd, "executing remote command");
        let start = Instant::now();

        let mut channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::connection(&self.host, e))?;

        channel
            .exec(true, cmd.as_str())
            .await
            .map_err(|e| ExecError::connection(&self.host, e))?;

        let collected = match timeout_duration {
            Some(limit) => timeout(limit, collect_output(&mut channel)).await.ok(),
            None => Some(collect_output(&mut channel).await),
        };

        let Some((status, stdout, stderr)) = collected else {
            let limit = timeout_duration.unwrap_or_default();
            error!(
                command = %cmd,
                timeout = ?limit,
                elapsed = ?start.elapsed(),
                "command timed out"
            );
            if let Err(e) = channel.close().await {
                debug!(error = %e, "failed to close timed out channel");
            }
            return Err(ExecError::Timeout {
                command: cmd,
                host: Some(self.host.clone()),
                timeout: limit,
            });
        };

        let duration = start.elapsed();
        let status = status.unwrap_or_else(|| {
            debug!(command = %cmd, "channel closed without exit status");
            -1
        });

        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult::from_bytes(
            status, stdout, stderr, encoding, duration,
        ))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.host, error = %e, "SSH disconnect failed");
        }
        info!(host = %self.host, "SSH disconnected");
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.session.is_closed()
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Connector for the in-process backend
pub struct SshConnector {
    config: ExecConfig,
    user: String,
    /// Resolved SSH key
    key: ResolvedKey,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("user", &self.user)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Create a connector, resolving the identity up front
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(config: &ExecConfig) -> Result<Self, ExecError> {
        let key = KeySource::from_config(config, true)
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        if !config.verify_host_keys {
            warn!("SSH host key verification disabled, connections are open to MITM attacks");
        }

        Ok(Self {
            config: config.clone(),
            user: config.user.clone().unwrap_or_else(whoami::username),
            key,
        })
    }

    /// Username offered during authentication
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    async fn handshake(&self, host: &str) -> Result<client::Handle<SshClientHandler>, ExecError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let handler = SshClientHandler {
            host: host.to_string(),
            port: self.config.port,
            known_hosts: self
                .config
                .verify_host_keys
                .then(|| self.config.effective_known_hosts()),
        };

        let connecting = client::connect(config, (host, self.config.port), handler);
        let connected = match self.config.connect_timeout() {
            Some(limit) => timeout(limit, connecting).await.map_err(|_| {
                ExecError::connection(host, format!("handshake timed out after {limit:?}"))
            })?,
            None => connecting.await,
        };
        let mut session = connected.map_err(|e| ExecError::connection(host, e))?;

        let auth_failed = |message: String| ExecError::AuthenticationFailed {
            host: host.to_string(),
            user: self.user.clone(),
            message,
        };

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let authenticated = match self.key.path() {
            Some(key_path) => {
                let key_pair =
                    load_secret_key(key_path, self.config.identity_passphrase.as_deref())
                        .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
                session
                    .authenticate_publickey(
                        &self.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                    )
                    .await
                    .map_err(|e| ExecError::connection(host, e))?
                    .success()
            }
            None => {
                let socket = std::env::var_os("SSH_AUTH_SOCK");
                match connect_agent(socket.as_deref().map(Path::new)).await {
                    Some(mut agent) => {
                        self.authenticate_with_agent(&mut session, &mut agent, host, hash_alg)
                            .await?
                    }
                    None => {
                        return Err(auth_failed(
                            "no SSH private key or agent available".to_string(),
                        ));
                    }
                }
            }
        };

        if !authenticated {
            return Err(auth_failed("public key authentication rejected".to_string()));
        }

        Ok(session)
    }

    /// Offer each identity held by the agent until the server accepts one
    async fn authenticate_with_agent(
        &self,
        session: &mut client::Handle<SshClientHandler>,
        agent: &mut AgentClient<tokio::net::UnixStream>,
        host: &str,
        hash_alg: Option<HashAlg>,
    ) -> Result<bool, ExecError> {
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| ExecError::SshKeyError(format!("ssh-agent: {e}")))?;
        debug!(host, count = identities.len(), "trying SSH agent identities");

        for key in identities {
            let auth = session
                .authenticate_publickey_with(&self.user, key, hash_alg, agent)
                .await
                .map_err(|e| ExecError::connection(host, e))?;
            if auth.success() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Connect to the agent listening on `socket`, if any
async fn connect_agent(socket: Option<&Path>) -> Option<AgentClient<tokio::net::UnixStream>> {
    let socket = socket?;
    match AgentClient::connect_uds(socket).await {
        Ok(agent) => Some(agent),
        Err(e) => {
            debug!(socket = %socket.display(), error = %e, "SSH agent unavailable");
            None
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self), fields(user = %self.user))]
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, ExecError> {
        info!(
            host,
            port = self.config.port,
            user = %self.user,
            "connecting to SSH"
        );

        let session = self.handshake(host).await.inspect_err(|e| {
            error!(host, error = %e, "SSH connection failed");
        })?;

        info!(host, "SSH connected and authenticated");

        Ok(Arc::new(SshConnection {
            host: host.to_string(),
            session,
            closed: AtomicBool::new(false),
        }))
    }

    fn backend(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn display_target(&self, host: &str) -> String {
        format!("{}@{host}", self.user)
    }
}
