//! Execution settings shared by both SSH backends

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Which SSH implementation carries remote commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Native client when one is installed, otherwise in-process
    #[default]
    Auto,
    /// Native `ssh` client with ControlMaster multiplexing
    Subprocess,
    /// In-process russh session
    InProcess,
}

impl FromStr for BackendKind {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "subprocess" | "native" => Ok(BackendKind::Subprocess),
            "in-process" | "inprocess" | "russh" => Ok(BackendKind::InProcess),
            other => Err(ExecError::ConfigError(format!("unknown ssh backend: {other}"))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Auto => write!(f, "auto"),
            BackendKind::Subprocess => write!(f, "subprocess"),
            BackendKind::InProcess => write!(f, "in-process"),
        }
    }
}

/// Configuration consumed by the executors and connection pools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Private key file used for every remote host
    pub identity_file: Option<PathBuf>,
    /// Environment variable holding a base64-encoded private key
    pub identity_env: Option<String>,
    /// Look in `~/.ssh` when no key is configured
    pub search_identity: bool,
    /// Passphrase for the private key
    #[serde(skip_serializing)]
    pub identity_passphrase: Option<String>,
    /// Default per-command timeout in seconds (0 disables)
    pub command_timeout_secs: u64,
    /// Handshake timeout in seconds (0 disables)
    pub connect_timeout_secs: u64,
    /// Enforce strict host key checking
    pub verify_host_keys: bool,
    /// known_hosts file, defaults to `~/.ssh/known_hosts`
    pub known_hosts: Option<PathBuf>,
    /// Seconds the ControlMaster stays up after the last session
    pub control_persist_secs: u64,
    /// Backend selection
    pub backend: BackendKind,
    /// Remote username, `None` lets the transport decide
    pub user: Option<String>,
    /// Remote SSH port; the native client only passes `-p` when it is not 22
    pub port: u16,
    /// Explicit path to the native ssh client
    pub ssh_binary: Option<PathBuf>,
    /// Directory for ControlMaster sockets, defaults to a per-user dir in /tmp
    pub control_dir: Option<PathBuf>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            identity_env: None,
            search_identity: true,
            identity_passphrase: None,
            command_timeout_secs: 30,
            connect_timeout_secs: 10,
            verify_host_keys: false,
            known_hosts: None,
            control_persist_secs: 300,
            backend: BackendKind::Auto,
            user: None,
            port: 22,
            ssh_binary: None,
            control_dir: None,
        }
    }
}

impl ExecConfig {
    /// Default per-command timeout
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.command_timeout_secs)
    }

    /// Handshake timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.connect_timeout_secs)
    }

    /// known_hosts path after applying the default
    #[must_use]
    pub fn effective_known_hosts(&self) -> PathBuf {
        self.known_hosts.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(".ssh")
                .join("known_hosts")
        })
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
