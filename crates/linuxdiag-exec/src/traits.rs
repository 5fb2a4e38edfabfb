//! Connection and pool traits shared by both SSH backends

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BackendKind;
use crate::error::ExecError;
use crate::result::{CommandResult, Encoding};

/// One logical channel to one remote host
///
/// `UNCONNECTED → CONNECTED → CLOSED`; a closed connection never becomes
/// usable again.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run `argv` on the remote host
    ///
    /// A non-zero exit status is returned as a normal result; transport
    /// failures and timeouts are errors.
    async fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError>;

    /// Release the transport; never fails
    async fn close(&self);

    /// Whether the transport is still usable
    fn is_connected(&self) -> bool;

    /// Host identifier this connection was opened for
    fn host(&self) -> &str;
}

/// Opens new connections for a pool
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `host` (handshake/authentication included)
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, ExecError>;

    /// Backend implemented by this connector
    fn backend(&self) -> BackendKind;

    /// Remove any on-disk artifacts once every connection is closed
    async fn shutdown(&self) {}

    /// `user@host` (or bare host) for error messages
    fn display_target(&self, host: &str) -> String {
        host.to_string()
    }
}

/// Registry of reusable connections keyed by host
#[async_trait]
pub trait RemotePool: Send + Sync {
    /// Reuse the live connection for `host` or open a new one
    async fn get_or_create(&self, host: &str) -> Result<Arc<dyn Connection>, ExecError>;

    /// Resolve `argv[0]` if needed and run `argv` on `host`
    async fn execute_remote(
        &self,
        argv: &[String],
        host: &str,
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError>;

    /// Absolute path of `command` on `host`
    async fn which(
        &self,
        command: &str,
        host: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ExecError>;

    /// Close every pooled connection and clean up backend artifacts
    async fn close_all(&self);

    /// Backend in use
    fn backend(&self) -> BackendKind;
}
