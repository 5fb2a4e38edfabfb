//! linuxdiag-exec: local and remote command execution
//!
//! Commands run either on the local machine or on a remote host over SSH.
//! Remote hosts are reached through a pool holding one reusable connection
//! per host, backed by the native `ssh` client (ControlMaster multiplexing)
//! or by an in-process russh session.

pub mod backend;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod local;
pub mod pool;
mod process;
pub mod resolve;
pub mod result;
pub mod ssh;
pub mod subprocess;
pub mod traits;

pub use backend::{build_pool, select_backend};
pub use command::CommandSpec;
pub use config::{BackendKind, ExecConfig};
pub use dispatch::{Dispatcher, ExecOptions};
pub use error::ExecError;
pub use local::LocalExecutor;
pub use pool::ConnectionPool;
pub use resolve::resolve_local;
pub use result::{CommandResult, Encoding, Output};
pub use ssh::{SshConnection, SshConnector};
pub use subprocess::{SubprocessConnection, SubprocessConnector};
pub use traits::{Connection, Connector, RemotePool};
