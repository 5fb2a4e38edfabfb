//! Backend selection

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{BackendKind, ExecConfig};
use crate::error::ExecError;
use crate::pool::ConnectionPool;
use crate::ssh::SshConnector;
use crate::subprocess::SubprocessConnector;
use crate::traits::{Connector, RemotePool};

/// Concrete backend for `config`, resolving `auto`
#[must_use]
pub fn select_backend(config: &ExecConfig) -> BackendKind {
    match config.backend {
        BackendKind::Auto => {
            let native = match &config.ssh_binary {
                Some(path) => path.is_file(),
                None => which::which("ssh").is_ok(),
            };
            debug!(native_client = native, "auto-selecting ssh backend");
            if native {
                BackendKind::Subprocess
            } else {
                BackendKind::InProcess
            }
        }
        explicit => explicit,
    }
}

/// Build the connection pool for the configured backend
///
/// # Errors
/// Returns the connector's setup error (key resolution, socket directory)
pub fn build_pool(config: &ExecConfig) -> Result<Arc<dyn RemotePool>, ExecError> {
    let backend = select_backend(config);
    let connector: Arc<dyn Connector> = match backend {
        BackendKind::Subprocess => Arc::new(SubprocessConnector::new(config)?),
        BackendKind::InProcess | BackendKind::Auto => Arc::new(SshConnector::new(config)?),
    };

    info!(backend = %backend, "remote execution backend selected");
    Ok(Arc::new(ConnectionPool::new(connector)))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_explicit_backend_is_kept() {
        let config = ExecConfig {
            backend: BackendKind::InProcess,
            ..ExecConfig::default()
        };
        assert_eq!(select_backend(&config), BackendKind::InProcess);
    }

    #[test]
    fn test_auto_without_native_client_uses_in_process() {
        let config = ExecConfig {
            ssh_binary: Some(PathBuf::from("/nonexistent/ssh")),
            ..ExecConfig::default()
        };
        assert_eq!(select_backend(&config), BackendKind::InProcess);
    }

    #[test]
    fn test_auto_with_native_client_uses_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join("ssh");
        std::fs::write(&ssh, "#!/bin/sh\n").unwrap();

        let config = ExecConfig {
            ssh_binary: Some(ssh),
            ..ExecConfig::default()
        };
        assert_eq!(select_backend(&config), BackendKind::Subprocess);
    }

    #[test]
    fn test_build_pool_reports_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecConfig {
            backend: BackendKind::Subprocess,
            search_identity: false,
            control_dir: Some(dir.path().join("ctl")),
            ..ExecConfig::default()
        };

        let pool = build_pool(&config).unwrap();
        assert_eq!(pool.backend(), BackendKind::Subprocess);
    }
}
