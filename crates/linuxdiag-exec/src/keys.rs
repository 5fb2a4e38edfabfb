//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::ExecConfig;

/// Key file names searched under `~/.ssh`, preferred first
const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
    /// Search the default key names under this `.ssh` directory
    Discover(PathBuf),
    /// Offer no key and let the transport fall back to its own defaults
    None,
}

impl KeySource {
    /// Pick the key source described by the configuration
    ///
    /// An explicit file wins over an environment key, which wins over
    /// discovery. Discovery is skipped when `allow_discovery` is false (the
    /// native client searches the same locations on its own).
    #[must_use]
    pub fn from_config(config: &ExecConfig, allow_discovery: bool) -> Self {
        if let Some(path) = &config.identity_file {
            return KeySource::Path(path.clone());
        }
        if let Some(var) = &config.identity_env {
            return KeySource::Env(var.clone());
        }
        if allow_discovery
            && config.search_identity
            && let Some(home) = dirs::home_dir()
        {
            return KeySource::Discover(home.join(".ssh"));
        }
        KeySource::None
    }

    /// Resolve key source to a usable file
    ///
    /// For `Env`, decodes base64 and writes to temp file
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, etc.)
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                if !path.is_file() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                info!(path = %path.display(), "using configured SSH key");
                Ok(ResolvedKey::Path(path.clone()))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;

                // Write to temp file
                let temp_path = write_temp_key(&key_data)?;
                Ok(ResolvedKey::Temp(temp_path))
            }
            KeySource::Discover(ssh_dir) => Ok(discover_key(ssh_dir)
                .map(ResolvedKey::Path)
                .unwrap_or(ResolvedKey::None)),
            KeySource::None => {
                debug!("not providing an SSH key");
                Ok(ResolvedKey::None)
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Temporary file (will be deleted on drop)
    Temp(PathBuf),
    /// No key available
    None,
}

impl ResolvedKey {
    /// Get path for SSH library
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResolvedKey::Path(p) | ResolvedKey::Temp(p) => Some(p),
            ResolvedKey::None => None,
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// First default key present under `ssh_dir`
#[must_use]
pub fn discover_key(ssh_dir: &Path) -> Option<PathBuf> {
    debug!(dir = %ssh_dir.display(), "searching default SSH key locations");

    let found = DEFAULT_KEY_NAMES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|candidate| candidate.is_file());

    match &found {
        Some(path) => info!(path = %path.display(), "using SSH key"),
        None => warn!(dir = %ssh_dir.display(), "no SSH private key found in default locations"),
    }
    found
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<PathBuf, KeyError> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let temp_path =
        std::env::temp_dir().join(format!("linuxdiag_ssh_key_{}", std::process::id()));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)?;
    file.write_all(key_data)?;

    debug!(path = %temp_path.display(), "wrote temporary SSH key");

    Ok(temp_path)
}

impl Drop for ResolvedKey {
    fn drop(&mut self) {
        if let ResolvedKey::Temp(path) = self
            && let Err(e) = std::fs::remove_file(&*path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove temp key");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn touch(path: &Path, mode: u32) {
        std::fs::write(path, b"key").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_discover_prefers_ed25519() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("id_rsa"), 0o600);
        touch(&dir.path().join("id_ed25519"), 0o600);

        assert_eq!(discover_key(dir.path()), Some(dir.path().join("id_ed25519")));
    }

    #[test]
    fn test_discover_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(discover_key(dir.path()), None);

        let resolved = KeySource::Discover(dir.path().to_path_buf()).resolve().unwrap();
        assert!(resolved.path().is_none());
    }

    #[test]
    fn test_explicit_path_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeySource::Path(dir.path().join("nope")).resolve().unwrap_err();
        assert!(matches!(err, KeyError::NotFound(_)));
    }

    #[test]
    fn test_explicit_path_too_open() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        touch(&key, 0o644);
        let err = KeySource::Path(key).resolve().unwrap_err();
        assert!(matches!(err, KeyError::BadPermissions(_)));
    }

    #[test]
    fn test_explicit_file_wins_over_discovery() {
        let config = ExecConfig {
            identity_file: Some(PathBuf::from("/keys/deploy")),
            identity_env: Some("DEPLOY_KEY".to_string()),
            ..ExecConfig::default()
        };
        assert!(matches!(
            KeySource::from_config(&config, true),
            KeySource::Path(p) if p == Path::new("/keys/deploy")
        ));
    }

    #[test]
    fn test_no_discovery_for_native_client() {
        let config = ExecConfig::default();
        assert!(matches!(KeySource::from_config(&config, false), KeySource::None));
    }
}
