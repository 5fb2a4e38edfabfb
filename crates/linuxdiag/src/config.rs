//! Configuration loading and types

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use linuxdiag_exec::{BackendKind, ExecConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for linuxdiag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Command execution and SSH settings
    #[serde(default)]
    pub exec: ExecConfig,
    /// File this configuration was read from, `None` for built-in defaults
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load from `path`, the default locations, or built-in defaults, then
    /// apply environment overrides
    ///
    /// # Errors
    /// Returns error if a config file exists but is invalid, or an override
    /// has a malformed value
    pub fn load_default(path: Option<&Path>) -> eyre::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::load_from_search_path()?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_from_search_path() -> eyre::Result<Self> {
        // Check environment variable
        if let Ok(path) = std::env::var("LINUXDIAG_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        let mut paths = vec![
            PathBuf::from("linuxdiag.toml"),
            PathBuf::from("/etc/linuxdiag/linuxdiag.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("linuxdiag/linuxdiag.toml"));
        }

        Self::load_first(&paths)
    }

    /// Load the first of `paths` that exists, or the defaults
    ///
    /// Runs before logging is set up, so the caller reports `source`.
    fn load_first(paths: &[PathBuf]) -> eyre::Result<Self> {
        match paths.iter().find(|path| path.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Config::default()),
        }
    }

    /// Apply `LINUXDIAG_*` overrides read through `lookup`
    ///
    /// # Errors
    /// Returns error if an override cannot be parsed
    pub fn apply_env<F>(&mut self, lookup: F) -> eyre::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let exec = &mut self.exec;

        if let Some(path) = lookup("LINUXDIAG_SSH_KEY_PATH").filter(|v| !v.is_empty()) {
            exec.identity_file = Some(PathBuf::from(path));
        }
        if let Some(user) = lookup("LINUXDIAG_USER").filter(|v| !v.is_empty()) {
            exec.user = Some(user);
        }
        if let Some(backend) = lookup("LINUXDIAG_SSH_BACKEND") {
            exec.backend = backend.parse::<BackendKind>()?;
        }
        if let Some(secs) = lookup("LINUXDIAG_COMMAND_TIMEOUT") {
            exec.command_timeout_secs = secs
                .trim()
                .parse()
                .wrap_err_with(|| format!("invalid LINUXDIAG_COMMAND_TIMEOUT: {secs}"))?;
        }
        if let Some(flag) = lookup("LINUXDIAG_VERIFY_HOST_KEYS") {
            exec.verify_host_keys = parse_bool(&flag)
                .ok_or_else(|| eyre::eyre!("invalid LINUXDIAG_VERIFY_HOST_KEYS: {flag}"))?;
        }
        if let Some(path) = lookup("LINUXDIAG_KNOWN_HOSTS_PATH").filter(|v| !v.is_empty()) {
            exec.known_hosts = Some(PathBuf::from(path));
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [log]
            level = "debug"
            json = true

            [exec]
            identity_file = "/home/ops/.ssh/diag"
            command_timeout_secs = 15
            verify_host_keys = true
            backend = "in-process"
            user = "ops"
            "#,
        )
        .unwrap();

        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        assert_eq!(
            config.exec.identity_file.as_deref(),
            Some(Path::new("/home/ops/.ssh/diag"))
        );
        assert_eq!(config.exec.command_timeout_secs, 15);
        assert!(config.exec.verify_host_keys);
        assert_eq!(config.exec.backend, BackendKind::InProcess);
        assert_eq!(config.exec.user.as_deref(), Some("ops"));
        // untouched fields keep their defaults
        assert_eq!(config.exec.control_persist_secs, 300);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.exec.backend, BackendKind::Auto);
        assert_eq!(config.exec.command_timeout_secs, 30);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("LINUXDIAG_SSH_KEY_PATH", "/keys/id_ed25519"),
                ("LINUXDIAG_USER", "diag"),
                ("LINUXDIAG_SSH_BACKEND", "subprocess"),
                ("LINUXDIAG_COMMAND_TIMEOUT", "5"),
                ("LINUXDIAG_VERIFY_HOST_KEYS", "yes"),
                ("LINUXDIAG_KNOWN_HOSTS_PATH", "/etc/ssh/ssh_known_hosts"),
            ]))
            .unwrap();

        let exec = &config.exec;
        assert_eq!(exec.identity_file.as_deref(), Some(Path::new("/keys/id_ed25519")));
        assert_eq!(exec.user.as_deref(), Some("diag"));
        assert_eq!(exec.backend, BackendKind::Subprocess);
        assert_eq!(exec.command_timeout_secs, 5);
        assert!(exec.verify_host_keys);
        assert_eq!(
            exec.known_hosts.as_deref(),
            Some(Path::new("/etc/ssh/ssh_known_hosts"))
        );
    }

    #[test]
    fn test_invalid_env_override_is_error() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("LINUXDIAG_COMMAND_TIMEOUT", "soon")])).is_err());
        assert!(config.apply_env(env(&[("LINUXDIAG_SSH_BACKEND", "telnet")])).is_err());
        assert!(config.apply_env(env(&[("LINUXDIAG_VERIFY_HOST_KEYS", "maybe")])).is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linuxdiag.toml");
        std::fs::write(&path, "[exec\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("linuxdiag.toml"));
    }

    #[test]
    fn test_load_first_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("linuxdiag.toml");
        std::fs::write(&present, "[log]\nlevel = \"info\"\n").unwrap();

        let config = Config::load_first(&[missing.clone(), present.clone()]).unwrap();
        assert_eq!(config.source.as_deref(), Some(present.as_path()));
        assert_eq!(config.log.level, "info");

        let config = Config::load_first(&[missing]).unwrap();
        assert!(config.source.is_none());
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.exec.port, 22);
    }
}
