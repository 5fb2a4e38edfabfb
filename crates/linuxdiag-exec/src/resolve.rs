//! Translating bare command names into absolute executable paths

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::ExecError;
use crate::result::Encoding;
use crate::traits::Connection;

/// Admin directories that are often missing from a service's PATH
const SBIN_DIRS: [&str; 3] = ["/sbin", "/usr/sbin", "/usr/local/sbin"];

/// Whether `argv0` needs resolving before it can be executed
#[must_use]
pub fn needs_resolution(argv0: &str) -> bool {
    !Path::new(argv0).is_absolute()
}

/// Search path used for local lookups: `$PATH` plus the sbin directories
#[must_use]
pub fn local_search_path() -> OsString {
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();

    for sbin in SBIN_DIRS {
        let sbin = PathBuf::from(sbin);
        if !dirs.contains(&sbin) {
            dirs.push(sbin);
        }
    }

    std::env::join_paths(dirs).unwrap_or_default()
}

/// Resolve `command` on the local filesystem
///
/// # Errors
/// Returns `ExecError::NotFound` if no executable matches
pub fn resolve_local(command: &str) -> Result<PathBuf, ExecError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(command, Some(local_search_path()), cwd).map_err(|_| ExecError::NotFound {
        command: command.to_string(),
        location: "localhost".to_string(),
    })
}

/// Resolve `command` on a remote host with `command -v`
///
/// # Errors
/// Returns `ExecError::NotFound` when the lookup ran but found nothing, and
/// passes transport errors from `conn` through untouched.
pub async fn resolve_remote(
    conn: &dyn Connection,
    command: &str,
    target: &str,
    timeout: Option<Duration>,
) -> Result<String, ExecError> {
    debug!(command, host = conn.host(), "resolving remote binary path");

    let lookup = ["command".to_string(), "-v".to_string(), command.to_string()];
    let result = conn.run(&lookup, timeout, Encoding::Utf8).await?;

    parse_lookup(command, target, result.status, &result.stdout.as_text())
}

/// Interpret the outcome of a `command -v` lookup
///
/// # Errors
/// Returns `ExecError::NotFound` on a non-zero status or empty output
pub fn parse_lookup(
    command: &str,
    target: &str,
    status: i32,
    stdout: &str,
) -> Result<String, ExecError> {
    let path = stdout.trim();
    if status == 0 && !path.is_empty() {
        return Ok(path.to_string());
    }
    Err(ExecError::NotFound {
        command: command.to_string(),
        location: target.to_string(),
    })
}

/// Copy of `argv` with the first element replaced by `binary`
#[must_use]
pub fn with_binary(argv: &[String], binary: impl Into<String>) -> Vec<String> {
    let mut resolved = Vec::with_capacity(argv.len());
    resolved.push(binary.into());
    resolved.extend(argv.iter().skip(1).cloned());
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_path_includes_sbin() {
        let path = local_search_path();
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        for sbin in SBIN_DIRS {
            assert!(dirs.contains(&PathBuf::from(sbin)));
        }
    }

    #[test]
    fn test_resolve_local_finds_sh() {
        let path = resolve_local("sh").unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_resolve_local_not_found() {
        let err = resolve_local("definitely-not-a-real-binary-xyz").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_lookup() {
        assert_eq!(
            parse_lookup("ls", "h1", 0, "/usr/bin/ls\n").unwrap(),
            "/usr/bin/ls"
        );

        let err = parse_lookup("ss", "admin@h1", 1, "").unwrap_err();
        assert_eq!(err.to_string(), "unable to find command 'ss' on admin@h1");

        assert!(parse_lookup("ss", "h1", 0, "  \n").unwrap_err().is_not_found());
    }

    #[test]
    fn test_with_binary_leaves_original_untouched() {
        let argv = vec!["ss".to_string(), "-tunap".to_string()];
        let resolved = with_binary(&argv, "/usr/sbin/ss");
        assert_eq!(resolved, vec!["/usr/sbin/ss", "-tunap"]);
        assert_eq!(argv[0], "ss");
    }

    #[test]
    fn test_needs_resolution() {
        assert!(needs_resolution("ls"));
        assert!(!needs_resolution("/bin/ls"));
    }
}
