//! Result types for command execution

use std::borrow::Cow;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How captured stdout/stderr should be handed back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Decode as UTF-8, replacing invalid sequences
    #[default]
    Utf8,
    /// Keep the raw bytes (binary file contents, odd locales)
    Raw,
}

/// Captured output of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Output {
    /// Decoded text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl Output {
    /// Wrap captured bytes according to `encoding`
    #[must_use]
    pub fn decode(bytes: Vec<u8>, encoding: Encoding) -> Self {
        match encoding {
            Encoding::Utf8 => match String::from_utf8(bytes) {
                Ok(text) => Output::Text(text),
                Err(e) => Output::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
            Encoding::Raw => Output::Bytes(bytes),
        }
    }

    /// View as text (lossy for raw bytes)
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Output::Text(s) => Cow::Borrowed(s),
            Output::Bytes(b) => String::from_utf8_lossy(b),
        }
    }

    /// View as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Output::Text(s) => s.as_bytes(),
            Output::Bytes(b) => b,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl PartialEq<&str> for Output {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// stdout output
    pub stdout: Output,
    /// stderr output
    pub stderr: Output,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Build a result from raw captured streams
    #[must_use]
    pub fn from_bytes(
        status: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        encoding: Encoding,
        duration: Duration,
    ) -> Self {
        Self {
            status,
            stdout: Output::decode(stdout, encoding),
            stderr: Output::decode(stderr, encoding),
            duration,
        }
    }

    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}
