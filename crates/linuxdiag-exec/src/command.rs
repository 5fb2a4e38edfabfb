//! Command descriptors

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Immutable argv with an optional fallback argv
///
/// The fallback only runs when the primary exits non-zero (or its binary
/// cannot be found).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<Vec<String>>,
}

impl CommandSpec {
    /// Descriptor without a fallback
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            fallback: None,
        }
    }

    /// Copy of this descriptor with `fallback` attached
    #[must_use]
    pub fn with_fallback<I, S>(&self, fallback: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: self.argv.clone(),
            fallback: Some(fallback.into_iter().map(Into::into).collect()),
        }
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn fallback(&self) -> Option<&[String]> {
        self.fallback.as_deref()
    }

    /// Replace `{name}` placeholders in both argvs, returning a new descriptor
    ///
    /// Each argument is scanned once, so substituted values are never
    /// expanded again. Placeholders without a value, and braces that do not
    /// enclose a name, are left as they are.
    #[must_use]
    pub fn substitute(&self, values: &HashMap<String, String>) -> Self {
        let fill = |argv: &[String]| -> Vec<String> {
            argv.iter().map(|arg| fill_placeholders(arg, values)).collect()
        };

        Self {
            argv: fill(&self.argv),
            fallback: self.fallback.as_deref().map(fill),
        }
    }
}

fn fill_placeholders(arg: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_name(&after[..close]) => {
                let name = &after[..close];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_fallback_leaves_original_untouched() {
        let primary = CommandSpec::new(["ss", "-tunap"]);
        let spec = primary.with_fallback(["netstat", "-tunap"]);

        assert_eq!(primary.fallback(), None);
        assert_eq!(spec.argv(), ["ss", "-tunap"]);
        assert_eq!(
            spec.fallback(),
            Some(&["netstat".to_string(), "-tunap".to_string()][..])
        );
    }

    #[test]
    fn test_substitute_placeholders() {
        let spec = CommandSpec::new(["journalctl", "-u", "{unit}", "-n", "{lines}"])
            .with_fallback(["tail", "-n", "{lines}", "/var/log/{unit}.log"]);
        let values = HashMap::from([
            ("unit".to_string(), "nginx".to_string()),
            ("lines".to_string(), "50".to_string()),
        ]);

        let filled = spec.substitute(&values);

        assert_eq!(filled.argv(), ["journalctl", "-u", "nginx", "-n", "50"]);
        assert_eq!(
            filled.fallback().unwrap(),
            ["tail", "-n", "50", "/var/log/nginx.log"]
        );
        assert_eq!(spec.argv()[2], "{unit}");
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        let spec = CommandSpec::new(["cat", "{path}"]);
        let filled = spec.substitute(&HashMap::new());
        assert_eq!(filled, spec);
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let spec = CommandSpec::new(["grep", "{pattern}", "{path}"]);

        // each map gets its own hash seed, so iteration order varies
        for _ in 0..16 {
            let values = HashMap::from([
                ("pattern".to_string(), "{path}".to_string()),
                ("path".to_string(), "/etc/passwd".to_string()),
            ]);
            let filled = spec.substitute(&values);
            assert_eq!(filled.argv(), ["grep", "{path}", "/etc/passwd"]);
        }
    }

    #[test]
    fn test_literal_braces_survive_substitution() {
        let spec = CommandSpec::new(["awk", "{print $1}", "{a{unit}}", "{", "{}"]);
        let values = HashMap::from([("unit".to_string(), "sshd".to_string())]);

        let filled = spec.substitute(&values);

        assert_eq!(filled.argv(), ["awk", "{print $1}", "{asshd}", "{", "{}"]);
    }

    #[test]
    fn test_deserialize_descriptor() {
        let spec: CommandSpec =
            serde_json::from_str(r#"{"argv":["ip","-j","addr"],"fallback":["ifconfig","-a"]}"#)
                .unwrap();
        assert_eq!(spec.argv(), ["ip", "-j", "addr"]);
        assert_eq!(spec.fallback().unwrap(), ["ifconfig", "-a"]);
    }
}
