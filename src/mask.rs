// SPDX-License-Identifier: MPL-2.0

//! Redaction of sensitive substrings in captured text (§4.3).
//!
//! The default catalog is compiled into a single alternation so masking one
//! chunk of output costs one linear pass, regardless of how many pattern
//! categories are enabled.

use regex::Regex;

const DEFAULT_REPLACEMENT: &str = "[REDACTED]";

/// One named branch of the compiled alternation. `pre`/`post` (when present)
/// are kept verbatim in the output; only the text between them is replaced.
struct Category {
    name: &'static str,
    /// Regex source with named groups `{name}_pre` (optional), `{name}_secret`,
    /// `{name}_post` (optional).
    pattern: &'static str,
}

const CATEGORIES: &[Category] = &[
    Category {
        name: "json_kv",
        pattern: r#"(?P<json_kv_pre>(?i:"(?:api_key|apikey|password|token|secret|client_secret)"\s*:\s*"))(?P<json_kv_secret>[^"]*)(?P<json_kv_post>")"#,
    },
    Category {
        name: "assignment",
        pattern: r#"(?P<assignment_pre>(?i:\b(?:api_key|apikey|password|token|secret|client_secret)\b\s*[:=]\s*"?))(?P<assignment_secret>[^"\s,}]+)(?P<assignment_post>"?)"#,
    },
    Category {
        name: "auth_header",
        pattern: r#"(?P<auth_header_pre>(?i:Authorization:\s*(?:Bearer|Basic)\s+))(?P<auth_header_secret>\S+)"#,
    },
    Category {
        name: "aws_access_key",
        pattern: r#"(?P<aws_access_key_secret>\b(?:AKIA|ASIA)[0-9A-Z]{16}\b)"#,
    },
    Category {
        name: "gcp_api_key",
        pattern: r#"(?P<gcp_api_key_secret>\bAIza[0-9A-Za-z\-_]{35}\b)"#,
    },
    Category {
        name: "provider_token",
        pattern: r#"(?P<provider_token_secret>\b(?:ghp|ghs|gho|ghu|ghr|github_pat)_[A-Za-z0-9_]{20,}\b)"#,
    },
    Category {
        name: "pem_block",
        pattern: r#"(?P<pem_block_secret>-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----)"#,
    },
    Category {
        name: "env_var",
        pattern: r#"(?P<env_var_pre>\b[A-Z][A-Z0-9_]*(?:SECRET|TOKEN|KEY|PASSWORD)[A-Z0-9_]*=)(?P<env_var_secret>\S+)"#,
    },
    Category {
        name: "cli_flag",
        pattern: r#"(?P<cli_flag_pre>(?i:--(?:password|client-secret|secret))(?:=|\s+))(?P<cli_flag_secret>\S+)"#,
    },
];

/// A configurable redactor applied to stdout, stderr, error messages, and
/// the reconstructed command recorded on every [`crate::outcome::Outcome`].
pub struct Masker {
    enabled: bool,
    combined: Regex,
    replacement: String,
}

impl Masker {
    /// The default pattern catalog, enabled.
    pub fn default_enabled() -> Self {
        Masker::with_replacement(true, DEFAULT_REPLACEMENT)
    }

    pub fn disabled() -> Self {
        Masker::with_replacement(false, DEFAULT_REPLACEMENT)
    }

    pub fn with_replacement(enabled: bool, replacement: impl Into<String>) -> Self {
        let source = CATEGORIES
            .iter()
            .map(|c| format!("(?:{})", c.pattern))
            .collect::<Vec<_>>()
            .join("|");
        let combined = Regex::new(&source).expect("default mask catalog must compile");
        Masker {
            enabled,
            combined,
            replacement: replacement.into(),
        }
    }

    /// Build a masker from extra user-supplied patterns layered on top of
    /// (or instead of) the default catalog. Each extra pattern is treated as
    /// a whole-match replacement (no pre/post groups).
    pub fn with_patterns(
        enabled: bool,
        extra_patterns: &[String],
        replacement: impl Into<String>,
        include_defaults: bool,
    ) -> Result<Self, regex::Error> {
        let mut branches: Vec<String> = Vec::new();
        if include_defaults {
            branches.extend(CATEGORIES.iter().map(|c| format!("(?:{})", c.pattern)));
        }
        for (i, p) in extra_patterns.iter().enumerate() {
            branches.push(format!("(?P<extra_{i}>{p})"));
        }
        let source = branches.join("|");
        let combined = Regex::new(&source)?;
        Ok(Masker {
            enabled,
            combined,
            replacement: replacement.into(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Redact every match in `input`, preserving non-matched bytes and any
    /// captured `_pre`/`_post` groups verbatim. Idempotent: masking already
    /// masked text is a no-op.
    pub fn mask(&self, input: &str) -> String {
        if !self.enabled {
            return input.to_owned();
        }
        self.combined
            .replace_all(input, |caps: &regex::Captures| {
                for cat in CATEGORIES {
                    if caps.name(&secret_key(cat.name)).is_some() {
                        let pre = caps.name(&pre_key(cat.name)).map(|m| m.as_str()).unwrap_or("");
                        let post = caps.name(&post_key(cat.name)).map(|m| m.as_str()).unwrap_or("");
                        return format!("{pre}{}{post}", self.replacement);
                    }
                }
                self.replacement.clone()
            })
            .into_owned()
    }
}

fn pre_key(name: &str) -> String {
    format!("{name}_pre")
}
fn secret_key(name: &str) -> String {
    format!("{name}_secret")
}
fn post_key(name: &str) -> String {
    format!("{name}_post")
}

impl Default for Masker {
    fn default() -> Self {
        Masker::default_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_authorization_header_preserving_prefix() {
        let masker = Masker::default_enabled();
        let out = masker.mask("Authorization: Bearer sk-123");
        assert_eq!(out, "Authorization: Bearer [REDACTED]");
        assert!(!out.contains("sk-123"));
    }

    #[test]
    fn masks_json_password_field() {
        let masker = Masker::default_enabled();
        let out = masker.mask(r#"{"password": "hunter2", "user": "bob"}"#);
        assert_eq!(out, r#"{"password": "[REDACTED]", "user": "bob"}"#);
    }

    #[test]
    fn masks_env_assignment() {
        let masker = Masker::default_enabled();
        let out = masker.mask("DB_PASSWORD=hunter2 OTHER=fine");
        assert_eq!(out, "DB_PASSWORD=[REDACTED] OTHER=fine");
    }

    #[test]
    fn masks_github_token_prefix() {
        let masker = Masker::default_enabled();
        let token = format!("ghp_{}", "a".repeat(36));
        let out = masker.mask(&format!("token={token}"));
        assert!(!out.contains(&token));
    }

    #[test]
    fn preserves_non_sensitive_text() {
        let masker = Masker::default_enabled();
        let input = "just a normal log line with no secrets";
        assert_eq!(masker.mask(input), input);
    }

    #[test]
    fn is_idempotent() {
        let masker = Masker::default_enabled();
        let once = masker.mask("Authorization: Bearer sk-123");
        let twice = masker.mask(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn disabled_masker_passes_through() {
        let masker = Masker::disabled();
        let input = "Authorization: Bearer sk-123";
        assert_eq!(masker.mask(input), input);
    }
}
