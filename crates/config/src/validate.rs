//! Semantic validation of a loaded config.

use secrecy::ExposeSecret;

use crate::schema::SwitchyardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "limits.chunk_size"
    pub path: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path,
            message: message.into(),
        });
    }
}

pub fn validate(config: &SwitchyardConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let limits = &config.limits;

    for (path, value) in [
        ("limits.pending_call_ttl_secs", limits.pending_call_ttl_secs),
        ("limits.transfer_ttl_secs", limits.transfer_ttl_secs),
        ("limits.sweep_interval_secs", limits.sweep_interval_secs),
        ("limits.handshake_timeout_ms", limits.handshake_timeout_ms),
    ] {
        if value == 0 {
            result.push(Severity::Error, path, "must be greater than zero");
        }
    }

    if limits.chunk_size == 0 {
        result.push(Severity::Error, "limits.chunk_size", "must be greater than zero");
    } else if limits.chunk_size + 4 > limits.max_payload_bytes {
        result.push(
            Severity::Error,
            "limits.chunk_size",
            format!(
                "chunk of {} bytes plus header exceeds max_payload_bytes ({})",
                limits.chunk_size, limits.max_payload_bytes
            ),
        );
    }

    if limits.sweep_interval_secs > limits.pending_call_ttl_secs {
        result.push(
            Severity::Warning,
            "limits.sweep_interval_secs",
            "sweep runs less often than calls expire; expiry will be late",
        );
    }

    if let Some(token) = &config.auth.token
        && token.expose_secret().is_empty()
    {
        result.push(
            Severity::Warning,
            "auth.token",
            "empty token disables authentication",
        );
    }

    if config.server.bind != "127.0.0.1" && config.server.bind != "::1" && !config.auth.is_enabled()
    {
        result.push(
            Severity::Warning,
            "auth.token",
            format!(
                "listening on {} without a shared secret",
                config.server.bind
            ),
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use {super::*, crate::schema::AuthConfig};

    #[test]
    fn defaults_are_clean() {
        let result = validate(&SwitchyardConfig::default());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn zero_ttl_is_an_error() {
        let mut cfg = SwitchyardConfig::default();
        cfg.limits.transfer_ttl_secs = 0;
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "limits.transfer_ttl_secs");
    }

    #[test]
    fn chunk_larger_than_payload_is_an_error() {
        let mut cfg = SwitchyardConfig::default();
        cfg.limits.chunk_size = cfg.limits.max_payload_bytes;
        assert!(validate(&cfg).has_errors());
    }

    #[test]
    fn public_bind_without_token_warns() {
        let mut cfg = SwitchyardConfig::default();
        cfg.server.bind = "0.0.0.0".into();
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.diagnostics.len(), 1);

        cfg.auth = AuthConfig::with_token("x");
        assert!(validate(&cfg).diagnostics.is_empty());
    }
}
