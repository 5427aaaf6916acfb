use {
    secrecy::{ExposeSecret, Secret},
    switchyard_config::AuthConfig,
};

/// Shared secret resolved from config and environment at startup.
#[derive(Clone, Default)]
pub struct ResolvedAuth {
    pub token: Option<Secret<String>>,
}

impl ResolvedAuth {
    /// An empty configured token counts as no token.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            token: config
                .token
                .as_ref()
                .filter(|t| !t.expose_secret().is_empty())
                .cloned(),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(Secret::new(token.into())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub ok: bool,
    pub reason: Option<&'static str>,
}

impl AuthResult {
    fn granted() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn denied(reason: &'static str) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Check the token presented in `connect` against the configured secret.
pub fn authorize_connect(auth: &ResolvedAuth, provided_token: Option<&str>) -> AuthResult {
    let Some(ref expected) = auth.token else {
        return AuthResult::granted();
    };
    match provided_token {
        Some(t) if safe_equal(t, expected.expose_secret()) => AuthResult::granted(),
        Some(_) => AuthResult::denied("invalid token"),
        None => AuthResult::denied("token required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_equal() {
        assert!(safe_equal("abc", "abc"));
        assert!(!safe_equal("abc", "abd"));
        assert!(!safe_equal("abc", "abcd"));
        assert!(safe_equal("", ""));
    }

    #[test]
    fn test_no_token_configured_grants_everyone() {
        let auth = ResolvedAuth::default();
        assert!(authorize_connect(&auth, None).ok);
        assert!(authorize_connect(&auth, Some("anything")).ok);
    }

    #[test]
    fn test_token_checked() {
        let auth = ResolvedAuth::with_token("s3cret");
        assert!(authorize_connect(&auth, Some("s3cret")).ok);
        assert_eq!(
            authorize_connect(&auth, Some("wrong")),
            AuthResult::denied("invalid token")
        );
        assert_eq!(
            authorize_connect(&auth, None),
            AuthResult::denied("token required")
        );
    }

    #[test]
    fn test_empty_config_token_disables_auth() {
        let auth = ResolvedAuth::from_config(&AuthConfig::with_token(""));
        assert!(!auth.is_enabled());
        let auth = ResolvedAuth::from_config(&AuthConfig::with_token("x"));
        assert!(auth.is_enabled());
    }
}
