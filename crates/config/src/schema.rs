/// Config schema types (server, auth, storage, limits).
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
    /// Log every request frame (method + param keys) at info level.
    pub ws_request_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18789,
            ws_request_logs: false,
        }
    }
}

/// Shared-secret authentication. When `token` is unset every handshake is
/// accepted.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<Secret<String>>,
}

impl AuthConfig {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(Secret::new(token.into())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty())
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Object store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for stored objects. Defaults to `<data_dir>/objects`.
    pub dir: Option<std::path::PathBuf>,
}

/// Timeouts, expiry and framing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Age after which an unanswered tool or log call is expired.
    pub pending_call_ttl_secs: u64,
    /// Idle time after which a transfer is failed.
    pub transfer_ttl_secs: u64,
    /// Age after which a stored connection attachment is purged.
    pub attachment_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub handshake_timeout_ms: u64,
    pub max_payload_bytes: usize,
    /// Size of binary chunks the router emits when streaming from storage.
    pub chunk_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            pending_call_ttl_secs: 600,
            transfer_ttl_secs: 1800,
            attachment_ttl_secs: 86_400,
            sweep_interval_secs: 30,
            handshake_timeout_ms: 10_000,
            max_payload_bytes: 524_288,
            chunk_size: 65_536,
        }
    }
}
