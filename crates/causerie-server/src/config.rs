//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.  When unset, the platform data directory is
    /// used (see `causerie_store::Database::new`).
    /// Env: `DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Filesystem path where avatar blobs are stored.
    /// Env: `AVATAR_STORAGE_PATH`
    /// Default: `./avatars`
    pub avatar_storage_path: PathBuf,

    /// Maximum avatar upload size in bytes (2 MiB).
    pub max_avatar_size: usize,

    /// Ed25519 public key of the identity provider (hex-encoded, 64 chars).
    /// Session tokens are verified against this key.
    /// Env: `IDENTITY_PROVIDER_PUBKEY`
    /// Default: all-zeros (development only; rejects every token).
    pub identity_provider_pubkey: [u8; 32],

    /// Liveness window: a connection that neither sends a frame nor a
    /// heartbeat within this window is treated as dead and its presence
    /// reference is dropped.
    /// Env: `PRESENCE_TIMEOUT_SECS`
    /// Default: 60
    pub presence_timeout: Duration,

    /// Per-subscriber delivery queue capacity.  A session whose queue
    /// overflows is disconnected rather than backpressuring senders.
    /// Env: `FANOUT_QUEUE_CAP`
    /// Default: 256
    pub fanout_queue_cap: usize,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Causerie"`
    pub instance_name: String,

    /// Admin API bearer token.  Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: None,
            avatar_storage_path: PathBuf::from("./avatars"),
            max_avatar_size: 2 * 1024 * 1024, // 2 MiB
            identity_provider_pubkey: [0u8; 32],
            presence_timeout: Duration::from_secs(60),
            fanout_queue_cap: 256,
            instance_name: "Causerie".to_string(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("AVATAR_STORAGE_PATH") {
            config.avatar_storage_path = PathBuf::from(path);
        }

        if let Ok(hex_key) = std::env::var("IDENTITY_PROVIDER_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.identity_provider_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid IDENTITY_PROVIDER_PUBKEY, using default (dev-only)"
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("PRESENCE_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.presence_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid PRESENCE_TIMEOUT_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("FANOUT_QUEUE_CAP") {
            match val.parse::<usize>() {
                Ok(cap) if cap > 0 => config.fanout_queue_cap = cap,
                _ => tracing::warn!(value = %val, "Invalid FANOUT_QUEUE_CAP, using default"),
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a 64-character hex string into a 32-byte array.
pub fn parse_hex_pubkey(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }

    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
