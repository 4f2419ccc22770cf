//! # causerie-server
//!
//! Realtime messaging and presence backend.
//!
//! This binary provides:
//! - **Conversation log**: durable, ordered, append-only per-conversation
//!   message storage (SQLite) with atomic last-message summaries
//! - **Session gateway**: token-authenticated REST + WebSocket API (axum)
//! - **Presence tracking** with reference-counted connections and a
//!   liveness sweep for abrupt disconnects
//! - **Realtime fan-out** of messages and presence transitions to
//!   subscribed sessions
//! - **Push-notification dispatch** for recipients with no live session
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod auth;
mod avatar_store;
mod chat_log;
mod config;
mod error;
mod fanout;
mod notify;
mod presence;
mod rate_limit;
mod session;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_store::{Database, StoreHandle};

use crate::api::AppState;
use crate::auth::{SessionAuth, TokenVerifier};
use crate::avatar_store::AvatarStore;
use crate::chat_log::ChatLog;
use crate::config::ServerConfig;
use crate::fanout::FanoutHub;
use crate::notify::{LogPushProvider, Notifier};
use crate::presence::PresenceTracker;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,causerie_server=debug")),
        )
        .init();

    info!("Starting Causerie server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.identity_provider_pubkey == [0u8; 32] {
        tracing::warn!(
            "IDENTITY_PROVIDER_PUBKEY is unset; every session token will be rejected"
        );
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable store (runs migrations on open).
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let store = StoreHandle::new(database);

    // Fan-out hub and downstream delivery.
    let hub = FanoutHub::new();
    let notifier = Notifier::new(store.clone(), Arc::new(LogPushProvider));
    let chat_log = ChatLog::new(store.clone(), hub.clone(), notifier);

    // Presence tracking with the configured liveness window.
    let presence = PresenceTracker::new(store.clone(), hub.clone(), config.presence_timeout);

    // Session-token verification against the identity provider's key.
    let verifier = Arc::new(TokenVerifier::new(config.identity_provider_pubkey));
    let auth = SessionAuth::new(verifier.clone(), store.clone());

    // Avatar store (creates directory if missing).
    let avatars = Arc::new(
        AvatarStore::new(config.avatar_storage_path.clone(), config.max_avatar_size).await?,
    );

    // Rate limiter: 20 req/s sustained, burst of 60.
    let rate_limiter = RateLimiter::default();

    // Application state for the HTTP API.
    let app_state = AppState {
        store,
        chat_log,
        presence: presence.clone(),
        hub,
        auth,
        avatars,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Presence liveness sweep at half the timeout window.
    let sweep_interval = config.presence_timeout / 2;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            presence.sweep().await;
        }
    });

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min).
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_idle(std::time::Duration::from_secs(600));
        }
    });

    // Periodic session-token cache cleanup (every 10 minutes).
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            verifier.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly.
    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
