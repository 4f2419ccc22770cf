use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use causerie_shared::types::{Conversation, ConversationId, Message, Presence, User, UserId};

use crate::auth::SessionAuth;
use crate::avatar_store::AvatarStore;
use crate::chat_log::ChatLog;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::fanout::FanoutHub;
use crate::presence::PresenceTracker;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session;

#[derive(Clone)]
pub struct AppState {
    pub store: causerie_store::StoreHandle,
    pub chat_log: ChatLog,
    pub presence: PresenceTracker,
    pub hub: FanoutHub,
    pub auth: SessionAuth,
    pub avatars: Arc<AvatarStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/session", get(session::session_handler))
        .route("/messages", post(send_message))
        .route("/conversations", get(list_conversations))
        .route("/conversations/{id}/messages", get(conversation_messages))
        .route("/users", get(list_users))
        .route("/profile", put(update_profile))
        .route("/profile/push-token", put(register_push_token))
        .route("/profile/avatar", post(avatar_upload))
        .route("/avatars/{user_id}", get(avatar_download))
        .route("/logout", post(logout))
        .route("/admin/status", get(admin_status))
        .layer(DefaultBodyLimit::max(state.config.max_avatar_size + 64 * 1024))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the `Authorization: Bearer <credential>` header to a principal.
pub async fn require_auth(headers: &HeaderMap, state: &AppState) -> Result<UserId, ServerError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let credential = auth.strip_prefix("Bearer ").unwrap_or(auth);
    if credential.is_empty() {
        return Err(ServerError::Unauthenticated("missing credential".into()));
    }

    state.auth.authenticate(credential).await
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    receiver_id: UserId,
    text: String,
    attachment_url: Option<String>,
}

/// A user as exposed over the API: everything except the push token, which
/// is device-private.
#[derive(Serialize)]
struct UserResponse {
    id: UserId,
    display_name: String,
    email: String,
    presence: Presence,
    last_seen_at: Option<DateTime<Utc>>,
    avatar_url: Option<String>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name,
            email: user.email,
            presence: user.presence,
            last_seen_at: user.last_seen_at,
            avatar_url: user.avatar_url,
        }
    }
}

#[derive(Deserialize)]
struct UpdateProfileRequest {
    display_name: String,
}

#[derive(Deserialize)]
struct PushTokenRequest {
    token: String,
}

#[derive(Serialize)]
struct AvatarUploadResponse {
    avatar_url: String,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    version: &'static str,
    uptime_secs: u64,
    online_users: usize,
    registered_users: i64,
    live_subscriptions: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>, ServerError> {
    let sender = require_auth(&headers, &state).await?;
    let message = state
        .chat_log
        .send(&sender, &req.receiver_id, req.text, req.attachment_url)
        .await?;
    Ok(Json(message))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    let principal = require_auth(&headers, &state).await?;
    let conversations = state.chat_log.conversations_for(&principal).await?;
    Ok(Json(conversations))
}

async fn conversation_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let principal = require_auth(&headers, &state).await?;
    let conversation = ConversationId(id);

    if !conversation.includes(&principal) {
        return Err(ServerError::Unauthorized(
            "not a participant of this conversation".into(),
        ));
    }

    let messages = state.chat_log.history(&conversation).await?;
    Ok(Json(messages))
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserResponse>>, ServerError> {
    require_auth(&headers, &state).await?;
    let users = state.store.call(|db| db.list_users()).await?;
    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let principal = require_auth(&headers, &state).await?;

    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() || display_name.len() > 80 {
        return Err(ServerError::BadRequest(
            "display name must be 1..=80 characters".into(),
        ));
    }

    {
        let principal = principal.clone();
        state
            .store
            .call(move |db| db.set_display_name(&principal, &display_name))
            .await?;
    }

    info!(user = %principal, "display name updated");
    Ok(Json(serde_json::json!({ "updated": true })))
}

async fn register_push_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PushTokenRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let principal = require_auth(&headers, &state).await?;

    if req.token.is_empty() {
        return Err(ServerError::BadRequest("empty push token".into()));
    }

    {
        let principal = principal.clone();
        state
            .store
            .call(move |db| db.set_push_token(&principal, &req.token))
            .await?;
    }

    info!(user = %principal, "push token registered");
    Ok(Json(serde_json::json!({ "registered": true })))
}

async fn avatar_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<AvatarUploadResponse>, ServerError> {
    let principal = require_auth(&headers, &state).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let data = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

            let avatar_url = state.avatars.store(&principal, &data).await?;
            {
                let principal = principal.clone();
                let url = avatar_url.clone();
                state
                    .store
                    .call(move |db| db.set_avatar_url(&principal, &url))
                    .await?;
            }

            info!(user = %principal, size = data.len(), "Avatar uploaded");
            return Ok(Json(AvatarUploadResponse { avatar_url }));
        }
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn avatar_download(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Vec<u8>, ServerError> {
    let data = state.avatars.load(&UserId::new(user_id)).await?;
    Ok(data)
}

/// Explicit sign-out: drop every live connection for the principal and
/// record the offline transition immediately.
async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
    let principal = require_auth(&headers, &state).await?;
    state.presence.force_offline(&principal).await;

    info!(user = %principal, "signed out");
    Ok(Json(serde_json::json!({ "signed_out": true })))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Unauthorized(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on the admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Unauthorized("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let registered_users = state.store.call(|db| db.count_users()).await?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online_users: state.presence.online_count(),
        registered_users,
        live_subscriptions: state.hub.subscription_count(),
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenVerifier;
    use crate::notify::{LogPushProvider, Notifier};
    use causerie_shared::token::create_session_token;
    use causerie_store::{Database, StoreHandle};
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    struct TestEnv {
        state: AppState,
        key: SigningKey,
        _avatar_dir: tempfile::TempDir,
    }

    async fn test_env() -> TestEnv {
        let key = SigningKey::generate(&mut OsRng);
        let mut config = ServerConfig::default();
        config.identity_provider_pubkey = key.verifying_key().to_bytes();
        config.admin_token = Some("admin-secret".into());

        let store = StoreHandle::new(Database::open_in_memory().unwrap());
        let hub = FanoutHub::new();
        let notifier = Notifier::new(store.clone(), Arc::new(LogPushProvider));
        let chat_log = ChatLog::new(store.clone(), hub.clone(), notifier);
        let presence = PresenceTracker::new(store.clone(), hub.clone(), config.presence_timeout);
        let verifier = Arc::new(TokenVerifier::new(config.identity_provider_pubkey));
        let auth = SessionAuth::new(verifier, store.clone());

        let avatar_dir = tempfile::TempDir::new().unwrap();
        let avatars = Arc::new(
            AvatarStore::new(avatar_dir.path().to_path_buf(), config.max_avatar_size)
                .await
                .unwrap(),
        );

        TestEnv {
            state: AppState {
                store,
                chat_log,
                presence,
                hub,
                auth,
                avatars,
                rate_limiter: RateLimiter::default(),
                config: Arc::new(config),
                started_at: Instant::now(),
            },
            key,
            _avatar_dir: avatar_dir,
        }
    }

    fn bearer(env: &TestEnv, user: &str) -> HeaderMap {
        let credential = create_session_token(
            &UserId::new(user),
            &format!("{user}@example.com"),
            Utc::now() + Duration::hours(1),
            &env.key,
        )
        .encode();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {credential}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn send_message_end_to_end() {
        let env = test_env().await;

        // Authenticate u2 once so the receiver exists.
        require_auth(&bearer(&env, "u2"), &env.state).await.unwrap();

        let Json(message) = send_message(
            State(env.state.clone()),
            bearer(&env, "u1"),
            Json(SendMessageRequest {
                receiver_id: UserId::new("u2"),
                text: "hello".into(),
                attachment_url: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(message.conversation_id.as_str(), "u1_u2");
        assert_eq!(message.seq, 0);

        let Json(messages) = conversation_messages(
            State(env.state.clone()),
            bearer(&env, "u2"),
            Path("u1_u2".into()),
        )
        .await
        .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
    }

    #[tokio::test]
    async fn history_requires_participation() {
        let env = test_env().await;

        let result = conversation_messages(
            State(env.state.clone()),
            bearer(&env, "outsider"),
            Path("u1_u2".into()),
        )
        .await;

        assert!(matches!(result, Err(ServerError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn history_of_unstarted_conversation_is_empty_for_participants() {
        let env = test_env().await;

        let Json(messages) = conversation_messages(
            State(env.state.clone()),
            bearer(&env, "u1"),
            Path("u1_u2".into()),
        )
        .await
        .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let env = test_env().await;
        let result = require_auth(&HeaderMap::new(), &env.state).await;
        assert!(matches!(result, Err(ServerError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn users_listing_hides_push_tokens() {
        let env = test_env().await;
        require_auth(&bearer(&env, "u1"), &env.state).await.unwrap();
        env.state
            .store
            .call(|db| db.set_push_token(&UserId::new("u1"), "secret-token"))
            .await
            .unwrap();

        let Json(users) = list_users(State(env.state.clone()), bearer(&env, "u1"))
            .await
            .unwrap();
        let json = serde_json::to_string(&users).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(json.contains("u1"));
    }

    #[tokio::test]
    async fn admin_token_is_checked_in_constant_time_paths() {
        let env = test_env().await;

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer admin-secret".parse().unwrap());
        assert!(verify_admin_token(&headers, &env.state.config).is_ok());

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(verify_admin_token(&headers, &env.state.config).is_err());

        let no_admin = ServerConfig::default();
        assert!(verify_admin_token(&headers, &no_admin).is_err());
    }
}
