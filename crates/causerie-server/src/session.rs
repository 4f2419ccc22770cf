//! WebSocket session handling.
//!
//! One socket = one authenticated session: a presence reference held for
//! the socket's lifetime, plus the set of conversation subscriptions and
//! presence watches the client has asked for.  Events flow out through a
//! bounded queue (the hub side enforces disconnect-on-overflow); any
//! inbound frame counts as liveness.

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use causerie_shared::proto::{ClientFrame, ErrorCode, ServerFrame};
use causerie_shared::types::{ConversationId, UserId};

use crate::api::AppState;
use crate::error::ServerError;
use crate::fanout::{FanoutHub, Subscription};

/// Live registrations held for the duration of one socket.  Dropping a
/// guard releases it, so clearing these maps is the whole cleanup story.
#[derive(Default)]
struct SessionState {
    subscriptions: HashMap<ConversationId, Subscription>,
    watches: HashMap<UserId, Subscription>,
}

/// `GET /session?token=<credential>` -- authenticate, then upgrade.
///
/// The credential travels as a query parameter because browser WebSocket
/// clients cannot set request headers.
pub async fn session_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = params.get("token").map(String::as_str).unwrap_or("");
    if credential.is_empty() {
        return ServerError::Unauthenticated("missing token query parameter".into())
            .into_response();
    }

    match state.auth.authenticate(credential).await {
        Ok(user) => ws.on_upgrade(move |socket| run_session(state, user, socket)),
        Err(e) => e.into_response(),
    }
}

async fn run_session(state: AppState, user: UserId, socket: WebSocket) {
    let (frames_tx, mut frames_rx) =
        mpsc::channel::<ServerFrame>(state.config.fanout_queue_cap);

    let conn = match state.presence.connect(&user).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(user = %user, error = %e, "refusing session, presence bind failed");
            return;
        }
    };
    debug!(user = %user, "session opened");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound pump: bounded queue -> socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to encode server frame");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = SessionState::default();

    while let Some(incoming) = ws_rx.next().await {
        let msg = match incoming {
            Ok(msg) => msg,
            Err(e) => {
                debug!(user = %user, error = %e, "socket error, closing session");
                break;
            }
        };

        // Anything the client sends proves the connection is alive.
        state.presence.heartbeat(&user, conn).await;

        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(frame) => handle_frame(&state.hub, &user, frame, &frames_tx, &mut session),
                Err(e) => {
                    send_error(&frames_tx, ErrorCode::BadRequest, format!("bad frame: {e}"));
                }
            },
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Binary(_) => {
                send_error(
                    &frames_tx,
                    ErrorCode::BadRequest,
                    "binary frames are not part of the protocol".into(),
                );
            }
        }
    }

    // Release subscriptions first so the hub drops its sink clones, then
    // close our own sender; the writer drains and exits.
    session.subscriptions.clear();
    session.watches.clear();
    drop(frames_tx);
    state.presence.disconnect(&user, conn).await;
    let _ = writer.await;

    debug!(user = %user, "session closed");
}

fn handle_frame(
    hub: &FanoutHub,
    user: &UserId,
    frame: ClientFrame,
    tx: &mpsc::Sender<ServerFrame>,
    session: &mut SessionState,
) {
    match frame {
        ClientFrame::Subscribe { conversation_id } => {
            if !conversation_id.includes(user) {
                send_error(
                    tx,
                    ErrorCode::Unauthorized,
                    "not a participant of this conversation".into(),
                );
                return;
            }
            session
                .subscriptions
                .entry(conversation_id.clone())
                .or_insert_with(|| {
                    hub.subscribe_conversation(conversation_id, user.clone(), tx.clone())
                });
        }
        ClientFrame::Unsubscribe { conversation_id } => {
            // Dropping the guard releases the registration.
            session.subscriptions.remove(&conversation_id);
        }
        ClientFrame::Watch { user_id } => {
            session.watches.entry(user_id.clone()).or_insert_with(|| {
                hub.watch_user(user_id, user.clone(), tx.clone())
            });
        }
        ClientFrame::Unwatch { user_id } => {
            session.watches.remove(&user_id);
        }
        // The deadline was already refreshed above; the frame carries no
        // other payload.
        ClientFrame::Heartbeat => {}
    }
}

fn send_error(tx: &mpsc::Sender<ServerFrame>, code: ErrorCode, message: String) {
    let _ = tx.try_send(ServerFrame::Error { code, message });
}
