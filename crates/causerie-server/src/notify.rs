//! Push-notification dispatch for recipients with no live session.
//!
//! Delivery is best-effort by contract: a failed or impossible dispatch is
//! logged and swallowed, and must never fail or delay the message append
//! that triggered it.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

use causerie_shared::types::{Message, UserId};
use causerie_store::{StoreError, StoreHandle};

/// Title used for every new-message notification.
const NOTIFICATION_TITLE: &str = "New Message";

#[derive(Debug, Error)]
pub enum PushError {
    /// The delivery provider rejected or failed the attempt.
    #[error("Push provider error: {0}")]
    Provider(String),
}

/// Provider-agnostic payload handed to the delivery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNote {
    /// Opaque device token registered by the recipient.
    pub token: String,
    pub title: String,
    pub body: String,
}

/// External push delivery transport (APNs, FCM, ...).
///
/// Returns per-attempt success/failure; retries beyond the provider's own
/// policy are not this layer's concern.
pub trait PushProvider: Send + Sync {
    fn send(&self, note: PushNote) -> BoxFuture<'_, Result<(), PushError>>;
}

/// Default provider: logs the payload instead of delivering it.  Keeps the
/// dispatch path fully exercised in development deployments.
pub struct LogPushProvider;

impl PushProvider for LogPushProvider {
    fn send(&self, note: PushNote) -> BoxFuture<'_, Result<(), PushError>> {
        Box::pin(async move {
            tracing::info!(title = %note.title, body = %note.body, "push notification (log provider)");
            Ok(())
        })
    }
}

/// Converts a stored message event into a push payload and hands it to the
/// provider.
#[derive(Clone)]
pub struct Notifier {
    store: StoreHandle,
    provider: Arc<dyn PushProvider>,
}

impl Notifier {
    pub fn new(store: StoreHandle, provider: Arc<dyn PushProvider>) -> Self {
        Self { store, provider }
    }

    /// Fire-and-forget dispatch; returns immediately.
    pub fn dispatch(&self, receiver: UserId, message: &Message) {
        let this = self.clone();
        let body = message.text.clone();
        tokio::spawn(async move {
            this.dispatch_now(receiver, body).await;
        });
    }

    /// Resolve the receiver's push token and attempt delivery.
    ///
    /// Never returns an error: a missing token is a quiet no-op, and
    /// provider or storage failures are logged and dropped.
    pub async fn dispatch_now(&self, receiver: UserId, body: String) {
        let lookup = {
            let receiver = receiver.clone();
            self.store.call(move |db| db.get_push_token(&receiver)).await
        };

        let token = match lookup {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(receiver = %receiver, "no push token registered, skipping notification");
                return;
            }
            Err(StoreError::NotFound) => {
                debug!(receiver = %receiver, "unknown receiver, skipping notification");
                return;
            }
            Err(e) => {
                warn!(receiver = %receiver, error = %e, "push token lookup failed");
                return;
            }
        };

        let note = PushNote {
            token,
            title: NOTIFICATION_TITLE.to_string(),
            body,
        };

        if let Err(e) = self.provider.send(note).await {
            warn!(receiver = %receiver, error = %e, "push delivery failed");
        }
    }
}

/// Test double that records every payload it is handed.  Shared with the
/// chat-log tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingProvider {
        pub sent: Mutex<Vec<PushNote>>,
        pub fail: bool,
    }

    impl PushProvider for RecordingProvider {
        fn send(&self, note: PushNote) -> BoxFuture<'_, Result<(), PushError>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(note);
                if self.fail {
                    Err(PushError::Provider("simulated outage".into()))
                } else {
                    Ok(())
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingProvider;
    use super::*;
    use causerie_shared::types::{Presence, User};
    use chrono::Utc;

    use causerie_store::Database;

    fn store_with_user(id: &str, push_token: Option<&str>) -> StoreHandle {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&User {
            id: UserId::new(id),
            display_name: id.to_string(),
            email: format!("{id}@example.com"),
            presence: Presence::Offline,
            last_seen_at: None,
            avatar_url: None,
            push_token: None,
            created_at: Utc::now(),
        })
        .unwrap();
        if let Some(token) = push_token {
            db.set_push_token(&UserId::new(id), token).unwrap();
        }
        StoreHandle::new(db)
    }

    #[tokio::test]
    async fn dispatch_builds_the_expected_payload() {
        let provider = Arc::new(RecordingProvider::default());
        let notifier = Notifier::new(store_with_user("u2", Some("tok-9")), provider.clone());

        notifier.dispatch_now(UserId::new("u2"), "hello there".into()).await;

        let sent = provider.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![PushNote {
                token: "tok-9".into(),
                title: "New Message".into(),
                body: "hello there".into(),
            }]
        );
    }

    #[tokio::test]
    async fn missing_token_is_a_quiet_no_op() {
        let provider = Arc::new(RecordingProvider::default());
        let notifier = Notifier::new(store_with_user("u2", None), provider.clone());

        notifier.dispatch_now(UserId::new("u2"), "hello".into()).await;

        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_receiver_is_a_quiet_no_op() {
        let provider = Arc::new(RecordingProvider::default());
        let notifier = Notifier::new(store_with_user("u2", None), provider.clone());

        notifier.dispatch_now(UserId::new("ghost"), "hello".into()).await;

        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_is_swallowed() {
        let provider = Arc::new(RecordingProvider {
            fail: true,
            ..Default::default()
        });
        let notifier = Notifier::new(store_with_user("u2", Some("tok")), provider.clone());

        // Must not panic or propagate.
        notifier.dispatch_now(UserId::new("u2"), "hello".into()).await;
        assert_eq!(provider.sent.lock().unwrap().len(), 1);
    }
}
