//! Session-token verification and principal resolution.
//!
//! Credential checking proper (passwords, OAuth) lives in the external
//! identity provider; what reaches this process is an Ed25519-signed
//! session token.  [`TokenVerifier`] validates tokens against the
//! provider's configured public key and caches successful verifications so
//! repeated requests skip the signature check.  [`SessionAuth`] adds the
//! gateway side: the first time a token is seen, the user record is created
//! in the identity store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use causerie_shared::token::SessionToken;
use causerie_shared::types::{Presence, User, UserId};
use causerie_store::{StoreError, StoreHandle};

use crate::error::ServerError;

// ---------------------------------------------------------------------------
// Token verifier
// ---------------------------------------------------------------------------

/// A cached positive verification.
#[derive(Debug, Clone)]
struct CachedAuth {
    user_id: UserId,
    email: String,
    expires_at: DateTime<Utc>,
}

impl CachedAuth {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Result of verifying a credential.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub user_id: UserId,
    pub email: String,
    /// `false` when served from the verification cache.
    pub fresh: bool,
}

/// Verifies and caches session tokens for the configured identity provider
/// key.
pub struct TokenVerifier {
    /// The identity provider's Ed25519 public key.
    provider_pubkey: [u8; 32],
    /// Cache: credential string -> verified principal.
    cache: RwLock<HashMap<String, CachedAuth>>,
}

impl TokenVerifier {
    pub fn new(provider_pubkey: [u8; 32]) -> Self {
        Self {
            provider_pubkey,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Verify a credential string.
    ///
    /// Successful verifications are cached until the token expires, so
    /// subsequent requests with the same credential skip the cryptographic
    /// check.
    pub async fn verify(&self, credential: &str) -> Result<VerifiedToken, ServerError> {
        // 1. Check the cache first.
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(credential) {
                if entry.is_fresh() {
                    debug!(user = %entry.user_id, "session token served from cache");
                    return Ok(VerifiedToken {
                        user_id: entry.user_id.clone(),
                        email: entry.email.clone(),
                        fresh: false,
                    });
                }
            }
        }

        // 2. Perform full decoding + signature verification.
        let token = SessionToken::decode(credential)
            .map_err(|e| ServerError::Unauthenticated(e.to_string()))?;
        token
            .verify_with_key(&self.provider_pubkey)
            .map_err(|e| ServerError::Unauthenticated(e.to_string()))?;

        // 3. Update the cache.
        {
            let mut cache = self.cache.write().await;
            cache.insert(
                credential.to_string(),
                CachedAuth {
                    user_id: token.user_id.clone(),
                    email: token.email.clone(),
                    expires_at: token.expires_at,
                },
            );
        }

        debug!(user = %token.user_id, until = %token.expires_at, "session token verified");

        Ok(VerifiedToken {
            user_id: token.user_id,
            email: token.email,
            fresh: true,
        })
    }

    /// Evict expired entries from the cache.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "purged expired session-token cache entries");
        }
    }
}

// ---------------------------------------------------------------------------
// Session authentication
// ---------------------------------------------------------------------------

/// Resolves credentials to principals and materializes user records on
/// first authentication.
#[derive(Clone)]
pub struct SessionAuth {
    verifier: std::sync::Arc<TokenVerifier>,
    store: StoreHandle,
}

impl SessionAuth {
    pub fn new(verifier: std::sync::Arc<TokenVerifier>, store: StoreHandle) -> Self {
        Self { verifier, store }
    }

    /// Authenticate a credential and return the principal id.
    ///
    /// On the first successful verification of a token, the user record is
    /// created if it does not exist yet (display name defaults to the email
    /// local part).
    pub async fn authenticate(&self, credential: &str) -> Result<UserId, ServerError> {
        let verified = self.verifier.verify(credential).await?;
        if verified.fresh {
            self.ensure_user(&verified).await?;
        }
        Ok(verified.user_id)
    }

    async fn ensure_user(&self, verified: &VerifiedToken) -> Result<(), ServerError> {
        let lookup = {
            let id = verified.user_id.clone();
            self.store.call(move |db| db.get_user(&id)).await
        };

        match lookup {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound) => {
                let user = User {
                    id: verified.user_id.clone(),
                    display_name: default_display_name(&verified.email, &verified.user_id),
                    email: verified.email.clone(),
                    presence: Presence::Offline,
                    last_seen_at: None,
                    avatar_url: None,
                    push_token: None,
                    created_at: Utc::now(),
                };
                info!(user = %user.id, "first authentication, creating user record");
                let row = user.clone();
                self.store.call(move |db| db.upsert_user(&row)).await?;
                Ok(())
            }
            Err(e) => Err(ServerError::Storage(e)),
        }
    }
}

/// Default display name: the email local part, falling back to the
/// principal id for odd addresses.
fn default_display_name(email: &str, user_id: &UserId) -> String {
    match email.split('@').next() {
        Some(local) if !local.is_empty() => local.to_string(),
        _ => user_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::token::create_session_token;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::sync::Arc;

    use causerie_store::Database;

    fn setup() -> (SessionAuth, StoreHandle, SigningKey) {
        let key = SigningKey::generate(&mut OsRng);
        let verifier = Arc::new(TokenVerifier::new(key.verifying_key().to_bytes()));
        let store = StoreHandle::new(Database::open_in_memory().unwrap());
        (SessionAuth::new(verifier, store.clone()), store, key)
    }

    fn credential(key: &SigningKey, user: &str, email: &str, hours: i64) -> String {
        create_session_token(
            &UserId::new(user),
            email,
            Utc::now() + Duration::hours(hours),
            key,
        )
        .encode()
    }

    #[tokio::test]
    async fn first_auth_creates_the_user_record() {
        let (auth, store, key) = setup();

        let id = auth
            .authenticate(&credential(&key, "u1", "ada@example.com", 1))
            .await
            .unwrap();
        assert_eq!(id, UserId::new("u1"));

        let user = store
            .call(|db| db.get_user(&UserId::new("u1")))
            .await
            .unwrap();
        assert_eq!(user.display_name, "ada");
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.presence, Presence::Offline);
    }

    #[tokio::test]
    async fn later_auth_does_not_clobber_profile_edits() {
        let (auth, store, key) = setup();

        auth.authenticate(&credential(&key, "u1", "ada@example.com", 1))
            .await
            .unwrap();
        store
            .call(|db| db.set_display_name(&UserId::new("u1"), "Countess"))
            .await
            .unwrap();

        // A different token for the same principal (fresh verification).
        auth.authenticate(&credential(&key, "u1", "ada@example.com", 2))
            .await
            .unwrap();

        let user = store
            .call(|db| db.get_user(&UserId::new("u1")))
            .await
            .unwrap();
        assert_eq!(user.display_name, "Countess");
    }

    #[tokio::test]
    async fn repeated_credential_is_served_from_cache() {
        let (auth, _store, key) = setup();
        let cred = credential(&key, "u1", "ada@example.com", 1);

        let first = auth.verifier.verify(&cred).await.unwrap();
        assert!(first.fresh);
        let second = auth.verifier.verify(&cred).await.unwrap();
        assert!(!second.fresh);

        auth.verifier.purge_expired().await;
        // Not expired, so still cached.
        assert!(!auth.verifier.verify(&cred).await.unwrap().fresh);
    }

    #[tokio::test]
    async fn bad_credentials_are_unauthenticated() {
        let (auth, _store, key) = setup();
        let other = SigningKey::generate(&mut OsRng);

        // Wrong signing key.
        assert!(matches!(
            auth.authenticate(&credential(&other, "u1", "a@b.c", 1)).await,
            Err(ServerError::Unauthenticated(_))
        ));
        // Expired.
        assert!(matches!(
            auth.authenticate(&credential(&key, "u1", "a@b.c", -1)).await,
            Err(ServerError::Unauthenticated(_))
        ));
        // Garbage.
        assert!(matches!(
            auth.authenticate("complete garbage").await,
            Err(ServerError::Unauthenticated(_))
        ));
    }

    #[test]
    fn display_name_falls_back_to_the_principal_id() {
        assert_eq!(
            default_display_name("ada@example.com", &UserId::new("u1")),
            "ada"
        );
        assert_eq!(default_display_name("", &UserId::new("u1")), "u1");
        assert_eq!(default_display_name("@weird", &UserId::new("u1")), "u1");
    }
}
