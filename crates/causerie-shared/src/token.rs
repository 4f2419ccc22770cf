//! Session tokens issued by the external identity provider.
//!
//! The provider authenticates the user's actual credentials (passwords,
//! OAuth, ...) out of process and signs a short-lived token binding the
//! principal id and email.  The backend only ever verifies the Ed25519
//! signature against the provider's configured public key -- no secret
//! material lives in this process.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

// Token signed by the identity provider, presented by the client on every
// connection and request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub user_id: UserId,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl SessionToken {
    /// Render the token as the opaque credential string carried in the
    /// `Authorization` header / WebSocket query parameter.
    pub fn encode(&self) -> String {
        use base64::Engine as _;
        let json = serde_json::to_vec(self).expect("session token serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    /// Parse a credential string back into a token.  Does not verify.
    pub fn decode(credential: &str) -> Result<Self, TokenError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(credential.trim())
            .map_err(|e| TokenError::Malformed(format!("base64: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(format!("json: {e}")))
    }

    /// Verify the token against the identity provider's public key.
    ///
    /// Checks, in order: principal id shape, expiry, signature.
    pub fn verify_with_key(&self, provider_pubkey: &[u8; 32]) -> Result<(), TokenError> {
        if !self.user_id.is_well_formed() {
            return Err(TokenError::Malformed(format!(
                "bad principal id: {:?}",
                self.user_id.as_str()
            )));
        }

        if Utc::now() > self.expires_at {
            return Err(TokenError::Expired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(provider_pubkey).map_err(|_| TokenError::InvalidSignature)?;

        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TokenError::InvalidSignature)?;

        verifying_key
            .verify(&signing_payload(&self.user_id, &self.email, self.expires_at), &signature)
            .map_err(|_| TokenError::InvalidSignature)
    }
}

// payload = user_id \n email \n expires_at (rfc3339)
fn signing_payload(user_id: &UserId, email: &str, expires_at: DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.as_str().as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(email.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(expires_at.to_rfc3339().as_bytes());
    payload
}

/// Issue a signed token.  Used by the identity provider and by tests.
pub fn create_session_token(
    user_id: &UserId,
    email: &str,
    expires_at: DateTime<Utc>,
    provider_signing_key: &ed25519_dalek::SigningKey,
) -> SessionToken {
    use ed25519_dalek::Signer;

    let signature = provider_signing_key.sign(&signing_payload(user_id, email, expires_at));

    SessionToken {
        user_id: user_id.clone(),
        email: email.to_string(),
        expires_at,
        signature: signature.to_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn provider_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn valid_token_round_trips_and_verifies() {
        let key = provider_key();
        let pubkey = key.verifying_key().to_bytes();

        let token = create_session_token(
            &UserId::new("u1"),
            "u1@example.com",
            Utc::now() + Duration::hours(1),
            &key,
        );

        let decoded = SessionToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded.user_id, token.user_id);
        assert!(decoded.verify_with_key(&pubkey).is_ok());
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = provider_key();
        let pubkey = key.verifying_key().to_bytes();

        let token = create_session_token(
            &UserId::new("u1"),
            "u1@example.com",
            Utc::now() - Duration::minutes(5),
            &key,
        );

        assert_eq!(token.verify_with_key(&pubkey), Err(TokenError::Expired));
    }

    #[test]
    fn wrong_provider_key_is_rejected() {
        let key = provider_key();
        let other = provider_key();

        let token = create_session_token(
            &UserId::new("u1"),
            "u1@example.com",
            Utc::now() + Duration::hours(1),
            &key,
        );

        assert_eq!(
            token.verify_with_key(&other.verifying_key().to_bytes()),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let key = provider_key();
        let pubkey = key.verifying_key().to_bytes();

        let mut token = create_session_token(
            &UserId::new("u1"),
            "u1@example.com",
            Utc::now() + Duration::hours(1),
            &key,
        );
        token.email = "attacker@example.com".into();

        assert_eq!(token.verify_with_key(&pubkey), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn reserved_separator_in_principal_id_is_rejected() {
        let key = provider_key();
        let pubkey = key.verifying_key().to_bytes();

        let token = create_session_token(
            &UserId::new("u1_u2"),
            "u1@example.com",
            Utc::now() + Duration::hours(1),
            &key,
        );

        assert!(matches!(
            token.verify_with_key(&pubkey),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_credential_fails_to_decode() {
        assert!(matches!(
            SessionToken::decode("not-base64!!!"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            SessionToken::decode("aGVsbG8="), // "hello", not a token
            Err(TokenError::Malformed(_))
        ));
    }
}
