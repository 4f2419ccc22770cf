use thiserror::Error;

/// Errors produced while decoding or verifying a session token.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    /// The credential string could not be decoded into a token.
    #[error("Malformed credential: {0}")]
    Malformed(String),

    /// The signature does not match the identity provider's key.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// The token's expiry lies in the past.
    #[error("Token expired")]
    Expired,
}
