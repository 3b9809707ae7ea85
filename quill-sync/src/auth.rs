//! JWT validation for incoming connections.
//!
//! Tokens are HS256, carried in the `token` query parameter of the WebSocket
//! request. Validation happens before the protocol upgrade; a bad or missing
//! token is rejected with a plain HTTP 401 and no handshake takes place.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Minimum HMAC secret length in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Authentication errors.
#[derive(Debug)]
pub enum AuthError {
    /// Secret shorter than the required minimum.
    WeakSecret(usize),
    /// Token failed signature or claims validation.
    InvalidToken(String),
    /// Token could not be produced.
    SigningFailed(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WeakSecret(len) => {
                write!(f, "auth secret too short: {len} bytes, need {MIN_SECRET_LEN}")
            }
            Self::InvalidToken(e) => write!(f, "invalid token: {e}"),
            Self::SigningFailed(e) => write!(f, "token signing failed: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Claims carried in connection tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user identifier)
    pub sub: String,
    /// Issued-at, seconds since epoch
    pub iat: u64,
    /// Expiry, seconds since epoch
    pub exp: u64,
}

/// Verifies (and, for tests and tooling, issues) connection tokens.
pub struct TokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier over an HS256 shared secret.
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::WeakSecret(secret.len()));
        }
        let mut validation = Validation::default();
        validation.validate_exp = true;
        validation.leeway = 30;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Validate a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Issue a token for `sub` valid for `ttl`.
    pub fn issue(&self, sub: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            sub: sub.to_string(),
            iat: now,
            exp: now + ttl.as_secs(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::SigningFailed(e.to_string()))
    }
}
