//! Identity resolution for incoming connections.
//!
//! Clients present a bearer token when they open the stream. The token is
//! an HS256 JSON Web Token whose claims carry the user id, an optional
//! display name, a guest flag and an expiry. Guests additionally need a
//! live `guest:<id>` record in the store.

use crate::store::{SharedStore, StoreError};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// The authenticated principal bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Positive for registered users, negative for guests.
    pub id: i64,
    pub display_name: String,
    pub is_guest: bool,
}

/// Reasons a connection is refused before upgrade.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported token algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("invalid identity claims: {0}")]
    InvalidClaims(String),

    #[error("guest session {0} not found")]
    UnknownGuest(i64),

    #[error("identity lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Turns a bearer token into an [`Identity`].
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    user_id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_guest: bool,
    exp: u64,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct TokenVerifier {
    secret: Vec<u8>,
    store: SharedStore,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>, store: SharedStore) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            store,
        }
    }

    /// Checks the signature and expiry and returns the claims.
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments".to_string()));
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signed = &token[..header_b64.len() + 1 + claims_b64.len()];
        let provided = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| AuthError::Malformed(format!("signature: {e}")))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| AuthError::Malformed("unusable secret".to_string()))?;
        mac.update(signed.as_bytes());
        // verify_slice compares in constant time.
        mac.verify_slice(&provided)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_segment(claims_b64)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if claims.exp <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| AuthError::Malformed(e.to_string()))
}

#[async_trait]
impl IdentityResolver for TokenVerifier {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims = self.verify(token)?;

        match (claims.is_guest, claims.user_id) {
            (_, 0) => return Err(AuthError::InvalidClaims("user id is zero".to_string())),
            (true, id) if id > 0 => {
                return Err(AuthError::InvalidClaims(
                    "guest ids must be negative".to_string(),
                ))
            }
            (false, id) if id < 0 => {
                return Err(AuthError::InvalidClaims(
                    "negative id without guest flag".to_string(),
                ))
            }
            _ => {}
        }

        if claims.is_guest && !self.store.exists(&format!("guest:{}", claims.user_id)).await? {
            return Err(AuthError::UnknownGuest(claims.user_id));
        }

        let display_name = claims
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| {
                if claims.is_guest {
                    format!("guest{}", claims.user_id.unsigned_abs())
                } else {
                    format!("user{}", claims.user_id)
                }
            });

        Ok(Identity {
            id: claims.user_id,
            display_name,
            is_guest: claims.is_guest,
        })
    }
}

/// Builds a signed token. Used by tests and local tooling.
pub fn sign_token(secret: &[u8], claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{header}.{payload}");
    let signature = match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(signing_input.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC accepts keys of any length.
        Err(_) => Vec::new(),
    };
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
}
