//! Bearer token verification for tunnel connections.
//!
//! Tokens are HS256 JWTs issued by the panel's REST API. A token can be
//! revoked before it expires (logout); revocations are keyed by the SHA-256
//! hex digest of the raw token and kept in the store until the token would
//! have expired anyway.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::store::{Store, UserId};

/// Who is behind a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

/// Token claims as issued by the panel API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    pub exp: i64,
    pub iss: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Errors from token verification. Display strings are shown to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("No token provided")]
    Missing,

    #[error("Token has been revoked")]
    Revoked,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token")]
    Invalid,

    #[error("Authentication failed")]
    Backend(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check signature, issuer, expiry and revocation.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// SHA-256 hex digest used as the revocation key.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
    store: Arc<dyn Store>,
}

impl JwtAuthenticator {
    pub fn new(config: &AuthConfig, store: Arc<dyn Store>) -> Result<Self> {
        anyhow::ensure!(
            !config.jwt_secret.is_empty(),
            "auth.jwt_secret is empty (set it in the config or via {})",
            crate::config::JWT_SECRET_ENV
        );
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.leeway = 0;
        Ok(Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            store,
        })
    }

    fn decode_claims(&self, token: &str, validation: &Validation) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => {
                    debug!(error = %e, "token verification failed");
                    AuthError::Invalid
                }
            })
    }

    /// Revoke a token until its own expiry. The token must carry a valid
    /// signature; an already-expired token is accepted and becomes a no-op
    /// entry that the next cleanup removes.
    pub async fn revoke(&self, token: &str) -> Result<DateTime<Utc>, AuthError> {
        let mut lenient = self.validation.clone();
        lenient.validate_exp = false;
        let claims = self.decode_claims(token, &lenient)?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::Invalid)?;
        self.store
            .revoke_token(token_hash(token), expires_at)
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        info!(user_id = claims.id, %expires_at, "token revoked");
        Ok(expires_at)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let revoked = self
            .store
            .is_token_revoked(&token_hash(token), Utc::now())
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        if revoked {
            return Err(AuthError::Revoked);
        }

        let claims = self.decode_claims(token, &self.validation)?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::Invalid)?;
        Ok(Identity {
            user_id: claims.id,
            role: claims.role,
            expires_at,
        })
    }
}
