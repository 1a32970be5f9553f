//! Bearer token issuance and validation.

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default signing secret when none is configured.
pub const DEFAULT_JWT_SECRET: &str = "default_secret";

/// Default token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("failed to issue token: {0}")]
    Issue(String),
}

/// The authenticated subject carried by a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: u64,
    pub username: String,
}

/// Issues and validates bearer tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn issue(&self, identity: &Identity) -> Result<String, AuthError>;

    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret shared by the gateway and the users worker.
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: u64,
    username: String,
    exp: u64,
}

/// HS256 JWT authenticator.
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, config.token_ttl_secs)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            user_id: identity.user_id,
            username: identity.username.clone(),
            exp: now + self.ttl_secs,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }

    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        debug!(user_id = data.claims.user_id, "Token validated");
        Ok(Identity {
            user_id: data.claims.user_id,
            username: data.claims.username,
        })
    }
}
