//! Domain collaborators the worker pools call into.
//!
//! This module contains:
//! - Entities: `User`, `StoredUser`, `Message`
//! - Storage traits: `UserStore`, `MessageStore`
//! - In-memory storage implementations
//! - Credentials: `Authenticator` (JWT) and `PasswordHasher` (salted SHA-256)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod auth;
pub mod memory;
pub mod password;

pub use auth::{AuthConfig, AuthError, Authenticator, Identity, JwtAuthenticator};
pub use memory::{InMemoryMessageStore, InMemoryUserStore};
pub use password::{validate_credentials, PasswordHasher, Sha256PasswordHasher};

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

/// Failures a request handler reports back in the `error` field of its response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Unauthorized(String),
}

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
}

/// A user together with its password hash. Never serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub content: String,
}

/// User lookup and creation keyed by numeric id.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create a user. `Conflict` when the username is taken.
    async fn create(&self, username: &str, password_hash: &str) -> Result<User>;

    async fn lookup(&self, id: u64) -> Result<User>;

    async fn find_by_username(&self, username: &str) -> Result<StoredUser>;

    /// All users, ordered by id.
    async fn list(&self) -> Result<Vec<User>>;
}

/// Direct message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, sender_id: u64, receiver_id: u64, content: &str) -> Result<Message>;

    /// Messages exchanged between `a` and `b` in either direction, ordered by id.
    async fn between(&self, a: u64, b: u64) -> Result<Vec<Message>>;
}
