//! Password hashing for registration and login.

use sha2::{Digest, Sha256};

use super::{DomainError, Result};

pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String>;

    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Salted SHA-256: `hex(salt)$hex(sha256(salt || password))` with a random
/// 16-byte salt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256PasswordHasher;

impl Sha256PasswordHasher {
    fn digest(salt: &[u8], password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl PasswordHasher for Sha256PasswordHasher {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = uuid::Uuid::new_v4().into_bytes();
        Ok(format!(
            "{}${}",
            hex::encode(salt),
            Self::digest(&salt, password)
        ))
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        let Some((salt_hex, digest_hex)) = hash.split_once('$') else {
            return false;
        };
        match hex::decode(salt_hex) {
            Ok(salt) => Self::digest(&salt, password) == digest_hex,
            Err(_) => false,
        }
    }
}

/// Registration input rules shared by the HTTP front-end and the users worker.
pub fn validate_credentials(username: &str, password: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(DomainError::Invalid("username must not be empty".to_string()));
    }
    if password.chars().count() < 6 {
        return Err(DomainError::Invalid(
            "password must be at least 6 characters".to_string(),
        ));
    }
    Ok(())
}
