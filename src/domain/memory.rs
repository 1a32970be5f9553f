//! In-memory stores for standalone mode and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DomainError, Message, MessageStore, Result, StoredUser, User, UserStore};

#[derive(Default)]
struct Users {
    by_id: BTreeMap<u64, StoredUser>,
    last_id: u64,
}

/// User store backed by a `BTreeMap`. Ids start at 1.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<Users>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user with a fixed id, replacing any user with that id.
    pub async fn insert(&self, id: u64, username: &str, password_hash: &str) -> User {
        let mut users = self.users.write().await;
        let user = User {
            id,
            username: username.to_string(),
        };
        users.by_id.insert(
            id,
            StoredUser {
                user: user.clone(),
                password_hash: password_hash.to_string(),
            },
        );
        users.last_id = users.last_id.max(id);
        user
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn create(&self, username: &str, password_hash: &str) -> Result<User> {
        let mut users = self.users.write().await;
        if users
            .by_id
            .values()
            .any(|stored| stored.user.username == username)
        {
            return Err(DomainError::Conflict("username already taken".to_string()));
        }

        users.last_id += 1;
        let user = User {
            id: users.last_id,
            username: username.to_string(),
        };
        users.by_id.insert(
            user.id,
            StoredUser {
                user: user.clone(),
                password_hash: password_hash.to_string(),
            },
        );
        Ok(user)
    }

    async fn lookup(&self, id: u64) -> Result<User> {
        self.users
            .read()
            .await
            .by_id
            .get(&id)
            .map(|stored| stored.user.clone())
            .ok_or_else(|| DomainError::NotFound(format!("user {}", id)))
    }

    async fn find_by_username(&self, username: &str) -> Result<StoredUser> {
        self.users
            .read()
            .await
            .by_id
            .values()
            .find(|stored| stored.user.username == username)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("user {}", username)))
    }

    async fn list(&self) -> Result<Vec<User>> {
        Ok(self
            .users
            .read()
            .await
            .by_id
            .values()
            .map(|stored| stored.user.clone())
            .collect())
    }
}

/// Message store backed by a `Vec` in insertion (id) order.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, sender_id: u64, receiver_id: u64, content: &str) -> Result<Message> {
        let mut messages = self.messages.write().await;
        let message = Message {
            id: messages.len() as u64 + 1,
            sender_id,
            receiver_id,
            content: content.to_string(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn between(&self, a: u64, b: u64) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| {
                (m.sender_id == a && m.receiver_id == b) || (m.sender_id == b && m.receiver_id == a)
            })
            .cloned()
            .collect())
    }
}
