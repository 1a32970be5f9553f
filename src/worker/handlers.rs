//! Request handlers for the users and messages worker pools.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{RequestContext, RequestHandler};
use crate::domain::{
    self, validate_credentials, Authenticator, DomainError, Identity, MessageStore,
    PasswordHasher, UserStore,
};
use crate::envelope::{
    Envelope, LoginData, MessageData, MessagesData, RequestKind, UserData, UsersData,
};

fn unexpected(kind: RequestKind, request: &Envelope) -> Envelope {
    Envelope::failed_response(
        kind,
        format!("{} worker cannot handle {}", kind, request.type_name()),
    )
}

/// Handlers served by the users worker: registration, login, get_users, get_self.
pub fn user_handlers(
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    authenticator: Arc<dyn Authenticator>,
) -> Vec<Arc<dyn RequestHandler>> {
    vec![
        Arc::new(RegistrationHandler::new(Arc::clone(&users), Arc::clone(&hasher))),
        Arc::new(LoginHandler::new(Arc::clone(&users), hasher, authenticator)),
        Arc::new(GetUsersHandler::new(Arc::clone(&users))),
        Arc::new(GetSelfHandler::new(users)),
    ]
}

/// Handlers served by the messages worker: get_messages, send_message.
pub fn message_handlers(messages: Arc<dyn MessageStore>) -> Vec<Arc<dyn RequestHandler>> {
    vec![
        Arc::new(GetMessagesHandler::new(Arc::clone(&messages))),
        Arc::new(SendMessageHandler::new(messages)),
    ]
}

pub struct RegistrationHandler {
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
}

impl RegistrationHandler {
    pub fn new(users: Arc<dyn UserStore>, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self { users, hasher }
    }
}

#[async_trait]
impl RequestHandler for RegistrationHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Registration
    }

    async fn handle(&self, _ctx: &RequestContext, request: Envelope) -> Envelope {
        let credentials = match request {
            Envelope::RegistrationRequest(credentials) => credentials,
            other => return unexpected(self.kind(), &other),
        };

        let result: domain::Result<UserData> = async {
            validate_credentials(&credentials.username, &credentials.password)?;
            let hash = self.hasher.hash(&credentials.password)?;
            let user = self.users.create(&credentials.username, &hash).await?;
            info!(user_id = user.id, username = %user.username, "User registered");
            Ok(UserData { user })
        }
        .await;

        Envelope::RegistrationResponse(result.into())
    }
}

pub struct LoginHandler {
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    authenticator: Arc<dyn Authenticator>,
}

impl LoginHandler {
    pub fn new(
        users: Arc<dyn UserStore>,
        hasher: Arc<dyn PasswordHasher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            users,
            hasher,
            authenticator,
        }
    }
}

#[async_trait]
impl RequestHandler for LoginHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Login
    }

    async fn handle(&self, _ctx: &RequestContext, request: Envelope) -> Envelope {
        let credentials = match request {
            Envelope::LoginRequest(credentials) => credentials,
            other => return unexpected(self.kind(), &other),
        };

        let result: domain::Result<LoginData> = async {
            let rejected =
                || DomainError::Unauthorized("invalid username or password".to_string());

            let stored = self
                .users
                .find_by_username(&credentials.username)
                .await
                .map_err(|_| rejected())?;
            if !self
                .hasher
                .verify(&credentials.password, &stored.password_hash)
            {
                return Err(rejected());
            }

            let token = self
                .authenticator
                .issue(&Identity {
                    user_id: stored.user.id,
                    username: stored.user.username.clone(),
                })
                .await
                .map_err(|e| DomainError::Invalid(e.to_string()))?;

            debug!(user_id = stored.user.id, "Login succeeded");
            Ok(LoginData {
                token,
                user: stored.user,
            })
        }
        .await;

        Envelope::LoginResponse(result.into())
    }
}

pub struct GetUsersHandler {
    users: Arc<dyn UserStore>,
}

impl GetUsersHandler {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl RequestHandler for GetUsersHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::GetUsers
    }

    async fn handle(&self, _ctx: &RequestContext, request: Envelope) -> Envelope {
        if !matches!(request, Envelope::GetUsersRequest) {
            return unexpected(self.kind(), &request);
        }

        let result = self.users.list().await.map(|users| UsersData { users });
        Envelope::GetUsersResponse(result.into())
    }
}

pub struct GetSelfHandler {
    users: Arc<dyn UserStore>,
}

impl GetSelfHandler {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl RequestHandler for GetSelfHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::GetSelf
    }

    async fn handle(&self, ctx: &RequestContext, request: Envelope) -> Envelope {
        if !matches!(request, Envelope::GetSelfRequest) {
            return unexpected(self.kind(), &request);
        }

        let result: domain::Result<UserData> = async {
            let user = self.users.lookup(ctx.subject()?).await?;
            Ok(UserData { user })
        }
        .await;

        Envelope::GetSelfResponse(result.into())
    }
}

pub struct GetMessagesHandler {
    messages: Arc<dyn MessageStore>,
}

impl GetMessagesHandler {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl RequestHandler for GetMessagesHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::GetMessages
    }

    async fn handle(&self, ctx: &RequestContext, request: Envelope) -> Envelope {
        let query = match request {
            Envelope::GetMessagesRequest(query) => query,
            other => return unexpected(self.kind(), &other),
        };

        let result: domain::Result<MessagesData> = async {
            let messages = self
                .messages
                .between(ctx.subject()?, query.receiver_id)
                .await?;
            Ok(MessagesData { messages })
        }
        .await;

        Envelope::GetMessagesResponse(result.into())
    }
}

pub struct SendMessageHandler {
    messages: Arc<dyn MessageStore>,
}

impl SendMessageHandler {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl RequestHandler for SendMessageHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::SendMessage
    }

    async fn handle(&self, ctx: &RequestContext, request: Envelope) -> Envelope {
        let send = match request {
            Envelope::SendMessageRequest(send) => send,
            other => return unexpected(self.kind(), &other),
        };

        let result: domain::Result<MessageData> = async {
            let sender_id = ctx.subject()?;
            if send.receiver_id == 0 {
                return Err(DomainError::Invalid("receiver_id must be set".to_string()));
            }
            if send.content.trim().is_empty() {
                return Err(DomainError::Invalid(
                    "message content must not be empty".to_string(),
                ));
            }
            let message = self
                .messages
                .create(sender_id, send.receiver_id, &send.content)
                .await?;
            Ok(MessageData { message })
        }
        .await;

        Envelope::SendMessageResponse(result.into())
    }
}
