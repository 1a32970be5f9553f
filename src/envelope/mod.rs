//! Wire envelope codec.
//!
//! Every socket frame and every broker body is a JSON object of the form
//! `{"type": "<variant>", ...}`. Decoding is two-phase: the `type` field is
//! resolved first ([`peek_type`]), then the payload is decoded into the
//! variant's concrete shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

mod payload;
mod routed;

pub use payload::{
    AuthFrame, Credentials, ErrorFrame, GetMessagesRequest, LoginData, MessageData, MessagesData,
    Reply, SendMessageRequest, UserData, UsersData,
};
pub use routed::RoutedRequest;

/// Errors produced while decoding wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing or non-string \"type\" field")]
    MissingType,

    #[error("invalid {message_type} payload: {source}")]
    Payload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not a request")]
    NotARequest(String),
}

/// Request types a worker pool can fulfil.
///
/// The short name doubles as the routing key on the request exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Registration,
    Login,
    GetUsers,
    GetSelf,
    GetMessages,
    SendMessage,
}

impl RequestKind {
    pub const ALL: [RequestKind; 6] = [
        RequestKind::Registration,
        RequestKind::Login,
        RequestKind::GetUsers,
        RequestKind::GetSelf,
        RequestKind::GetMessages,
        RequestKind::SendMessage,
    ];

    /// Wire name and routing key.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Registration => "registration",
            RequestKind::Login => "login",
            RequestKind::GetUsers => "get_users",
            RequestKind::GetSelf => "get_self",
            RequestKind::GetMessages => "get_messages",
            RequestKind::SendMessage => "send_message",
        }
    }

    /// Accepted alias for the request name.
    pub fn request_alias(&self) -> &'static str {
        match self {
            RequestKind::Registration => "registration_request",
            RequestKind::Login => "login_request",
            RequestKind::GetUsers => "get_users_request",
            RequestKind::GetSelf => "get_self_request",
            RequestKind::GetMessages => "get_messages_request",
            RequestKind::SendMessage => "send_message_request",
        }
    }

    /// Type name of the paired response.
    pub fn response_type(&self) -> &'static str {
        match self {
            RequestKind::Registration => "registration_response",
            RequestKind::Login => "login_response",
            RequestKind::GetUsers => "get_users_response",
            RequestKind::GetSelf => "get_self_response",
            RequestKind::GetMessages => "get_messages_response",
            RequestKind::SendMessage => "send_message_response",
        }
    }

    /// Authorization gate: whether an unauthenticated session may send this.
    pub fn requires_authentication(&self) -> bool {
        match self {
            RequestKind::Registration | RequestKind::Login => false,
            RequestKind::GetUsers
            | RequestKind::GetSelf
            | RequestKind::GetMessages
            | RequestKind::SendMessage => true,
        }
    }

    /// Whether the response goes to every open session instead of only the requester.
    pub fn broadcasts_response(&self) -> bool {
        matches!(self, RequestKind::SendMessage)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved value of an envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Auth,
    Error,
    Request(RequestKind),
    Response(RequestKind),
}

impl MessageType {
    /// Resolve a wire type name. `None` for names outside the enumerated set.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "auth" => return Some(MessageType::Auth),
            "error" => return Some(MessageType::Error),
            _ => {}
        }
        RequestKind::ALL.iter().find_map(|kind| {
            if name == kind.as_str() || name == kind.request_alias() {
                Some(MessageType::Request(*kind))
            } else if name == kind.response_type() {
                Some(MessageType::Response(*kind))
            } else {
                None
            }
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Auth => "auth",
            MessageType::Error => "error",
            MessageType::Request(kind) => kind.as_str(),
            MessageType::Response(kind) => kind.response_type(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded wire message.
///
/// Adding a variant means extending [`MessageType`] and [`Envelope::message_type`];
/// the exhaustive matches in the gateway and the workers then point at every
/// other place that needs a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "auth")]
    Auth(AuthFrame),
    #[serde(rename = "error")]
    Error(ErrorFrame),

    #[serde(rename = "registration", alias = "registration_request")]
    RegistrationRequest(Credentials),
    #[serde(rename = "registration_response")]
    RegistrationResponse(Reply<UserData>),

    #[serde(rename = "login", alias = "login_request")]
    LoginRequest(Credentials),
    #[serde(rename = "login_response")]
    LoginResponse(Reply<LoginData>),

    #[serde(rename = "get_users", alias = "get_users_request")]
    GetUsersRequest,
    #[serde(rename = "get_users_response")]
    GetUsersResponse(Reply<UsersData>),

    #[serde(rename = "get_self", alias = "get_self_request")]
    GetSelfRequest,
    #[serde(rename = "get_self_response")]
    GetSelfResponse(Reply<UserData>),

    #[serde(rename = "get_messages", alias = "get_messages_request")]
    GetMessagesRequest(GetMessagesRequest),
    #[serde(rename = "get_messages_response")]
    GetMessagesResponse(Reply<MessagesData>),

    #[serde(rename = "send_message", alias = "send_message_request")]
    SendMessageRequest(SendMessageRequest),
    #[serde(rename = "send_message_response")]
    SendMessageResponse(Reply<MessageData>),
}

impl Envelope {
    /// `{"type":"error","error":<message>}`
    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error(ErrorFrame {
            error: message.into(),
        })
    }

    /// `{"type":"auth","success":true}`
    pub fn auth_success() -> Self {
        Envelope::Auth(AuthFrame {
            token: None,
            success: Some(true),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Auth(_) => MessageType::Auth,
            Envelope::Error(_) => MessageType::Error,
            Envelope::RegistrationRequest(_) => MessageType::Request(RequestKind::Registration),
            Envelope::RegistrationResponse(_) => MessageType::Response(RequestKind::Registration),
            Envelope::LoginRequest(_) => MessageType::Request(RequestKind::Login),
            Envelope::LoginResponse(_) => MessageType::Response(RequestKind::Login),
            Envelope::GetUsersRequest => MessageType::Request(RequestKind::GetUsers),
            Envelope::GetUsersResponse(_) => MessageType::Response(RequestKind::GetUsers),
            Envelope::GetSelfRequest => MessageType::Request(RequestKind::GetSelf),
            Envelope::GetSelfResponse(_) => MessageType::Response(RequestKind::GetSelf),
            Envelope::GetMessagesRequest(_) => MessageType::Request(RequestKind::GetMessages),
            Envelope::GetMessagesResponse(_) => MessageType::Response(RequestKind::GetMessages),
            Envelope::SendMessageRequest(_) => MessageType::Request(RequestKind::SendMessage),
            Envelope::SendMessageResponse(_) => MessageType::Response(RequestKind::SendMessage),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.message_type().as_str()
    }

    /// The request kind, for request variants.
    pub fn request_kind(&self) -> Option<RequestKind> {
        match self.message_type() {
            MessageType::Request(kind) => Some(kind),
            _ => None,
        }
    }

    /// `error` envelopes and responses that carry an `error` instead of `data`.
    pub fn is_failure(&self) -> bool {
        match self {
            Envelope::Error(_) => true,
            Envelope::RegistrationResponse(reply) => !reply.is_ok(),
            Envelope::LoginResponse(reply) => !reply.is_ok(),
            Envelope::GetUsersResponse(reply) => !reply.is_ok(),
            Envelope::GetSelfResponse(reply) => !reply.is_ok(),
            Envelope::GetMessagesResponse(reply) => !reply.is_ok(),
            Envelope::SendMessageResponse(reply) => !reply.is_ok(),
            Envelope::Auth(_)
            | Envelope::RegistrationRequest(_)
            | Envelope::LoginRequest(_)
            | Envelope::GetUsersRequest
            | Envelope::GetSelfRequest
            | Envelope::GetMessagesRequest(_)
            | Envelope::SendMessageRequest(_) => false,
        }
    }

    /// The paired response for `kind` carrying `error`.
    pub fn failed_response(kind: RequestKind, error: impl Into<String>) -> Self {
        let error = error.into();
        match kind {
            RequestKind::Registration => Envelope::RegistrationResponse(Reply::failed(error)),
            RequestKind::Login => Envelope::LoginResponse(Reply::failed(error)),
            RequestKind::GetUsers => Envelope::GetUsersResponse(Reply::failed(error)),
            RequestKind::GetSelf => Envelope::GetSelfResponse(Reply::failed(error)),
            RequestKind::GetMessages => Envelope::GetMessagesResponse(Reply::failed(error)),
            RequestKind::SendMessage => Envelope::SendMessageResponse(Reply::failed(error)),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            // Unreachable for the payload types above: all keys are strings.
            error!(message_type = %self.type_name(), error = %e, "Failed to encode envelope");
            br#"{"type":"error","error":"internal encoding failure"}"#.to_vec()
        })
    }
}

/// Phase one: extract only the `type` field.
pub fn peek_type(bytes: &[u8]) -> Result<String, DecodeError> {
    #[derive(Deserialize)]
    struct TypeProbe {
        #[serde(rename = "type", default)]
        kind: Option<serde_json::Value>,
    }

    let probe: TypeProbe = serde_json::from_slice(bytes)?;
    match probe.kind {
        Some(serde_json::Value::String(kind)) => Ok(kind),
        _ => Err(DecodeError::MissingType),
    }
}

/// Decode wire bytes into an envelope.
///
/// A `type` outside the enumerated set is not an error: it yields an
/// `error` envelope naming the unknown type.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let tag = peek_type(bytes)?;
    match MessageType::parse(&tag) {
        Some(message_type) => decode_as(message_type, bytes),
        None => Ok(Envelope::error(format!("Unknown message type: {}", tag))),
    }
}

/// Phase two: decode the payload of an already-resolved type.
pub fn decode_as(message_type: MessageType, bytes: &[u8]) -> Result<Envelope, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError::Payload {
        message_type: message_type.to_string(),
        source,
    })
}
