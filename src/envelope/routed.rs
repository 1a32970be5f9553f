//! Broker body for requests travelling from a gateway to a worker pool.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use super::{DecodeError, Envelope, MessageType, RequestKind};

/// A client request tagged with the identifier of the session that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedRequest {
    /// Requester's identifier; the routing key for the response.
    pub identifier: String,
    /// Short request name, also the routing key on the request exchange.
    #[serde(rename = "type")]
    pub request_type: String,
    /// Authenticated user, absent for anonymous sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<u64>,
    /// Request fields without the `type` tag.
    #[serde(default)]
    pub payload: Value,
}

impl RoutedRequest {
    /// Wrap a request envelope. Fails for envelopes that are not requests.
    pub fn new(
        identifier: impl Into<String>,
        subject_id: Option<u64>,
        request: &Envelope,
    ) -> Result<Self, DecodeError> {
        let kind = request
            .request_kind()
            .ok_or_else(|| DecodeError::NotARequest(request.type_name().to_string()))?;

        let mut payload = serde_json::to_value(request)?;
        if let Value::Object(fields) = &mut payload {
            fields.remove("type");
        }

        Ok(Self {
            identifier: identifier.into(),
            request_type: kind.as_str().to_string(),
            subject_id,
            payload,
        })
    }

    pub fn kind(&self) -> Option<RequestKind> {
        match MessageType::parse(&self.request_type) {
            Some(MessageType::Request(kind)) => Some(kind),
            _ => None,
        }
    }

    /// Rebuild the typed request envelope from `type` and `payload`.
    pub fn envelope(&self) -> Result<Envelope, DecodeError> {
        let kind = self
            .kind()
            .ok_or_else(|| DecodeError::NotARequest(self.request_type.clone()))?;

        let mut fields = match &self.payload {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(DecodeError::Payload {
                    message_type: kind.to_string(),
                    source: serde::de::Error::custom(format!(
                        "payload must be an object, got {}",
                        other
                    )),
                })
            }
        };
        fields.insert("type".to_string(), Value::String(kind.as_str().to_string()));

        serde_json::from_value(Value::Object(fields)).map_err(|source| DecodeError::Payload {
            message_type: kind.to_string(),
            source,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            error!(identifier = %self.identifier, error = %e, "Failed to encode routed request");
            Vec::new()
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Credentials, SendMessageRequest};

    #[test]
    fn test_new_strips_type_from_payload() {
        let request = Envelope::SendMessageRequest(SendMessageRequest {
            receiver_id: 2,
            content: "hi".to_string(),
        });
        let routed = RoutedRequest::new("abc", Some(1), &request).unwrap();

        assert_eq!(routed.request_type, "send_message");
        assert_eq!(
            routed.payload,
            serde_json::json!({"receiver_id": 2, "content": "hi"})
        );
        assert_eq!(routed.envelope().unwrap(), request);
    }

    #[test]
    fn test_unit_request_has_empty_payload() {
        let routed = RoutedRequest::new("abc", Some(7), &Envelope::GetSelfRequest).unwrap();
        assert_eq!(routed.payload, serde_json::json!({}));
        assert_eq!(routed.envelope().unwrap(), Envelope::GetSelfRequest);
    }

    #[test]
    fn test_anonymous_omits_subject() {
        let request = Envelope::LoginRequest(Credentials {
            username: "alice".to_string(),
            password: "secret1".to_string(),
        });
        let routed = RoutedRequest::new("abc", None, &request).unwrap();
        let json: Value = serde_json::from_slice(&routed.encode()).unwrap();

        assert!(json.get("subject_id").is_none());
        assert_eq!(json["type"], "login");
        assert_eq!(json["identifier"], "abc");
    }

    #[test]
    fn test_non_request_is_rejected() {
        let result = RoutedRequest::new("abc", None, &Envelope::error("x"));
        assert!(matches!(result, Err(DecodeError::NotARequest(t)) if t == "error"));
    }

    #[test]
    fn test_null_payload_decodes_for_unit_request() {
        let routed =
            RoutedRequest::decode(br#"{"identifier":"abc","type":"get_users"}"#).unwrap();
        assert_eq!(routed.envelope().unwrap(), Envelope::GetUsersRequest);
    }

    #[test]
    fn test_bad_payload_shape() {
        let routed = RoutedRequest::decode(
            br#"{"identifier":"abc","type":"get_messages","payload":{"receiver_id":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(
            routed.envelope(),
            Err(DecodeError::Payload { .. })
        ));
    }
}
