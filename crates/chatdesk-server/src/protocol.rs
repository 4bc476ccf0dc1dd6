use serde::{Deserialize, Serialize};

use chatdesk_core::chat::{ChatMessage, SessionSummary};
use chatdesk_core::ChatError;

/// Error code sent when an inbound frame is not a known event.
pub const PARSE_ERROR: &str = "parse_error";

/// Events a WebSocket client may send: `{"event": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinSession(JoinSession),
    SendMessage(SendMessage),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Events pushed to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage(NewMessagePayload),
    SessionUpdated(SessionSummary),
    Error(ErrorPayload),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub session_id: String,
    pub message: ChatMessage,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ServerEvent {
    pub fn new_message(session_id: impl Into<String>, message: ChatMessage) -> Self {
        Self::NewMessage(NewMessagePayload {
            session_id: session_id.into(),
            message,
        })
    }

    pub fn error(err: &ChatError, session_id: Option<String>) -> Self {
        Self::Error(ErrorPayload {
            code: err.error_kind().to_string(),
            message: err.to_string(),
            session_id,
        })
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::Error(ErrorPayload {
            code: PARSE_ERROR.to_string(),
            message: format!("unrecognized event: {detail}"),
            session_id: None,
        })
    }

    /// Serialize for the wire. Failures are logged and yield `None`.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize server event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdesk_core::chat::{MessageKind, SessionStatus};
    use chatdesk_core::ids::{MessageId, SessionId};
    use serde_json::json;

    #[test]
    fn parse_join_session() {
        let raw = r#"{"event":"joinSession","data":{"sessionId":"chat_1","credential":"tok"}}"#;
        match serde_json::from_str::<ClientEvent>(raw).unwrap() {
            ClientEvent::JoinSession(join) => {
                assert_eq!(join.session_id.as_deref(), Some("chat_1"));
                assert_eq!(join.credential.as_deref(), Some("tok"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_send_message_with_missing_fields() {
        let raw = r#"{"event":"sendMessage","data":{}}"#;
        match serde_json::from_str::<ClientEvent>(raw).unwrap() {
            ClientEvent::SendMessage(send) => {
                assert!(send.session_id.is_none());
                assert!(send.content.is_none());
                assert!(send.credential.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"typing","data":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>("not json").is_err());
    }

    #[test]
    fn new_message_wire_shape() {
        let message = ChatMessage {
            id: MessageId::from_raw("msg_1"),
            kind: MessageKind::Agent,
            author: "Sam".into(),
            content: "hello".into(),
            timestamp: chrono::Utc::now(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::new_message("chat_1", message).to_json().unwrap())
                .unwrap();

        assert_eq!(json["event"], "newMessage");
        assert_eq!(json["data"]["sessionId"], "chat_1");
        assert_eq!(json["data"]["message"]["author"], "Sam");
        assert_eq!(json["data"]["message"]["content"], "hello");
    }

    #[test]
    fn session_updated_wire_shape() {
        let summary = SessionSummary {
            session_id: SessionId::from_raw("chat_1"),
            status: SessionStatus::Active,
            participant_name: "Ada".into(),
            last_activity_at: chrono::Utc::now(),
            preview: Some("hi".into()),
            message_count: 2,
            survey_completed: false,
        };
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::SessionUpdated(summary).to_json().unwrap()).unwrap();

        assert_eq!(json["event"], "sessionUpdated");
        assert_eq!(json["data"]["sessionId"], "chat_1");
        assert_eq!(json["data"]["status"], "active");
        assert_eq!(json["data"]["messageCount"], 2);
    }

    #[test]
    fn error_event_carries_kind_and_session() {
        let err = ChatError::InvalidInput("content is empty".into());
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::error(&err, Some("chat_9".into())).to_json().unwrap())
                .unwrap();
        assert_eq!(
            json,
            json!({
                "event": "error",
                "data": {
                    "code": "invalid_input",
                    "message": "invalid input: content is empty",
                    "sessionId": "chat_9",
                }
            })
        );
    }

    #[test]
    fn parse_error_omits_session() {
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::parse_error("bad").to_json().unwrap()).unwrap();
        assert_eq!(json["data"]["code"], "parse_error");
        assert!(json["data"].get("sessionId").is_none());
    }
}
