//! Client/Server Wire Protocol
//!
//! This module defines the JSON messages exchanged over the persistent
//! connection between browser clients and the relay. Inbound and
//! outbound messages are separate enums: clients never send server
//! message kinds and vice versa, so a shared enum would only widen the
//! accepted surface.
//!
//! All messages are internally tagged with a `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Messages a browser client may send to the relay.
///
/// Parsing is strict: an unknown `type` or a missing required field is
/// a deserialization error, which the gateway reports back to the
/// offending connection without closing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind a self-declared username to this connection.
    Identify {
        /// Self-declared identity; not authenticated.
        username: String,
    },

    /// Keep-alive; refreshes presence activity.
    Heartbeat {
        /// Optional explicit identity. Clients that already identified
        /// may omit it and the connection's bound identity is used.
        #[serde(default)]
        username: Option<String>,
    },

    /// Focus this connection on one topic (e.g. a question id).
    Subscribe {
        /// Topic filter for subsequent broadcasts.
        topic: String,
    },

    /// Client-originated relay intent: an answer was submitted.
    AnswerSubmitted {
        username: String,
        question_id: String,
        /// Opaque answer payload; the relay never interprets it.
        answer_value: JsonValue,
    },

    /// Client-originated relay intent: a vote was cast.
    VoteCast {
        voter_username: String,
        target_username: String,
        question_id: String,
        vote_type: String,
    },
}

impl ClientMessage {
    /// Message kind as a string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Identify { .. } => "identify",
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::AnswerSubmitted { .. } => "answer_submitted",
            ClientMessage::VoteCast { .. } => "vote_cast",
        }
    }
}

/// Messages the relay pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once immediately after accept.
    Connected {
        #[serde(rename = "clientCount")]
        client_count: usize,
        version: String,
    },

    /// Current set of online identities, sent after `Connected`.
    PresenceSnapshot { users: Vec<String>, count: usize },

    /// An identity transitioned from zero to at least one connection.
    UserOnline {
        username: String,
        timestamp: DateTime<Utc>,
    },

    /// An identity's grace period elapsed with no live connections.
    UserOffline {
        username: String,
        timestamp: DateTime<Utc>,
    },

    /// A backend row changed, or a peer relayed an intent.
    RealtimeUpdate {
        event: String,
        data: JsonValue,
        table: String,
        timestamp: DateTime<Utc>,
    },

    /// Reply to a client heartbeat.
    Pong { timestamp: DateTime<Utc> },

    /// Structured error reply for malformed input.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::PresenceSnapshot { .. } => "presence_snapshot",
            ServerMessage::UserOnline { .. } => "user_online",
            ServerMessage::UserOffline { .. } => "user_offline",
            ServerMessage::RealtimeUpdate { .. } => "realtime_update",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Build an error reply stamped with the current time.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user_online(username: impl Into<String>) -> Self {
        ServerMessage::UserOnline {
            username: username.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user_offline(username: impl Into<String>) -> Self {
        ServerMessage::UserOffline {
            username: username.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identify_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"identify","username":"Apple_Lion"}"#)
                .expect("should parse");
        assert_eq!(
            msg,
            ClientMessage::Identify {
                username: "Apple_Lion".to_string()
            }
        );
        assert_eq!(msg.kind(), "identify");
    }

    #[test]
    fn test_heartbeat_username_optional() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"heartbeat"}"#).expect("should parse");
        assert_eq!(msg, ClientMessage::Heartbeat { username: None });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"heartbeat","username":"Apple_Lion"}"#)
                .expect("should parse");
        assert_eq!(
            msg,
            ClientMessage::Heartbeat {
                username: Some("Apple_Lion".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"shout","text":"hi"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_vote_cast_parses() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"vote_cast","voter_username":"A","target_username":"B","question_id":"U1-L2-Q01","vote_type":"agree"}"#,
        )
        .expect("should parse");
        assert_eq!(msg.kind(), "vote_cast");
    }

    #[test]
    fn test_connected_uses_camel_case_count() {
        let msg = ServerMessage::Connected {
            client_count: 7,
            version: "0.3.0".to_string(),
        };
        let json = serde_json::to_value(&msg).expect("should serialize");
        assert_eq!(json["type"], "connected");
        assert_eq!(json["clientCount"], 7);
    }

    #[test]
    fn test_realtime_update_shape() {
        let msg = ServerMessage::RealtimeUpdate {
            event: "INSERT".to_string(),
            data: json!({"question_id": "U1-L2-Q01"}),
            table: "answers".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).expect("should serialize");
        assert_eq!(json["type"], "realtime_update");
        assert_eq!(json["table"], "answers");
        assert_eq!(json["data"]["question_id"], "U1-L2-Q01");
    }

    #[test]
    fn test_server_message_round_trips() {
        let msg = ServerMessage::user_online("Apple_Lion");
        let text = serde_json::to_string(&msg).expect("should serialize");
        let back: ServerMessage = serde_json::from_str(&text).expect("should parse");
        assert_eq!(back.kind(), "user_online");
    }

    proptest::proptest! {
        /// Whatever bytes a client sends, parsing returns Ok or Err,
        /// never a panic.
        #[test]
        fn prop_arbitrary_input_parses_or_errors(input in "\\PC*") {
            let _ = serde_json::from_str::<ClientMessage>(&input);
        }

        /// Identities survive the trip through the online announcement
        /// unchanged, including unicode display names.
        #[test]
        fn prop_username_preserved_in_online_event(username in "\\PC{1,32}") {
            let text = serde_json::to_string(&ServerMessage::user_online(&username))
                .expect("should serialize");
            let value: JsonValue = serde_json::from_str(&text).expect("valid json");
            proptest::prop_assert_eq!(value["username"].as_str(), Some(username.as_str()));
        }
    }
}
