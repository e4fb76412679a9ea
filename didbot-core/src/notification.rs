//! Inbound notifications the machine reacts to.

use crate::definition::ProtocolType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of a protocol instance as reported by the agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    /// Protocol finished successfully.
    Ok,
    /// Protocol is suspended, waiting for our decision.
    Waiting,
    /// The other party declined.
    Nack,
    /// Protocol failed.
    Error,
}

/// A proof attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofValue {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_def_id: Option<String>,
}

/// Protocol specific part of a status notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusPayload {
    BasicMessage {
        content: String,
    },
    Issuing {
        cred_def_id: String,
        attrs: String,
    },
    Proof {
        attributes: Vec<ProofValue>,
    },
    #[default]
    None,
}

/// Status change of a protocol instance on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStatus {
    pub conn_id: String,
    pub protocol_id: String,
    pub protocol: ProtocolType,
    pub state: StatusState,
    /// True when the protocol was started by this side, e.g. the echo of a
    /// basic message the bot sent.
    #[serde(default)]
    pub initiated_by_us: bool,
    #[serde(default)]
    pub payload: StatusPayload,
}

impl ProtocolStatus {
    /// Creates an incoming basic message status.
    pub fn basic_message(conn_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            protocol_id: uuid::Uuid::new_v4().to_string(),
            protocol: ProtocolType::BasicMessage,
            state: StatusState::Ok,
            initiated_by_us: false,
            payload: StatusPayload::BasicMessage {
                content: content.into(),
            },
        }
    }

    /// Creates the completion status of a protocol we started.
    pub fn completed(
        conn_id: impl Into<String>,
        protocol_id: impl Into<String>,
        protocol: ProtocolType,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            protocol_id: protocol_id.into(),
            protocol,
            state: StatusState::Ok,
            initiated_by_us: true,
            payload: StatusPayload::None,
        }
    }

    /// Content the trigger rules evaluate.
    pub fn content(&self) -> String {
        match &self.payload {
            StatusPayload::BasicMessage { content } => content.clone(),
            StatusPayload::Issuing { attrs, .. } => attrs.clone(),
            StatusPayload::Proof { attributes } => values_json(attributes),
            StatusPayload::None => String::new(),
        }
    }
}

/// Kind of decision the agency asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    /// Verify the values of a received proof.
    ProofVerify { attributes: Vec<ProofValue> },
}

/// A question that needs an accept/reject answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub conn_id: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl Question {
    pub fn proof_verify(conn_id: impl Into<String>, attributes: Vec<ProofValue>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conn_id: conn_id.into(),
            kind: QuestionKind::ProofVerify { attributes },
        }
    }

    /// Attribute values carried by the question.
    pub fn values(&self) -> &[ProofValue] {
        match &self.kind {
            QuestionKind::ProofVerify { attributes } => attributes,
        }
    }

    /// Content the trigger rules evaluate: the values as a JSON object.
    pub fn content(&self) -> String {
        values_json(self.values())
    }
}

/// Data delivered by a user hook callback.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HookData {
    pub conn_id: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl HookData {
    /// Content the trigger rules evaluate: the data as a JSON object.
    pub fn content(&self) -> String {
        serde_json::to_string(&self.data).unwrap_or_default()
    }
}

/// A message from a non-DIDComm backend channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendData {
    pub conn_id: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub subject: String,
    pub content: String,
}

/// Everything the agency can deliver for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Status(ProtocolStatus),
    Question(Question),
    Hook(HookData),
    Backend(BackendData),
    /// Periodic liveness ping of the listen stream.
    KeepAlive,
}

impl Notification {
    /// Connection the notification belongs to.
    pub fn conn_id(&self) -> Option<&str> {
        match self {
            Notification::Status(s) => Some(&s.conn_id),
            Notification::Question(q) => Some(&q.conn_id),
            Notification::Hook(h) => Some(&h.conn_id),
            Notification::Backend(b) => Some(&b.conn_id),
            Notification::KeepAlive => None,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Notification::KeepAlive)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Status(_) => "status",
            Notification::Question(_) => "question",
            Notification::Hook(_) => "hook",
            Notification::Backend(_) => "backend",
            Notification::KeepAlive => "keep_alive",
        }
    }
}

fn values_json(values: &[ProofValue]) -> String {
    let map: BTreeMap<&str, &str> = values
        .iter()
        .map(|v| (v.name.as_str(), v.value.as_str()))
        .collect();
    serde_json::to_string(&map).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_content() {
        let status = ProtocolStatus::basic_message("c1", "hello");
        assert_eq!(status.content(), "hello");
        assert!(!status.initiated_by_us);

        let done = ProtocolStatus::completed("c1", "p1", ProtocolType::IssueCredential);
        assert_eq!(done.content(), "");
        assert!(done.initiated_by_us);
    }

    #[test]
    fn test_question_content_is_json() {
        let q = Question::proof_verify(
            "c1",
            vec![
                ProofValue {
                    name: "email".into(),
                    value: "a@b.c".into(),
                    cred_def_id: None,
                },
                ProofValue {
                    name: "age".into(),
                    value: "42".into(),
                    cred_def_id: None,
                },
            ],
        );
        assert_eq!(q.content(), r#"{"age":"42","email":"a@b.c"}"#);
    }

    #[test]
    fn test_notification_json() {
        let json = r#"{"type":"backend","conn_id":"c9","subject":"chat","content":"hi"}"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(n.conn_id(), Some("c9"));
        assert_eq!(n.kind(), "backend");

        let ka: Notification = serde_json::from_str(r#"{"type":"keep_alive"}"#).unwrap();
        assert!(ka.is_keep_alive());
        assert_eq!(ka.conn_id(), None);
    }
}
