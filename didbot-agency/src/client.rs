//! Outbound protocol client interface.
//!
//! Conversations talk to the agency only through [`ProtocolClient`]. The
//! transport behind it (gRPC, a console, a test recorder) is not visible to
//! the state machine.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of a protocol instance started through the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(pub String);

impl ProtocolId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Returns whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// One async call per outbound protocol operation.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn send_basic_message(
        &self,
        conn_id: &str,
        content: &str,
    ) -> Result<ProtocolId, ClientError>;

    async fn issue_credential(
        &self,
        conn_id: &str,
        cred_def_id: &str,
        attrs: &str,
    ) -> Result<ProtocolId, ClientError>;

    async fn request_proof(&self, conn_id: &str, attributes: &str)
        -> Result<ProtocolId, ClientError>;

    async fn trust_ping(&self, conn_id: &str) -> Result<ProtocolId, ClientError>;

    /// Answers an agency question, e.g. accepts or rejects proof values.
    async fn answer_question(
        &self,
        question_id: &str,
        ack: bool,
        info: &str,
    ) -> Result<(), ClientError>;

    /// Resumes a protocol that is waiting for our decision.
    async fn resume(
        &self,
        conn_id: &str,
        protocol_id: &str,
        accept: bool,
    ) -> Result<(), ClientError>;

    async fn send_email(
        &self,
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ClientError>;

    async fn send_hook(
        &self,
        conn_id: &str,
        data: &BTreeMap<String, String>,
        content: &str,
    ) -> Result<(), ClientError>;

    async fn send_backend(
        &self,
        conn_id: &str,
        subject: &str,
        content: &str,
    ) -> Result<(), ClientError>;
}

/// A call made through a [`RecordingClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    BasicMessage {
        conn_id: String,
        content: String,
    },
    IssueCredential {
        conn_id: String,
        cred_def_id: String,
        attrs: String,
    },
    RequestProof {
        conn_id: String,
        attributes: String,
    },
    TrustPing {
        conn_id: String,
    },
    Answer {
        question_id: String,
        ack: bool,
        info: String,
    },
    Resume {
        conn_id: String,
        protocol_id: String,
        accept: bool,
    },
    Email {
        to: String,
        from: String,
        subject: String,
        body: String,
    },
    Hook {
        conn_id: String,
        data: BTreeMap<String, String>,
        content: String,
    },
    Backend {
        conn_id: String,
        subject: String,
        content: String,
    },
}

type CallFilter = Box<dyn Fn(&Call) -> bool + Send + Sync>;

/// Client that records every call instead of talking to an agency.
///
/// Used by tests and dry runs. Setting a failure makes every following call
/// fail with a transport error until it is cleared.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<Call>>,
    failure: Mutex<Option<String>>,
    fail_when: Mutex<Option<CallFilter>>,
    tap: Option<mpsc::UnboundedSender<Call>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client that also forwards each call to the returned receiver.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<Call>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            tap: Some(tx),
            ..Self::default()
        };
        (client, rx)
    }

    /// Returns a copy of the calls recorded so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Makes following calls fail, or succeed again with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }

    /// Makes only the calls matching `filter` fail.
    pub fn fail_when(&self, filter: impl Fn(&Call) -> bool + Send + Sync + 'static) {
        *self.fail_when.lock() = Some(Box::new(filter));
    }

    fn record(&self, call: Call) -> Result<(), ClientError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(ClientError::Transport(message));
        }
        if matches!(self.fail_when.lock().as_ref(), Some(filter) if filter(&call)) {
            return Err(ClientError::Transport(format!("{:?} refused", call)));
        }
        if let Some(tap) = &self.tap {
            let _ = tap.send(call.clone());
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for RecordingClient {
    async fn send_basic_message(
        &self,
        conn_id: &str,
        content: &str,
    ) -> Result<ProtocolId, ClientError> {
        self.record(Call::BasicMessage {
            conn_id: conn_id.to_string(),
            content: content.to_string(),
        })?;
        Ok(ProtocolId::generate())
    }

    async fn issue_credential(
        &self,
        conn_id: &str,
        cred_def_id: &str,
        attrs: &str,
    ) -> Result<ProtocolId, ClientError> {
        self.record(Call::IssueCredential {
            conn_id: conn_id.to_string(),
            cred_def_id: cred_def_id.to_string(),
            attrs: attrs.to_string(),
        })?;
        Ok(ProtocolId::generate())
    }

    async fn request_proof(
        &self,
        conn_id: &str,
        attributes: &str,
    ) -> Result<ProtocolId, ClientError> {
        self.record(Call::RequestProof {
            conn_id: conn_id.to_string(),
            attributes: attributes.to_string(),
        })?;
        Ok(ProtocolId::generate())
    }

    async fn trust_ping(&self, conn_id: &str) -> Result<ProtocolId, ClientError> {
        self.record(Call::TrustPing {
            conn_id: conn_id.to_string(),
        })?;
        Ok(ProtocolId::generate())
    }

    async fn answer_question(
        &self,
        question_id: &str,
        ack: bool,
        info: &str,
    ) -> Result<(), ClientError> {
        self.record(Call::Answer {
            question_id: question_id.to_string(),
            ack,
            info: info.to_string(),
        })
    }

    async fn resume(
        &self,
        conn_id: &str,
        protocol_id: &str,
        accept: bool,
    ) -> Result<(), ClientError> {
        self.record(Call::Resume {
            conn_id: conn_id.to_string(),
            protocol_id: protocol_id.to_string(),
            accept,
        })
    }

    async fn send_email(
        &self,
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ClientError> {
        self.record(Call::Email {
            to: to.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }

    async fn send_hook(
        &self,
        conn_id: &str,
        data: &BTreeMap<String, String>,
        content: &str,
    ) -> Result<(), ClientError> {
        self.record(Call::Hook {
            conn_id: conn_id.to_string(),
            data: data.clone(),
            content: content.to_string(),
        })
    }

    async fn send_backend(
        &self,
        conn_id: &str,
        subject: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        self.record(Call::Backend {
            conn_id: conn_id.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
        })
    }
}
