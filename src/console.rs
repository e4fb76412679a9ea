//! Console agency.
//!
//! A [`ProtocolClient`] that prints every outbound call to the terminal and
//! echoes the status the agency would report back into the inbound stream,
//! so `OUR_STATUS` triggers work in an interactive session.

use async_trait::async_trait;
use colored::Colorize;
use didbot_agency::{ClientError, ProtocolClient, ProtocolId};
use didbot_core::notification::{Notification, ProtocolStatus, StatusPayload};
use didbot_core::ProtocolType;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

pub struct ConsoleClient {
    echo: mpsc::UnboundedSender<Notification>,
}

impl ConsoleClient {
    pub fn new(echo: mpsc::UnboundedSender<Notification>) -> Self {
        Self { echo }
    }

    fn completed(
        &self,
        conn_id: &str,
        protocol: ProtocolType,
        payload: StatusPayload,
    ) -> Result<ProtocolId, ClientError> {
        let id = ProtocolId::generate();
        let mut status = ProtocolStatus::completed(conn_id, id.0.as_str(), protocol);
        status.payload = payload;
        self.echo
            .send(Notification::Status(status))
            .map_err(|_| ClientError::Closed)?;
        Ok(id)
    }
}

fn print_line(label: &str, text: impl std::fmt::Display) {
    println!("{} {}", format!("[{}]", label).cyan(), text);
}

#[async_trait]
impl ProtocolClient for ConsoleClient {
    async fn send_basic_message(
        &self,
        conn_id: &str,
        content: &str,
    ) -> Result<ProtocolId, ClientError> {
        println!("{} {}", "bot>".green().bold(), content);
        self.completed(
            conn_id,
            ProtocolType::BasicMessage,
            StatusPayload::BasicMessage {
                content: content.to_string(),
            },
        )
    }

    async fn issue_credential(
        &self,
        conn_id: &str,
        cred_def_id: &str,
        attrs: &str,
    ) -> Result<ProtocolId, ClientError> {
        print_line("issue", format!("{} {}", cred_def_id.yellow(), attrs));
        self.completed(
            conn_id,
            ProtocolType::IssueCredential,
            StatusPayload::Issuing {
                cred_def_id: cred_def_id.to_string(),
                attrs: attrs.to_string(),
            },
        )
    }

    async fn request_proof(
        &self,
        conn_id: &str,
        attributes: &str,
    ) -> Result<ProtocolId, ClientError> {
        print_line("proof", attributes);
        println!("{}", "  answer with: /prove name=value ...".dimmed());
        self.completed(conn_id, ProtocolType::PresentProof, StatusPayload::None)
    }

    async fn trust_ping(&self, conn_id: &str) -> Result<ProtocolId, ClientError> {
        print_line("ping", conn_id);
        self.completed(conn_id, ProtocolType::TrustPing, StatusPayload::None)
    }

    async fn answer_question(
        &self,
        question_id: &str,
        ack: bool,
        info: &str,
    ) -> Result<(), ClientError> {
        let verdict = if ack { "accepted".green() } else { "declined".red() };
        print_line("answer", format!("{} {} {}", question_id.dimmed(), verdict, info));
        Ok(())
    }

    async fn resume(
        &self,
        _conn_id: &str,
        protocol_id: &str,
        accept: bool,
    ) -> Result<(), ClientError> {
        let verdict = if accept { "accepted".green() } else { "declined".red() };
        print_line("resume", format!("{} {}", protocol_id.dimmed(), verdict));
        Ok(())
    }

    async fn send_email(
        &self,
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ClientError> {
        print_line("email", format!("{} -> {}: {}", from, to.yellow(), subject.bold()));
        println!("{}", body);
        Ok(())
    }

    async fn send_hook(
        &self,
        conn_id: &str,
        data: &BTreeMap<String, String>,
        content: &str,
    ) -> Result<(), ClientError> {
        let data =
            serde_json::to_string(data).map_err(|e| ClientError::Rejected(e.to_string()))?;
        print_line("hook", format!("{} {} {}", conn_id.dimmed(), data, content));
        Ok(())
    }

    async fn send_backend(
        &self,
        conn_id: &str,
        subject: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        print_line("backend", format!("{} {} {}", conn_id.dimmed(), subject.yellow(), content));
        Ok(())
    }
}
