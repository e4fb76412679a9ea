//! Outbound send building.
//!
//! Building a send happens in two steps: the rule of the event produces the
//! content string, then the builder of the event's protocol assembles the
//! protocol specific payload around it.

use crate::definition::{Event, EventData, ProtocolType, Rule};
use crate::error::CoreError;
use crate::memory::{self, Memory};
use crate::script::{run_script, Evaluator, Sentinel};
use crate::template;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol specific part of an outbound send.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendPayload {
    #[default]
    None,
    Issuing {
        cred_def_id: String,
        attrs: String,
    },
    Proof {
        attributes: String,
    },
    Answer {
        ack: bool,
    },
    Hook {
        data: BTreeMap<String, String>,
    },
    Backend {
        subject: String,
    },
    Email {
        to: String,
        from: String,
        subject: String,
    },
}

/// A built outbound event, ready to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEvent {
    pub protocol: ProtocolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub payload: SendPayload,
    pub want_status: bool,
}

/// Assembles the payload of one protocol.
pub trait SendBuilder {
    fn build(&self, event: &Event, content: String, memory: &Memory)
        -> Result<SendEvent, CoreError>;
}

struct BasicMessageBuilder;
struct IssueCredentialBuilder;
struct ProofRequestBuilder;
struct AnswerBuilder;
struct TrustPingBuilder;
struct HookBuilder;
struct BackendBuilder;
struct TransientBuilder;
struct EmailBuilder;

/// Returns the builder for a protocol.
pub fn builder_for(protocol: ProtocolType) -> &'static dyn SendBuilder {
    match protocol {
        ProtocolType::BasicMessage => &BasicMessageBuilder,
        ProtocolType::IssueCredential => &IssueCredentialBuilder,
        ProtocolType::PresentProof => &ProofRequestBuilder,
        ProtocolType::Answer => &AnswerBuilder,
        ProtocolType::TrustPing => &TrustPingBuilder,
        ProtocolType::Hook => &HookBuilder,
        ProtocolType::Backend => &BackendBuilder,
        ProtocolType::Transient => &TransientBuilder,
        ProtocolType::Email => &EmailBuilder,
    }
}

fn plain(event: &Event, content: String, payload: SendPayload) -> SendEvent {
    SendEvent {
        protocol: event.protocol,
        type_id: event.type_id.clone(),
        content,
        payload,
        want_status: event.want_status,
    }
}

fn missing(event: &Event, field: &'static str) -> CoreError {
    CoreError::MissingEventData {
        protocol: event.protocol.to_string(),
        field,
    }
}

impl SendBuilder for BasicMessageBuilder {
    fn build(&self, event: &Event, content: String, _: &Memory) -> Result<SendEvent, CoreError> {
        Ok(plain(event, content, SendPayload::None))
    }
}

impl SendBuilder for IssueCredentialBuilder {
    fn build(
        &self,
        event: &Event,
        content: String,
        memory: &Memory,
    ) -> Result<SendEvent, CoreError> {
        let Some(EventData::Issuing { cred_def_id, attrs }) = &event.event_data else {
            return Err(missing(event, "issuing"));
        };
        let payload = SendPayload::Issuing {
            cred_def_id: cred_def_id.clone(),
            attrs: template::render(attrs, memory)?,
        };
        Ok(plain(event, content, payload))
    }
}

impl SendBuilder for ProofRequestBuilder {
    fn build(
        &self,
        event: &Event,
        content: String,
        memory: &Memory,
    ) -> Result<SendEvent, CoreError> {
        let Some(EventData::Proof { attributes }) = &event.event_data else {
            return Err(missing(event, "proof"));
        };
        let payload = SendPayload::Proof {
            attributes: template::render(attributes, memory)?,
        };
        Ok(plain(event, content, payload))
    }
}

impl SendBuilder for AnswerBuilder {
    fn build(&self, event: &Event, content: String, _: &Memory) -> Result<SendEvent, CoreError> {
        let ack = match &event.event_data {
            Some(EventData::Answer { ack }) => *ack,
            _ => true,
        };
        Ok(plain(event, content, SendPayload::Answer { ack }))
    }
}

impl SendBuilder for TrustPingBuilder {
    fn build(&self, event: &Event, content: String, _: &Memory) -> Result<SendEvent, CoreError> {
        Ok(plain(event, content, SendPayload::None))
    }
}

impl SendBuilder for HookBuilder {
    fn build(
        &self,
        event: &Event,
        content: String,
        memory: &Memory,
    ) -> Result<SendEvent, CoreError> {
        let mut data = BTreeMap::new();
        if let Some(EventData::Hook { data: fields }) = &event.event_data {
            for (key, value) in fields {
                data.insert(key.clone(), template::render(value, memory)?);
            }
        }
        Ok(plain(event, content, SendPayload::Hook { data }))
    }
}

impl SendBuilder for BackendBuilder {
    fn build(&self, event: &Event, content: String, _: &Memory) -> Result<SendEvent, CoreError> {
        let subject = match (&event.type_id, &event.event_data) {
            (Some(type_id), _) => type_id.clone(),
            (None, Some(EventData::Backend { subject: Some(s) })) => s.clone(),
            _ => String::new(),
        };
        Ok(plain(event, content, SendPayload::Backend { subject }))
    }
}

impl SendBuilder for TransientBuilder {
    fn build(&self, event: &Event, content: String, _: &Memory) -> Result<SendEvent, CoreError> {
        Ok(plain(event, content, SendPayload::None))
    }
}

impl SendBuilder for EmailBuilder {
    fn build(
        &self,
        event: &Event,
        content: String,
        memory: &Memory,
    ) -> Result<SendEvent, CoreError> {
        let Some(EventData::Email { to, from, subject }) = &event.event_data else {
            return Err(missing(event, "email"));
        };
        let payload = SendPayload::Email {
            to: template::render(to, memory)?,
            from: from.clone(),
            subject: template::render(subject, memory)?,
        };
        Ok(plain(event, content, payload))
    }
}

/// Computes the content of a send from its rule.
///
/// Returns `None` when the send must be skipped (a failed script).
pub fn content(
    event: &Event,
    input: &str,
    memory: &mut Memory,
    evaluator: Option<&mut dyn Evaluator>,
) -> Result<Option<String>, CoreError> {
    let content = match event.rule {
        Rule::Input | Rule::OurStatus => input.to_string(),
        Rule::InputSave => {
            memory.set(event.data.as_str(), input);
            input.to_string()
        }
        Rule::InputEqual | Rule::Data | Rule::Transient => event.data.clone(),
        Rule::Format => template::format_input(&event.data, input),
        Rule::FormatMem => template::render(&event.data, memory)?,
        Rule::GenPin => {
            let pin = template::generate_pin();
            memory.set(memory::PIN, pin.as_str());
            if event.data.is_empty() {
                pin
            } else {
                template::render(&event.data, memory)?
            }
        }
        Rule::Lua => {
            let Some(evaluator) = evaluator else {
                tracing::warn!("LUA send without an evaluator, skipping");
                return Ok(None);
            };
            match run_script(evaluator, memory, &event.data, input, &Sentinel::Any) {
                Ok(outcome) => outcome.output,
                Err(e) => {
                    tracing::warn!("LUA send failed, skipping: {}", e);
                    return Ok(None);
                }
            }
        }
        // Trigger-only rules are rejected when the definition loads.
        Rule::ValidateEqual
        | Rule::ValidateNotEqual
        | Rule::AcceptAndInputValues
        | Rule::NotAcceptValues => event.data.clone(),
    };
    Ok(Some(content))
}

/// Builds every send of a transition in declaration order.
pub fn build_all(
    events: &[Event],
    input: &str,
    memory: &mut Memory,
    mut evaluator: Option<&mut dyn Evaluator>,
) -> Result<Vec<SendEvent>, CoreError> {
    let mut sends = Vec::with_capacity(events.len());
    for event in events {
        let reborrow = evaluator.as_mut().map(|e| &mut **e as &mut dyn Evaluator);
        let Some(content) = content(event, input, memory, reborrow)? else {
            continue;
        };
        sends.push(builder_for(event.protocol).build(event, content, memory)?);
    }
    Ok(sends)
}
