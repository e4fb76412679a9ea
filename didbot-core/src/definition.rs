//! Machine definition types.
//!
//! Machines are written in YAML or JSON:
//!
//! ```yaml
//! name: echo
//! type: conversation
//! keep_memory: false
//! initial:
//!   target: IDLE
//!   sends:
//!     - protocol: basic_message
//!       rule: DATA
//!       data: Hello! Say something and I will repeat it.
//! states:
//!   IDLE:
//!     transitions:
//!       - trigger: { protocol: basic_message, rule: INPUT_EQUAL, data: bye }
//!         sends: [{ protocol: basic_message, rule: DATA, data: Bye! }]
//!         target: DONE
//!       - trigger: { protocol: basic_message, rule: INPUT_SAVE, data: LINE }
//!         sends: [{ protocol: basic_message, rule: FORMAT_MEM, data: "echo {{.LINE}}" }]
//!         target: IDLE
//!   DONE:
//!     terminate: true
//! ```
//!
//! Parsing resolves protocol and rule names, checks that exactly one state is
//! the initial target, and rejects events that cannot work at runtime.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// =========================================================================
// Protocols and rules
// =========================================================================

/// Protocol an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    BasicMessage,
    IssueCredential,
    PresentProof,
    TrustPing,
    /// Answer to a question from the agency (e.g. proof verification).
    Answer,
    /// Generic user hook.
    Hook,
    /// Generic non-DIDComm backend channel.
    Backend,
    /// Pseudo-protocol for notifications the machine sends to itself.
    Transient,
    Email,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::BasicMessage => "basic_message",
            ProtocolType::IssueCredential => "issue_credential",
            ProtocolType::PresentProof => "present_proof",
            ProtocolType::TrustPing => "trust_ping",
            ProtocolType::Answer => "answer",
            ProtocolType::Hook => "hook",
            ProtocolType::Backend => "backend",
            ProtocolType::Transient => "transient",
            ProtocolType::Email => "email",
        }
    }

    fn allowed_on(&self, side: Side) -> bool {
        match side {
            Side::Trigger => !matches!(self, ProtocolType::Email),
            Side::Send => true,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic_message" | "basicmessage" => Ok(ProtocolType::BasicMessage),
            "issue_credential" | "issue_cred" | "issuecredential" => {
                Ok(ProtocolType::IssueCredential)
            }
            "present_proof" | "presentproof" | "proof" => Ok(ProtocolType::PresentProof),
            "trust_ping" | "trustping" => Ok(ProtocolType::TrustPing),
            "answer" | "qa" => Ok(ProtocolType::Answer),
            "hook" => Ok(ProtocolType::Hook),
            "backend" => Ok(ProtocolType::Backend),
            "transient" => Ok(ProtocolType::Transient),
            "email" => Ok(ProtocolType::Email),
            _ => Err(CoreError::UnknownProtocol {
                protocol: s.to_string(),
            }),
        }
    }
}

/// Rule deciding how an event matches (trigger) or builds its payload (send).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    Input,
    InputSave,
    InputEqual,
    ValidateEqual,
    ValidateNotEqual,
    Data,
    Format,
    FormatMem,
    GenPin,
    Lua,
    Transient,
    OurStatus,
    AcceptAndInputValues,
    NotAcceptValues,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::Input => "INPUT",
            Rule::InputSave => "INPUT_SAVE",
            Rule::InputEqual => "INPUT_EQUAL",
            Rule::ValidateEqual => "VALIDATE_EQUAL",
            Rule::ValidateNotEqual => "VALIDATE_NOT_EQUAL",
            Rule::Data => "DATA",
            Rule::Format => "FORMAT",
            Rule::FormatMem => "FORMAT_MEM",
            Rule::GenPin => "GEN_PIN",
            Rule::Lua => "LUA",
            Rule::Transient => "TRANSIENT",
            Rule::OurStatus => "OUR_STATUS",
            Rule::AcceptAndInputValues => "ACCEPT_AND_INPUT_VALUES",
            Rule::NotAcceptValues => "NOT_ACCEPT_VALUES",
        }
    }

    fn allowed_on(&self, side: Side) -> bool {
        match side {
            Side::Trigger => !matches!(self, Rule::Format | Rule::FormatMem | Rule::GenPin),
            Side::Send => !matches!(
                self,
                Rule::ValidateEqual
                    | Rule::ValidateNotEqual
                    | Rule::AcceptAndInputValues
                    | Rule::NotAcceptValues
            ),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INPUT" | "USE_INPUT" => Ok(Rule::Input),
            "INPUT_SAVE" => Ok(Rule::InputSave),
            "INPUT_EQUAL" => Ok(Rule::InputEqual),
            "VALIDATE_EQUAL" | "INPUT_VALIDATE_EQUAL" => Ok(Rule::ValidateEqual),
            "VALIDATE_NOT_EQUAL" | "INPUT_VALIDATE_NOT_EQUAL" => Ok(Rule::ValidateNotEqual),
            "DATA" => Ok(Rule::Data),
            "FORMAT" => Ok(Rule::Format),
            "FORMAT_MEM" => Ok(Rule::FormatMem),
            "GEN_PIN" => Ok(Rule::GenPin),
            "LUA" => Ok(Rule::Lua),
            "TRANSIENT" => Ok(Rule::Transient),
            "OUR_STATUS" => Ok(Rule::OurStatus),
            "ACCEPT_AND_INPUT_VALUES" => Ok(Rule::AcceptAndInputValues),
            "NOT_ACCEPT_VALUES" => Ok(Rule::NotAcceptValues),
            _ => Err(CoreError::UnknownRule {
                rule: s.to_string(),
            }),
        }
    }
}

/// Which half of a transition an event sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Trigger,
    Send,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Trigger => "trigger",
            Side::Send => "send",
        }
    }
}

/// Kind of machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    /// Driven by DIDComm protocol notifications.
    #[default]
    Conversation,
    /// Driven by backend channel messages.
    Backend,
}

// =========================================================================
// Raw (as written) definition
// =========================================================================

/// Structured payload of an event, keyed by protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventData {
    BasicMessage {
        content: String,
    },
    Issuing {
        cred_def_id: String,
        /// Credential attributes as a JSON document, rendered as a template.
        attrs: String,
    },
    Proof {
        /// Requested attributes as a JSON document, rendered as a template.
        attributes: String,
    },
    Hook {
        #[serde(default)]
        data: BTreeMap<String, String>,
    },
    Backend {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    Email {
        to: String,
        #[serde(default)]
        from: String,
        #[serde(default)]
        subject: String,
    },
    Answer {
        #[serde(default = "default_true")]
        ack: bool,
    },
}

/// Reads and writes `event_data` as a single-key map (`issuing: {...}`)
/// in both YAML and JSON. serde_yaml would otherwise expect `!issuing` tags.
mod event_data_map {
    use super::EventData;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Tagged(#[serde(with = "serde_yaml::with::singleton_map")] EventData);

    pub fn serialize<S: Serializer>(
        value: &Option<EventData>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(data) => serde_yaml::with::singleton_map::serialize(data, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<EventData>, D::Error> {
        Ok(Option::<Tagged>::deserialize(deserializer)?.map(|t| t.0))
    }
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// An event as written in the definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRaw {
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "event_data_map"
    )]
    pub event_data: Option<EventData>,

    /// Do not ask the agency for a status notification of this send.
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_status: bool,
}

/// A transition as written in the definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<EventRaw>,

    #[serde(default)]
    pub sends: Vec<EventRaw>,

    pub target: String,
}

/// A state as written in the definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateRaw {
    #[serde(default)]
    pub transitions: Vec<TransitionRaw>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub terminate: bool,
}

/// States in declaration order, duplicates preserved so they can be reported.
#[derive(Debug, Clone, Default)]
pub struct StateEntries(pub Vec<(String, StateRaw)>);

impl Serialize for StateEntries {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, state) in &self.0 {
            map.serialize_entry(name, state)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StateEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};

        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = StateEntries;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of state name to state")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((name, state)) = map.next_entry::<String, StateRaw>()? {
                    entries.push((name, state));
                }
                Ok(StateEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Raw machine definition as written by the machine author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDefinitionRaw {
    #[serde(default)]
    pub name: String,

    #[serde(default, rename = "type")]
    pub kind: MachineKind,

    #[serde(default)]
    pub keep_memory: bool,

    pub initial: TransitionRaw,

    pub states: StateEntries,
}

// =========================================================================
// Validated definition
// =========================================================================

/// A resolved event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub protocol: ProtocolType,
    pub rule: Rule,
    pub type_id: Option<String>,
    /// Literal, format string, template or script, depending on `rule`.
    pub data: String,
    pub event_data: Option<EventData>,
    pub want_status: bool,
}

impl Event {
    /// Resolves a raw event for the given side of a transition.
    pub fn resolve(raw: &EventRaw, side: Side) -> Result<Self, CoreError> {
        let protocol: ProtocolType = raw.protocol.parse()?;
        if !protocol.allowed_on(side) {
            return Err(CoreError::UnsupportedProtocol {
                protocol: protocol.to_string(),
                side: side.as_str(),
            });
        }

        let rule = match raw.rule.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => r.parse()?,
            _ => match side {
                Side::Trigger => Rule::Input,
                Side::Send => Rule::Data,
            },
        };

        let unsupported = || CoreError::UnsupportedRule {
            protocol: protocol.to_string(),
            rule: rule.to_string(),
            side: side.as_str(),
        };

        if !rule.allowed_on(side) {
            return Err(unsupported());
        }

        if side == Side::Trigger {
            let fits = match rule {
                Rule::AcceptAndInputValues | Rule::NotAcceptValues => {
                    protocol == ProtocolType::Answer
                }
                Rule::OurStatus => matches!(
                    protocol,
                    ProtocolType::BasicMessage
                        | ProtocolType::IssueCredential
                        | ProtocolType::PresentProof
                        | ProtocolType::TrustPing
                ),
                Rule::Transient => protocol == ProtocolType::Transient,
                _ => true,
            };
            if !fits {
                return Err(unsupported());
            }
        }

        if side == Side::Send {
            let required = match protocol {
                ProtocolType::IssueCredential => Some((
                    matches!(raw.event_data, Some(EventData::Issuing { .. })),
                    "issuing",
                )),
                ProtocolType::PresentProof => Some((
                    matches!(raw.event_data, Some(EventData::Proof { .. })),
                    "proof",
                )),
                ProtocolType::Email => Some((
                    matches!(raw.event_data, Some(EventData::Email { .. })),
                    "email",
                )),
                _ => None,
            };
            if let Some((false, field)) = required {
                return Err(CoreError::MissingEventData {
                    protocol: protocol.to_string(),
                    field,
                });
            }
        }

        let data = match (&raw.data, &raw.event_data) {
            (Some(d), _) => d.clone(),
            (None, Some(EventData::BasicMessage { content })) => content.clone(),
            _ => String::new(),
        };

        if matches!(rule, Rule::Lua) && data.trim().is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: format!("{} {} event has an empty script", protocol, side.as_str()),
            });
        }

        Ok(Self {
            protocol,
            rule,
            type_id: raw.type_id.clone().filter(|t| !t.is_empty()),
            data,
            event_data: raw.event_data.clone(),
            want_status: !raw.no_status,
        })
    }
}

/// A resolved transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub trigger: Event,
    pub sends: Vec<Event>,
    pub target: String,
}

impl Transition {
    /// Returns a copy of this transition heading to `target`.
    pub fn with_target(&self, target: impl Into<String>) -> Self {
        Self {
            trigger: self.trigger.clone(),
            sends: self.sends.clone(),
            target: target.into(),
        }
    }
}

/// The initial transition: sends emitted on start and the first state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialTransition {
    pub sends: Vec<Event>,
    pub target: String,
}

/// A resolved state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub name: String,
    pub transitions: Vec<Transition>,
    pub terminal: bool,
}

/// Validated machine definition, shared by every machine instance.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    pub name: String,

    pub kind: MachineKind,

    /// Keep memory when the machine returns to its initial state.
    pub keep_memory: bool,

    pub initial: InitialTransition,

    /// States in declaration order.
    states: Vec<State>,

    /// State name -> index into `states`.
    index: HashMap<String, usize>,

    /// Index of the initial state.
    initial_index: usize,

    /// Hash of the definition for integrity checks.
    pub checksum: String,
}

impl MachineDefinition {
    /// Parses and validates a machine definition from a JSON value.
    ///
    /// Duplicate state names cannot be detected here because a JSON value
    /// has already collapsed them; use [`MachineDefinition::from_json_str`]
    /// for author-supplied text.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses and validates a machine definition from JSON text.
    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_json::from_str(s)?;
        Self::from_raw(raw)
    }

    /// Parses and validates a machine definition from YAML text.
    pub fn from_yaml(s: &str) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_yaml::from_str(s)?;
        Self::from_raw(raw)
    }

    /// Loads a definition file; `.json` files are read as JSON, anything
    /// else as YAML. A missing name defaults to the file stem.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut raw: MachineDefinitionRaw = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        if raw.name.is_empty() {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                raw.name = stem.to_string();
            }
        }

        Self::from_raw(raw)
    }

    /// Validates raw parts and builds the indexed definition.
    pub fn from_raw(raw: MachineDefinitionRaw) -> Result<Self, CoreError> {
        let initial_target = raw.initial.target.clone();

        // Exactly one initial state
        let count = raw
            .states
            .0
            .iter()
            .filter(|(name, _)| *name == initial_target)
            .count();
        match count {
            0 => {
                return Err(CoreError::MissingInitialState {
                    target: initial_target,
                })
            }
            1 => {}
            n => {
                return Err(CoreError::MultipleInitialStates {
                    target: initial_target,
                    count: n,
                })
            }
        }

        // Build state index
        let mut index = HashMap::new();
        for (i, (name, _)) in raw.states.0.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(CoreError::DuplicateState {
                    state: name.clone(),
                });
            }
        }

        if raw.initial.trigger.is_some() {
            return Err(CoreError::InvalidDefinition {
                reason: "initial transition cannot have a trigger".to_string(),
            });
        }

        let initial_index = index[&initial_target];
        let initial = InitialTransition {
            sends: resolve_sends(&raw.initial.sends)?,
            target: initial_target,
        };

        // Resolve states and transitions
        let mut states = Vec::with_capacity(raw.states.0.len());
        for (name, state_raw) in &raw.states.0 {
            let mut transitions = Vec::with_capacity(state_raw.transitions.len());
            for t in &state_raw.transitions {
                let trigger_raw = t.trigger.as_ref().ok_or_else(|| CoreError::InvalidDefinition {
                    reason: format!("transition in state '{}' has no trigger", name),
                })?;

                if !index.contains_key(&t.target) {
                    return Err(CoreError::UnknownTarget {
                        state: name.clone(),
                        target: t.target.clone(),
                    });
                }

                transitions.push(Transition {
                    trigger: Event::resolve(trigger_raw, Side::Trigger)?,
                    sends: resolve_sends(&t.sends)?,
                    target: t.target.clone(),
                });
            }

            states.push(State {
                name: name.clone(),
                transitions,
                terminal: state_raw.terminate,
            });
        }

        // Compute checksum
        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            name: raw.name.clone(),
            kind: raw.kind,
            keep_memory: raw.keep_memory,
            initial,
            states,
            index,
            initial_index,
            checksum,
        })
    }

    /// Looks up a state by name.
    pub fn state(&self, name: &str) -> Option<&State> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    /// Returns the declaration index of a state.
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Declaration index of the initial state.
    pub fn initial_index(&self) -> usize {
        self.initial_index
    }

    /// Returns true if the given state exists.
    pub fn has_state(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// States in declaration order.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// Name of the initial state.
    pub fn initial_state(&self) -> &str {
        &self.initial.target
    }

    /// Iterates over every event of the definition.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.initial.sends.iter().chain(
            self.states
                .iter()
                .flat_map(|s| s.transitions.iter())
                .flat_map(|t| std::iter::once(&t.trigger).chain(t.sends.iter())),
        )
    }

    /// Returns true if any event needs a script evaluator.
    pub fn needs_evaluator(&self) -> bool {
        self.events().any(|e| e.rule == Rule::Lua)
    }
}

fn resolve_sends(raw: &[EventRaw]) -> Result<Vec<Event>, CoreError> {
    raw.iter().map(|e| Event::resolve(e, Side::Send)).collect()
}
