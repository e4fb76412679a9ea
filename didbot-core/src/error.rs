//! Core error types.

use thiserror::Error;

/// Errors from the conversation state machine engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("machine has no initial state: no state is named '{target}'")]
    MissingInitialState { target: String },

    #[error("machine has {count} initial states named '{target}'")]
    MultipleInitialStates { target: String, count: usize },

    #[error("duplicate state '{state}'")]
    DuplicateState { state: String },

    #[error("transition in state '{state}' targets unknown state '{target}'")]
    UnknownTarget { state: String, target: String },

    #[error("unknown protocol '{protocol}'")]
    UnknownProtocol { protocol: String },

    #[error("unknown rule '{rule}'")]
    UnknownRule { rule: String },

    #[error("rule '{rule}' cannot be used on the {side} side of protocol '{protocol}'")]
    UnsupportedRule {
        protocol: String,
        rule: String,
        side: &'static str,
    },

    #[error("protocol '{protocol}' cannot be used as a {side}")]
    UnsupportedProtocol {
        protocol: String,
        side: &'static str,
    },

    #[error("{protocol} event is missing required event_data: {field}")]
    MissingEventData {
        protocol: String,
        field: &'static str,
    },

    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("template error: {reason}")]
    Template { reason: String },

    #[error("script error: {0}")]
    Script(#[from] crate::script::ScriptError),

    #[error("diagram encoding error: {reason}")]
    Diagram { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Returns whether this error comes from a malformed machine definition.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoreError::MissingInitialState { .. }
                | CoreError::MultipleInitialStates { .. }
                | CoreError::DuplicateState { .. }
                | CoreError::UnknownTarget { .. }
                | CoreError::UnknownProtocol { .. }
                | CoreError::UnknownRule { .. }
                | CoreError::UnsupportedRule { .. }
                | CoreError::UnsupportedProtocol { .. }
                | CoreError::MissingEventData { .. }
                | CoreError::InvalidDefinition { .. }
        )
    }

    /// Returns a stable error code suitable for logs and reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::MissingInitialState { .. } => "MISSING_INITIAL_STATE",
            CoreError::MultipleInitialStates { .. } => "MULTIPLE_INITIAL_STATES",
            CoreError::DuplicateState { .. } => "DUPLICATE_STATE",
            CoreError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            CoreError::UnknownProtocol { .. } => "UNKNOWN_PROTOCOL",
            CoreError::UnknownRule { .. } => "UNKNOWN_RULE",
            CoreError::UnsupportedRule { .. } => "UNSUPPORTED_RULE",
            CoreError::UnsupportedProtocol { .. } => "UNSUPPORTED_PROTOCOL",
            CoreError::MissingEventData { .. } => "MISSING_EVENT_DATA",
            CoreError::InvalidDefinition { .. } => "BAD_DEFINITION",
            CoreError::Template { .. } => "TEMPLATE_ERROR",
            CoreError::Script(_) => "SCRIPT_ERROR",
            CoreError::Diagram { .. } => "DIAGRAM_ERROR",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Json(_) => "BAD_DEFINITION",
            CoreError::Yaml(_) => "BAD_DEFINITION",
        }
    }
}
