//! # didbot-core
//!
//! Conversation state machine engine for didbot.
//!
//! This crate provides:
//! - Machine definition parsing and validation
//! - Trigger rules and send building
//! - Memory registers and template rendering
//! - Embedded Lua scripting
//! - Machine instance lifecycle
//! - PlantUML diagram export

pub mod definition;
pub mod diagram;
pub mod error;
pub mod machine;
pub mod memory;
pub mod notification;
pub mod script;
pub mod send;
pub mod template;
pub mod trigger;

pub use definition::{
    Event, EventData, MachineDefinition, MachineKind, ProtocolType, Rule, State, Transition,
};
pub use error::CoreError;
pub use machine::Machine;
pub use memory::Memory;
pub use notification::{
    BackendData, HookData, Notification, ProofValue, ProtocolStatus, Question, StatusState,
};
pub use script::{Evaluator, LuaEvaluator, ScriptError, Sentinel};
pub use send::{SendEvent, SendPayload};
