//! # didbot-agency
//!
//! Agency side of didbot.
//!
//! This crate provides:
//! - The outbound protocol client interface
//! - Per-connection conversations driving a machine instance
//! - The notification multiplexer
//! - Configuration loading

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod multiplexer;

pub use client::{Call, ClientError, ProtocolClient, ProtocolId, RecordingClient};
pub use config::{Config, ConfigError, ConsoleConfig, MachineConfig, MultiplexerConfig};
pub use conversation::Conversation;
pub use error::AgencyError;
pub use multiplexer::{
    ConversationInfo, Multiplexer, MultiplexerHandle, MultiplexerStats, StatsSnapshot,
};
