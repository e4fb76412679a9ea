//! Agency error types.

use didbot_core::ScriptError;
use thiserror::Error;

/// Agency errors.
#[derive(Debug, Error)]
pub enum AgencyError {
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("machine '{0}' uses LUA rules but scripts are disabled")]
    ScriptsDisabled(String),

    #[error("multiplexer shutting down")]
    ShuttingDown,
}
