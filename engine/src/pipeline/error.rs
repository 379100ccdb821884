//! Typed planning and session failures, and their conversion to responses.

use thiserror::Error;

use crate::core::parser::ParseError;
use crate::pipeline::request::RequestError;
use crate::pipeline::response::ToolResponse;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("parsed command has neither a prompt nor steps")]
    EmptyPlan,

    #[error("step {step} references unknown prompt '{prompt_id}'")]
    UnknownStepPrompt { step: u32, prompt_id: String },

    #[error("unknown framework '@{id}'. Available: {available}")]
    UnknownFramework { id: String, available: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(
        "no chain found for '{reference}'. Use `chain-<name>#<run>`, `chain-<name>` or a session id, or send `command` to start a new chain"
    )]
    UnknownChain { reference: String },

    #[error("session state for step {step} is missing")]
    MissingStep { step: u32 },
}

/// Convert a stage failure into the response returned to the caller.
///
/// Typed caller errors keep their remediation text; anything else is
/// reported as an internal error with its context chain.
pub fn error_response(err: &anyhow::Error) -> ToolResponse {
    let typed = err
        .downcast_ref::<ParseError>()
        .map(ToString::to_string)
        .or_else(|| err.downcast_ref::<RequestError>().map(ToString::to_string))
        .or_else(|| err.downcast_ref::<PlanningError>().map(ToString::to_string))
        .or_else(|| err.downcast_ref::<SessionError>().map(ToString::to_string));
    match typed {
        Some(message) => ToolResponse::error(message),
        None => ToolResponse::error(format!("Internal error: {err:#}")),
    }
}
