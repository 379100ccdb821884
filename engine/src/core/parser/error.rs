use thiserror::Error;

/// Supported command shapes, quoted in malformed-input errors.
pub const SUPPORTED_FORMATS: &str = "supported formats:\n\
  - >>prompt_id key=\"value\"\n\
  - {\"command\": \">>prompt_id\", \"args\": {\"key\": \"value\"}}\n\
  - >>step_one --> >>step_two :: \"criteria\"";

/// Typed failures produced by the command parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("unknown prompt '{id}'{}. Use the `prompts` listing to see available prompt ids.", suggestion_suffix(.suggestion))]
    UnknownPrompt {
        id: String,
        suggestion: Option<String>,
    },

    #[error("malformed command envelope: {detail}\n{SUPPORTED_FORMATS}")]
    MalformedEnvelope { detail: String },

    #[error("cannot determine command format for '{fragment}'\n{SUPPORTED_FORMATS}")]
    AmbiguousFormat { fragment: String },

    #[error("invalid arguments for '{prompt_id}': {detail}")]
    InvalidArguments { prompt_id: String, detail: String },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '>>{s}'?)"),
        None => String::new(),
    }
}
