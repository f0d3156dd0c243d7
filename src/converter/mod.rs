//! Anthropic Messages ⇄ OpenAI Chat Completions conversion
//!
//! Both directions are pure functions over complete values: no I/O, no shared
//! state. Streaming responses are handled by [`crate::transcoder`], which
//! reuses [`map_finish_reason`] so both paths agree on stop reasons.

mod request;
mod response;

pub use request::to_upstream;
pub use response::{map_finish_reason, to_client};
pub(crate) use response::parse_arguments;

use thiserror::Error;

/// Content the converter cannot represent in the target format
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("tool call '{id}' has malformed arguments: {source}")]
    MalformedToolArguments {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{block} block is not allowed in a {role} message")]
    MisplacedBlock { block: &'static str, role: &'static str },

    #[error("tool_result references unknown tool_use id '{0}'")]
    UnknownToolUse(String),

    #[error("upstream response contained no choices")]
    EmptyResponse,

    #[error("failed to encode tool input for '{id}': {source}")]
    InputEncoding {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}
