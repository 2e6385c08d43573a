//! Error taxonomy for the Harmony codec.

use thiserror::Error;

use crate::core::TokenizerError;

/// Everything the codec can fail with. Tokenizer-level failures (unknown
/// rank, ill-formed UTF-8, construction problems) arrive wrapped from
/// [`TokenizerError`]; the remaining variants belong to the conversation
/// layer and the JSON boundary.
#[derive(Error, Debug)]
pub enum HarmonyError {
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("unknown reasoning effort: {0}")]
    UnknownReasoningEffort(String),

    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    #[error("malformed message header: {0}")]
    MalformedHeader(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HarmonyError>;
