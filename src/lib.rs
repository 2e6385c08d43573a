//! Harmonium: byte-level BPE tokenization and the Harmony conversation
//! wire format.
//!
//! A conversation of structured messages (roles, channels, recipients,
//! content-type constraints, heterogeneous bodies) translates losslessly to
//! and from a flat stream of token ids, and a growing prefix of such a
//! stream parses incrementally, one token at a time.
//!
//! The two halves:
//!
//! - [`core`]: the tokenizer — BPE over an ordinary vocabulary plus an
//!   atomic special-token alphabet, with a regex pre-tokenizer running in a
//!   thread-slot fast path.
//! - The codec — [`HarmonyEncoding`] renders [`Conversation`]s to tokens
//!   and parses completions back; [`StreamableParser`] consumes decoder
//!   output token by token and exposes the partially parsed message after
//!   every step.
//!
//! ```no_run
//! use harmonium::{
//!     load_harmony_encoding, HarmonyEncodingName, Conversation, Message, Role, TextContent,
//! };
//!
//! # fn main() -> Result<(), harmonium::HarmonyError> {
//! let encoding = load_harmony_encoding(HarmonyEncodingName::HarmonyGptOss)?;
//! let convo = Conversation::from_messages([Message::from_role_and_content(
//!     Role::User,
//!     TextContent::new("What is 2 + 2?"),
//! )]);
//! let tokens = encoding.render_conversation_for_completion(&convo, Role::Assistant, None)?;
//! # let _ = tokens;
//! # Ok(())
//! # }
//! ```
//!
//! A fully constructed encoding is immutable and shareable across threads;
//! a [`StreamableParser`] is a single-stream mutable session.

pub mod chat;
pub mod core;
pub mod encoding;
pub mod error;
pub mod parser;
pub mod registry;

pub use chat::{
    Author, ChannelConfig, Content, Conversation, DeveloperContent, Message, ReasoningEffort,
    Role, SystemContent, TextContent, ToolDescription, ToolNamespaceConfig,
};
pub use core::{Rank, Tokenizer, TokenizerError};
pub use encoding::{
    FormattingToken, HarmonyEncoding, RenderConversationConfig, RenderOptions,
};
pub use error::HarmonyError;
pub use parser::{ParsedHeader, StreamState, StreamableParser};
pub use registry::{load_harmony_encoding, HarmonyEncodingName};
