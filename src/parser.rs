//! Incremental parsing of Harmony token streams.
//!
//! [`StreamableParser`] consumes decoder output one token at a time and
//! keeps a progressive view of the in-flight message: role, channel,
//! recipient, content type, accumulated content, and the most recent
//! content delta. It never looks ahead; every `process` call is O(1) plus
//! the cost of decoding one token's bytes.
//!
//! The parser is a mutable session and deliberately not shareable;
//! independent streams get independent parsers over the same (shared)
//! encoding.

use serde::Serialize;
use std::collections::HashSet;

use crate::chat::{Author, Content, Message, Role, TextContent};
use crate::core::{Rank, TokenizerError, Utf8Assembler};
use crate::encoding::{FormattingToken, HarmonyEncoding};
use crate::error::{HarmonyError, Result};

/// Parser position in the message grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    ExpectStart,
    Header,
    Content,
}

/// Which header sub-buffer ordinary tokens currently land in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderField {
    Author,
    Channel,
    ContentType,
}

/// A fully parsed message header.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParsedHeader {
    pub author: Author,
    pub recipient: Option<String>,
    pub channel: Option<String>,
    pub content_type: Option<String>,
}

pub struct StreamableParser {
    encoding: HarmonyEncoding,
    stop_tokens: HashSet<Rank>,
    /// Role hint for the first message, consumed at its header finalize.
    next_role: Option<Role>,
    tokens: Vec<Rank>,
    messages: Vec<Message>,
    state: StreamState,
    // Header under construction.
    header_role: Option<Role>,
    header_started: bool,
    active_field: HeaderField,
    author_buf: Vec<u8>,
    channel_buf: Vec<u8>,
    content_type_buf: Vec<u8>,
    // Current message once the header is finalized.
    header: Option<ParsedHeader>,
    assembler: Utf8Assembler,
    current_content: String,
    last_content_delta: Option<String>,
}

impl StreamableParser {
    /// Create a parser. With a role hint the stream is treated as starting
    /// inside a message header (the shape of a completion that follows
    /// `render_conversation_for_completion`); without one the parser waits
    /// for `<|start|>`.
    pub fn new(encoding: HarmonyEncoding, role: Option<Role>) -> Self {
        let stop_tokens = encoding.stop_tokens();
        let state = if role.is_some() {
            StreamState::Header
        } else {
            StreamState::ExpectStart
        };
        Self {
            encoding,
            stop_tokens,
            next_role: role,
            tokens: Vec::new(),
            messages: Vec::new(),
            state,
            header_role: None,
            header_started: false,
            active_field: HeaderField::Author,
            author_buf: Vec::new(),
            channel_buf: Vec::new(),
            content_type_buf: Vec::new(),
            header: None,
            assembler: Utf8Assembler::new(),
            current_content: String::new(),
            last_content_delta: None,
        }
    }

    /// Consume one token.
    pub fn process(&mut self, token: Rank) -> Result<()> {
        self.tokens.push(token);
        self.last_content_delta = None;
        match self.state {
            StreamState::ExpectStart => {
                if token == self.encoding.formatting_token(FormattingToken::Start) {
                    self.enter_header();
                }
                // Anything else is recorded and has no message effect.
                Ok(())
            }
            StreamState::Header => self.process_header_token(token),
            StreamState::Content => self.process_content_token(token),
        }
    }

    /// Signal end of stream. Finalizes an in-flight message in `Content`
    /// state; elsewhere a no-op.
    pub fn process_eos(&mut self) -> Result<()> {
        if self.state == StreamState::Content {
            self.finalize_message()?;
        }
        Ok(())
    }

    fn enter_header(&mut self) {
        self.state = StreamState::Header;
        self.header_role = None;
        self.header_started = false;
        self.active_field = HeaderField::Author;
        self.author_buf.clear();
        self.channel_buf.clear();
        self.content_type_buf.clear();
    }

    /// Drop all in-flight state and wait for the next `<|start|>`.
    fn reset_to_expect_start(&mut self) {
        self.state = StreamState::ExpectStart;
        self.header_role = None;
        self.header_started = false;
        self.active_field = HeaderField::Author;
        self.author_buf.clear();
        self.channel_buf.clear();
        self.content_type_buf.clear();
        self.header = None;
        self.assembler.clear();
        self.current_content.clear();
        self.last_content_delta = None;
    }

    fn malformed(&mut self, reason: impl Into<String>) -> HarmonyError {
        // Recover so the caller may keep feeding tokens.
        self.reset_to_expect_start();
        HarmonyError::MalformedHeader(reason.into())
    }

    fn process_header_token(&mut self, token: Rank) -> Result<()> {
        if token == self.encoding.formatting_token(FormattingToken::Start) {
            if self.header_started {
                return Err(self.malformed("unexpected <|start|> inside a message header"));
            }
            // A fresh <|start|> before any header content: restart cleanly.
            self.enter_header();
            return Ok(());
        }
        if token == self.encoding.formatting_token(FormattingToken::Message) {
            return self.finalize_header();
        }
        if token == self.encoding.formatting_token(FormattingToken::Channel) {
            self.active_field = HeaderField::Channel;
            self.header_started = true;
            return Ok(());
        }
        if token == self.encoding.formatting_token(FormattingToken::ConstrainedFormat) {
            self.active_field = HeaderField::ContentType;
            self.header_started = true;
            return Ok(());
        }
        if let Some(role) = self.encoding.role_for_token(token) {
            if self.header_role.is_some() {
                return Err(self.malformed("second role marker in a message header"));
            }
            self.header_role = Some(role);
            self.header_started = true;
            return Ok(());
        }
        if self.encoding.tokenizer().is_special_token(token) {
            let text = self
                .encoding
                .tokenizer()
                .decode_utf8(&[token])
                .unwrap_or_else(|_| format!("rank {token}"));
            return Err(self.malformed(format!("unexpected {text} in a message header")));
        }
        let bytes = self
            .encoding
            .tokenizer()
            .decode_bytes(&[token])
            .map_err(HarmonyError::Tokenizer)?;
        let buf = match self.active_field {
            HeaderField::Author => &mut self.author_buf,
            HeaderField::Channel => &mut self.channel_buf,
            HeaderField::ContentType => &mut self.content_type_buf,
        };
        buf.extend_from_slice(&bytes);
        self.header_started = true;
        Ok(())
    }

    fn finalize_header(&mut self) -> Result<()> {
        let decoded = (
            String::from_utf8(std::mem::take(&mut self.author_buf)),
            String::from_utf8(std::mem::take(&mut self.channel_buf)),
            String::from_utf8(std::mem::take(&mut self.content_type_buf)),
        );
        let (Ok(author_text), Ok(channel_text), Ok(content_type_text)) = decoded else {
            self.reset_to_expect_start();
            return Err(HarmonyError::Tokenizer(TokenizerError::InvalidUtf8));
        };

        // The recipient is a trailing " to=NAME" run in whichever ordinary
        // text preceded <|message|> last: the channel text when a channel
        // was given, the author text otherwise.
        let mut recipient = None;
        let mut author_text = author_text;
        let mut channel_text = channel_text;
        if let Some(idx) = channel_text.rfind(" to=") {
            recipient = Some(channel_text[idx + 4..].to_string());
            channel_text.truncate(idx);
        } else if let Some(idx) = author_text.rfind(" to=") {
            recipient = Some(author_text[idx + 4..].to_string());
            author_text.truncate(idx);
        }

        let hint = self.next_role.take();
        let author = if let Some(role) = self.header_role {
            let name = match author_text.strip_prefix(':') {
                Some(stripped) if !stripped.is_empty() => Some(stripped.to_string()),
                _ if !author_text.is_empty() => Some(author_text.clone()),
                _ => None,
            };
            Author { role, name }
        } else if !author_text.is_empty() {
            // Ordinary text in the role position identifies a tool author.
            Author::new(Role::Tool, author_text.clone())
        } else if let Some(role) = hint {
            Author::from_role(role)
        } else {
            return Err(self.malformed("<|message|> before any role was set"));
        };

        self.header = Some(ParsedHeader {
            author,
            recipient,
            channel: (!channel_text.is_empty()).then_some(channel_text),
            content_type: (!content_type_text.is_empty()).then_some(content_type_text),
        });
        self.state = StreamState::Content;
        self.assembler.clear();
        self.current_content.clear();
        self.last_content_delta = None;
        Ok(())
    }

    fn process_content_token(&mut self, token: Rank) -> Result<()> {
        if self.stop_tokens.contains(&token) {
            return self.finalize_message();
        }
        let bytes = self
            .encoding
            .tokenizer()
            .decode_bytes(&[token])
            .map_err(HarmonyError::Tokenizer)?;
        if let Some(delta) = self.assembler.push(&bytes) {
            self.current_content.push_str(&delta);
            self.last_content_delta = Some(delta);
        }
        Ok(())
    }

    fn finalize_message(&mut self) -> Result<()> {
        if self.assembler.has_pending() {
            self.reset_to_expect_start();
            return Err(HarmonyError::Tokenizer(TokenizerError::InvalidUtf8));
        }
        let Some(header) = self.header.take() else {
            self.reset_to_expect_start();
            return Err(HarmonyError::Internal(
                "content state without a finalized header".to_string(),
            ));
        };
        let message = Message {
            author: header.author,
            content: vec![Content::Text(TextContent::new(std::mem::take(
                &mut self.current_content,
            )))],
            channel: header.channel,
            recipient: header.recipient,
            content_type: header.content_type,
        };
        self.messages.push(message);
        self.reset_to_expect_start();
        Ok(())
    }

    /// Role of the message being parsed, once known.
    pub fn current_role(&self) -> Option<Role> {
        match self.state {
            StreamState::Content => self.header.as_ref().map(|h| h.author.role),
            StreamState::Header => self.header_role.or(self.next_role),
            StreamState::ExpectStart => None,
        }
    }

    /// Channel of the message being parsed, once the header is complete.
    pub fn current_channel(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.channel.as_deref())
    }

    /// Recipient of the message being parsed, once the header is complete.
    pub fn current_recipient(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.recipient.as_deref())
    }

    /// Content type of the message being parsed, once the header is
    /// complete.
    pub fn current_content_type(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.content_type.as_deref())
    }

    /// Complete code points of the current message's content so far.
    pub fn current_content(&self) -> &str {
        &self.current_content
    }

    /// Text contributed by the most recent token, if it completed any code
    /// points.
    pub fn last_content_delta(&self) -> Option<&str> {
        self.last_content_delta.as_deref()
    }

    /// Messages completed so far.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Consume the parser, returning the completed messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Every token fed so far.
    pub fn tokens(&self) -> &[Rank] {
        &self.tokens
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// JSON snapshot of the parser, for host-language interop.
    pub fn state_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            state: StreamState,
            tokens: &'a [Rank],
            messages: &'a [Message],
            #[serde(skip_serializing_if = "Option::is_none")]
            current_role: Option<Role>,
            #[serde(skip_serializing_if = "Option::is_none")]
            current_channel: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            current_recipient: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            current_content_type: Option<&'a str>,
            current_content: &'a str,
        }
        let snapshot = Snapshot {
            state: self.state,
            tokens: &self.tokens,
            messages: &self.messages,
            current_role: self.current_role(),
            current_channel: self.current_channel(),
            current_recipient: self.current_recipient(),
            current_content_type: self.current_content_type(),
            current_content: self.current_content(),
        };
        serde_json::to_string(&snapshot)
            .map_err(|e| HarmonyError::Internal(format!("state serialization failed: {e}")))
    }
}
