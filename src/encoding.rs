//! Rendering and batch parsing of the Harmony wire format.
//!
//! A [`HarmonyEncoding`] pairs an immutable tokenizer with the grammar's
//! formatting tokens. Message layout:
//!
//! ```text
//! <|start|><role>[<|channel|>CHANNEL][ to=RECIPIENT][<|constrain|>TYPE]<|message|>BODY<|end|>
//! ```
//!
//! where `<role>` is a role marker special token, or for tool messages the
//! tool author's name as ordinary text. The rendered byte sequence for a
//! fixed input is part of the public contract; everything here is
//! deterministic, including tool-namespace ordering and the TypeScript-ish
//! schema rendering.

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::chat::{
    Content, Conversation, DeveloperContent, Message, Role, SystemContent, ToolNamespaceConfig,
};
use crate::core::{Rank, Tokenizer};
use crate::error::{HarmonyError, Result};
use crate::parser::StreamableParser;

/// Grammar-level tokens, mapped to concrete special-token ranks at
/// encoding construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormattingToken {
    Start,
    Message,
    EndMessage,
    EndMessageDoneSampling,
    EndMessageAssistantToTool,
    Channel,
    ConstrainedFormat,
    RoleSystem,
    RoleUser,
    RoleAssistant,
    RoleDeveloper,
    RoleTool,
}

impl FormattingToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormattingToken::Start => "<|start|>",
            FormattingToken::Message => "<|message|>",
            FormattingToken::EndMessage => "<|end|>",
            FormattingToken::EndMessageDoneSampling => "<|return|>",
            FormattingToken::EndMessageAssistantToTool => "<|call|>",
            FormattingToken::Channel => "<|channel|>",
            FormattingToken::ConstrainedFormat => "<|constrain|>",
            FormattingToken::RoleSystem => "<|system|>",
            FormattingToken::RoleUser => "<|user|>",
            FormattingToken::RoleAssistant => "<|assistant|>",
            FormattingToken::RoleDeveloper => "<|developer|>",
            FormattingToken::RoleTool => "<|tool|>",
        }
    }

    pub fn for_role(role: Role) -> Self {
        match role {
            Role::System => FormattingToken::RoleSystem,
            Role::User => FormattingToken::RoleUser,
            Role::Assistant => FormattingToken::RoleAssistant,
            Role::Developer => FormattingToken::RoleDeveloper,
            Role::Tool => FormattingToken::RoleTool,
        }
    }

    const ALL: [FormattingToken; 12] = [
        FormattingToken::Start,
        FormattingToken::Message,
        FormattingToken::EndMessage,
        FormattingToken::EndMessageDoneSampling,
        FormattingToken::EndMessageAssistantToTool,
        FormattingToken::Channel,
        FormattingToken::ConstrainedFormat,
        FormattingToken::RoleSystem,
        FormattingToken::RoleUser,
        FormattingToken::RoleAssistant,
        FormattingToken::RoleDeveloper,
        FormattingToken::RoleTool,
    ];
}

impl std::fmt::Display for FormattingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation-level rendering switches.
#[derive(Clone, Copy, Debug)]
pub struct RenderConversationConfig {
    /// Drop assistant `analysis` messages that precede the last user
    /// message. Tool-call messages are never dropped.
    pub auto_drop_analysis: bool,
}

impl Default for RenderConversationConfig {
    fn default() -> Self {
        Self {
            auto_drop_analysis: true,
        }
    }
}

/// Message-level rendering switches.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenderOptions {
    /// Whether any developer message in the conversation carries
    /// function-calling tools; system channel headers mention routing when
    /// it does.
    pub conversation_has_function_tools: bool,
}

/// The Harmony codec over a shared tokenizer.
#[derive(Clone)]
pub struct HarmonyEncoding {
    name: String,
    tokenizer: Arc<Tokenizer>,
    formatting_ranks: FxHashMap<FormattingToken, Rank>,
}

impl std::fmt::Debug for HarmonyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarmonyEncoding")
            .field("name", &self.name)
            .finish()
    }
}

impl HarmonyEncoding {
    /// Pair a tokenizer with the Harmony grammar. Every formatting token
    /// must exist in the tokenizer's special vocabulary.
    pub fn new(name: impl Into<String>, tokenizer: Arc<Tokenizer>) -> Result<Self> {
        let mut formatting_ranks = FxHashMap::default();
        for token in FormattingToken::ALL {
            let rank = tokenizer.special_token_rank(token.as_str()).ok_or_else(|| {
                HarmonyError::Internal(format!(
                    "formatting token {token} is not a special token of the tokenizer"
                ))
            })?;
            formatting_ranks.insert(token, rank);
        }
        Ok(Self {
            name: name.into(),
            tokenizer,
            formatting_ranks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Rank of a grammar token.
    pub fn formatting_token(&self, token: FormattingToken) -> Rank {
        // Construction resolved every variant; the map is total.
        self.formatting_ranks.get(&token).copied().unwrap_or(Rank::MAX)
    }

    /// Role for a role-marker rank, if it is one.
    pub(crate) fn role_for_token(&self, rank: Rank) -> Option<Role> {
        for (role, marker) in [
            (Role::System, FormattingToken::RoleSystem),
            (Role::User, FormattingToken::RoleUser),
            (Role::Assistant, FormattingToken::RoleAssistant),
            (Role::Developer, FormattingToken::RoleDeveloper),
            (Role::Tool, FormattingToken::RoleTool),
        ] {
            if self.formatting_token(marker) == rank {
                return Some(role);
            }
        }
        None
    }

    /// Ranks that end a message: `<|end|>`, `<|return|>`, `<|call|>`.
    pub fn stop_tokens(&self) -> HashSet<Rank> {
        [
            FormattingToken::EndMessage,
            FormattingToken::EndMessageDoneSampling,
            FormattingToken::EndMessageAssistantToTool,
        ]
        .into_iter()
        .map(|t| self.formatting_token(t))
        .collect()
    }

    /// Ranks at which an assistant turn is over: `<|return|>`, `<|call|>`.
    pub fn stop_tokens_for_assistant_actions(&self) -> HashSet<Rank> {
        [
            FormattingToken::EndMessageDoneSampling,
            FormattingToken::EndMessageAssistantToTool,
        ]
        .into_iter()
        .map(|t| self.formatting_token(t))
        .collect()
    }

    fn push_formatting_token(&self, token: FormattingToken, into: &mut Vec<Rank>) {
        into.push(self.formatting_token(token));
    }

    fn push_text(&self, text: &str, into: &mut Vec<Rank>) {
        into.extend(self.tokenizer.encode_ordinary(text));
    }

    /// Render one message with an explicit terminator.
    fn render_message_into(
        &self,
        message: &Message,
        into: &mut Vec<Rank>,
        options: &RenderOptions,
        terminator: FormattingToken,
    ) -> Result<()> {
        self.push_formatting_token(FormattingToken::Start, into);

        if message.author.role == Role::Tool {
            let name = message.author.name.as_deref().ok_or_else(|| {
                HarmonyError::Internal("tool message author has no name".to_string())
            })?;
            self.push_text(name, into);
        } else {
            self.push_formatting_token(FormattingToken::for_role(message.author.role), into);
            if let Some(name) = &message.author.name {
                self.push_text(&format!(":{name}"), into);
            }
        }

        if let Some(channel) = &message.channel {
            self.push_formatting_token(FormattingToken::Channel, into);
            self.push_text(channel, into);
        }
        if let Some(recipient) = &message.recipient {
            self.push_text(&format!(" to={recipient}"), into);
        }
        if let Some(content_type) = &message.content_type {
            self.push_formatting_token(FormattingToken::ConstrainedFormat, into);
            self.push_text(content_type, into);
        }

        self.push_formatting_token(FormattingToken::Message, into);
        for content in &message.content {
            match content {
                Content::Text(text) => self.push_text(&text.text, into),
                Content::System(sys) => {
                    if message.author.role != Role::System {
                        return Err(HarmonyError::Internal(format!(
                            "system content in a {} message",
                            message.author.role
                        )));
                    }
                    self.push_text(&render_system_content(sys, options), into);
                }
                Content::Developer(dev) => {
                    if message.author.role != Role::Developer {
                        return Err(HarmonyError::Internal(format!(
                            "developer content in a {} message",
                            message.author.role
                        )));
                    }
                    self.push_text(&render_developer_content(dev), into);
                }
            }
        }

        self.push_formatting_token(terminator, into);
        Ok(())
    }

    /// Render a single message, terminated with `<|end|>`.
    pub fn render(&self, message: &Message, options: Option<&RenderOptions>) -> Result<Vec<Rank>> {
        let mut out = Vec::new();
        self.render_into(message, &mut out, options)?;
        Ok(out)
    }

    /// Render a single message into an existing buffer.
    pub fn render_into(
        &self,
        message: &Message,
        into: &mut Vec<Rank>,
        options: Option<&RenderOptions>,
    ) -> Result<()> {
        let default_options = RenderOptions::default();
        self.render_message_into(
            message,
            into,
            options.unwrap_or(&default_options),
            FormattingToken::EndMessage,
        )
    }

    /// Messages surviving `auto_drop_analysis`, with the render options the
    /// conversation implies.
    fn plan_conversation<'a>(
        &self,
        conversation: &'a Conversation,
        config: Option<&RenderConversationConfig>,
    ) -> (Vec<&'a Message>, RenderOptions) {
        let default_config = RenderConversationConfig::default();
        let config = config.unwrap_or(&default_config);

        let options = RenderOptions {
            conversation_has_function_tools: conversation.messages.iter().any(|m| {
                m.content.iter().any(|c| match c {
                    Content::Developer(dev) => {
                        dev.function_tools().is_some_and(|ns| !ns.tools.is_empty())
                    }
                    _ => false,
                })
            }),
        };

        let last_user_idx = conversation
            .messages
            .iter()
            .rposition(|m| m.author.role == Role::User);

        let droppable = |idx: usize, message: &Message| {
            config.auto_drop_analysis
                && last_user_idx.is_some_and(|last| idx < last)
                && message.author.role == Role::Assistant
                && message.channel.as_deref() == Some("analysis")
                && message.recipient.is_none()
        };

        let kept = conversation
            .messages
            .iter()
            .enumerate()
            .filter(|&(idx, m)| !droppable(idx, m))
            .map(|(_, m)| m)
            .collect();
        (kept, options)
    }

    /// Render a conversation; every message ends with `<|end|>`, so the
    /// output re-renders identically after a parse round trip.
    pub fn render_conversation(
        &self,
        conversation: &Conversation,
        config: Option<&RenderConversationConfig>,
    ) -> Result<Vec<Rank>> {
        let mut out = Vec::new();
        self.render_conversation_into(conversation, &mut out, config)?;
        Ok(out)
    }

    pub fn render_conversation_into(
        &self,
        conversation: &Conversation,
        into: &mut Vec<Rank>,
        config: Option<&RenderConversationConfig>,
    ) -> Result<()> {
        let (messages, options) = self.plan_conversation(conversation, config);
        for message in messages {
            self.render_message_into(message, into, &options, FormattingToken::EndMessage)?;
        }
        Ok(())
    }

    /// Render a conversation and open the next message's header, leaving
    /// the stream ready for the model to continue.
    pub fn render_conversation_for_completion(
        &self,
        conversation: &Conversation,
        next_turn_role: Role,
        config: Option<&RenderConversationConfig>,
    ) -> Result<Vec<Rank>> {
        let mut out = Vec::new();
        self.render_conversation_into(conversation, &mut out, config)?;
        self.push_formatting_token(FormattingToken::Start, &mut out);
        self.push_formatting_token(FormattingToken::for_role(next_turn_role), &mut out);
        Ok(out)
    }

    /// Render a conversation with stop-teaching terminators: `<|call|>` for
    /// assistant tool calls, `<|return|>` for assistant `final` messages,
    /// `<|end|>` otherwise.
    pub fn render_conversation_for_training(
        &self,
        conversation: &Conversation,
        config: Option<&RenderConversationConfig>,
    ) -> Result<Vec<Rank>> {
        let (messages, options) = self.plan_conversation(conversation, config);
        let mut out = Vec::new();
        for message in messages {
            let terminator = if message.author.role == Role::Assistant {
                if message.recipient.is_some() {
                    FormattingToken::EndMessageAssistantToTool
                } else if message.channel.as_deref() == Some("final") {
                    FormattingToken::EndMessageDoneSampling
                } else {
                    FormattingToken::EndMessage
                }
            } else {
                FormattingToken::EndMessage
            };
            self.render_message_into(message, &mut out, &options, terminator)?;
        }
        Ok(out)
    }

    /// Parse a completion token stream back into messages. A `role` hint
    /// fills in the first message's role when its header does not state one
    /// (the common case for model completions).
    pub fn parse_messages_from_completion_tokens<I>(
        &self,
        tokens: I,
        role: Option<Role>,
    ) -> Result<Vec<Message>>
    where
        I: IntoIterator<Item = Rank>,
    {
        let mut parser = StreamableParser::new(self.clone(), role);
        for token in tokens {
            parser.process(token)?;
        }
        parser.process_eos()?;
        Ok(parser.into_messages())
    }
}

/// Deterministic plain-text body of a system message.
fn render_system_content(sys: &SystemContent, options: &RenderOptions) -> String {
    let mut out = String::new();
    if let Some(identity) = &sys.model_identity {
        out.push_str(&format!("Model: {identity}\n"));
    }
    if let Some(effort) = sys.reasoning_effort {
        out.push_str(&format!("Reasoning effort: {}\n", effort.as_str()));
    }
    if let Some(cutoff) = &sys.knowledge_cutoff {
        out.push_str(&format!("Knowledge cutoff: {cutoff}\n"));
    }
    if let Some(date) = &sys.conversation_start_date {
        out.push_str(&format!("Current date: {date}\n"));
    }
    if let Some(tools) = &sys.tools {
        if !tools.is_empty() {
            out.push_str("\nAvailable tools:\n");
            out.push_str(&template_tools_section(tools));
        }
    }
    if let Some(channels) = &sys.channel_config {
        if channels.channel_required && !channels.valid_channels.is_empty() {
            out.push_str(&format!(
                "\nRequired channels: {}\n",
                channels.valid_channels.join(", ")
            ));
            if options.conversation_has_function_tools {
                out.push_str("Calls to functions must go to the commentary channel.\n");
            }
        }
    }
    out
}

/// Deterministic plain-text body of a developer message.
fn render_developer_content(dev: &DeveloperContent) -> String {
    let mut out = String::new();
    if let Some(instructions) = &dev.instructions {
        out.push_str(instructions);
        out.push('\n');
    }
    if let Some(tools) = &dev.tools {
        if !tools.is_empty() {
            out.push_str("\nDeveloper tools:\n");
            out.push_str(&template_tools_section(tools));
        }
    }
    out
}

/// Tools block shared by system and developer bodies. Namespace order is
/// the map's key order.
fn template_tools_section(tools: &BTreeMap<String, ToolNamespaceConfig>) -> String {
    let mut out = String::new();
    for ns in tools.values() {
        out.push_str(&format!("# {}\n", ns.name));
        if let Some(description) = &ns.description {
            out.push_str(description);
            out.push('\n');
        }
        for tool in &ns.tools {
            out.push_str(&format!("## {}\n", tool.name));
            out.push_str(&tool.description);
            out.push('\n');
            if let Some(parameters) = &tool.parameters {
                out.push_str(&format!(
                    "Parameters: {}\n",
                    json_schema_to_typescript(parameters, "")
                ));
            }
            out.push('\n');
        }
    }
    out
}

/// TypeScript-ish rendering of a JSON-schema-like parameter object.
///
/// Handles the schema subset tool descriptions use: `type`, `properties`,
/// `required`, `default`, `enum`, and nested `items`. The exact output is
/// frozen by golden tests.
pub fn json_schema_to_typescript(schema: &serde_json::Value, indent: &str) -> String {
    // A type given as a list is a union, with integer folded into number.
    if let Some(types) = schema.get("type").and_then(|t| t.as_array()) {
        let names: Vec<&str> = types
            .iter()
            .filter_map(|t| t.as_str())
            .map(|t| if t == "integer" { "number" } else { t })
            .collect();
        if !names.is_empty() {
            return names.join(" | ");
        }
    }

    match schema.get("type").and_then(|t| t.as_str()) {
        Some("object") => {
            let mut out = String::from("{\n");
            let inner = format!("{indent}  ");
            let required: HashSet<&str> = schema
                .get("required")
                .and_then(|r| r.as_array())
                .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
                for (key, value) in properties {
                    let marker = if required.contains(key.as_str()) { "" } else { "?" };
                    let rendered = json_schema_to_typescript(value, &inner);
                    out.push_str(&format!("{inner}{key}{marker}: {rendered},"));
                    if let Some(default) = value.get("default") {
                        let is_enum = value.get("enum").is_some();
                        match default.as_str() {
                            Some(text) if !is_enum => {
                                out.push_str(&format!(" // default: \"{text}\""));
                            }
                            Some(text) => out.push_str(&format!(" // default: {text}")),
                            None => out.push_str(&format!(" // default: {default}")),
                        }
                    }
                    out.push('\n');
                }
            }
            out.push_str(&format!("{indent}}}"));
            out
        }
        Some("string") => {
            if let Some(values) = schema.get("enum").and_then(|e| e.as_array()) {
                let variants: Vec<String> = values
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| format!("\"{s}\"")))
                    .collect();
                if !variants.is_empty() {
                    return variants.join(" | ");
                }
            }
            "string".to_string()
        }
        Some("number") | Some("integer") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("array") => match schema.get("items") {
            Some(items) => format!("{}[]", json_schema_to_typescript(items, indent)),
            None => "any[]".to_string(),
        },
        _ => "any".to_string(),
    }
}
