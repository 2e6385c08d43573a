//! Conversation domain model and its JSON boundary.
//!
//! The internal types are richer than the wire JSON: content bodies are a
//! tagged sum, roles and efforts are real enums. JSON is only spoken at
//! the system edge, where a message is `{role, name?, recipient?, channel?,
//! content_type?, content}` and `content` may be a bare string as shorthand
//! for a single text body.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::HarmonyError;

/// Role of a message author.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
    Developer,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Developer => "developer",
            Role::Tool => "tool",
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = HarmonyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "developer" => Ok(Role::Developer),
            "tool" => Ok(Role::Tool),
            other => Err(HarmonyError::UnknownRole(other.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Role::try_from(s.as_str()).map_err(D::Error::custom)
    }
}

/// Reasoning effort requested of the model in a system message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

impl TryFrom<&str> for ReasoningEffort {
    type Error = HarmonyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            other => Err(HarmonyError::UnknownReasoningEffort(other.to_string())),
        }
    }
}

impl Serialize for ReasoningEffort {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReasoningEffort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ReasoningEffort::try_from(s.as_str()).map_err(D::Error::custom)
    }
}

/// Message author: a role, plus a name that mostly matters for tool
/// messages (it carries the tool's qualified name, e.g.
/// `functions.get_weather`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl Author {
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            role,
            name: Some(name.into()),
        }
    }

    pub fn from_role(role: Role) -> Self {
        Self { role, name: None }
    }
}

/// Plain text body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

impl TextContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A callable tool: name, human description, and an optional
/// JSON-schema-like parameter object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parameters: Option<serde_json::Value>,
}

impl ToolDescription {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Option<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A named group of tools plus an optional namespace description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolNamespaceConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDescription>,
}

impl ToolNamespaceConfig {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        tools: Vec<ToolDescription>,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            tools,
        }
    }

    /// The canonical `browser` namespace: `search`, `open`, `find`.
    pub fn browser() -> Self {
        let tools = vec![
            ToolDescription::new(
                "search",
                "Searches for information related to `query` and displays `topn` results.",
                Some(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "topn": {"type": "number", "default": 10},
                        "source": {"type": "string"}
                    },
                    "required": ["query"]
                })),
            ),
            ToolDescription::new(
                "open",
                concat!(
                    "Opens the link `id` from the page indicated by `cursor` starting at line number `loc`, showing `num_lines` lines.\n",
                    "Valid link ids are displayed with the formatting: `【{id}†.*】`.\n",
                    "If `cursor` is not provided, the most recent page is implied.\n",
                    "If `id` is a string, it is treated as a fully qualified URL associated with `source`.\n",
                    "If `loc` is not provided, the viewport will be positioned at the beginning of the document or centered on the most relevant passage, if available.\n",
                    "Use this function without `id` to scroll to a new location of an opened page."
                ),
                Some(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "id": {"type": ["number", "string"], "default": -1},
                        "cursor": {"type": "number", "default": -1},
                        "loc": {"type": "number", "default": -1},
                        "num_lines": {"type": "number", "default": -1},
                        "view_source": {"type": "boolean", "default": false},
                        "source": {"type": "string"}
                    }
                })),
            ),
            ToolDescription::new(
                "find",
                "Finds exact matches of `pattern` in the current page, or the page given by `cursor`.",
                Some(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string"},
                        "cursor": {"type": "number", "default": -1}
                    },
                    "required": ["pattern"]
                })),
            ),
        ];
        ToolNamespaceConfig::new(
            "browser",
            Some(concat!(
                "Tool for browsing.\n",
                "The `cursor` appears in brackets before each browsing display: `[{cursor}]`.\n",
                "Cite information from the tool using the following format:\n",
                "`【{cursor}†L{line_start}(-L{line_end})?】`, for example: `【6†L9-L11】` or `【8†L3】`.\n",
                "Do not quote more than 10 words directly from the tool output.\n",
                "sources=web (default: web)"
            ).to_string()),
            tools,
        )
    }

    /// The canonical `python` namespace (stateful notebook, no tool list).
    pub fn python() -> Self {
        ToolNamespaceConfig::new(
            "python",
            Some(concat!(
                "Use this tool to execute Python code in your chain of thought. The code will not be shown to the user. This tool should be used for internal reasoning, but not for code that is intended to be visible to the user (e.g. when creating plots, tables, or files).\n",
                "\n",
                "When you send a message containing Python code to python, it will be executed in a stateful Jupyter notebook environment. python will respond with the output of the execution or time out after 120.0 seconds. The drive at '/mnt/data' can be used to save and persist user files. Internet access for this session is UNKNOWN. Depends on the cluster."
            ).to_string()),
            vec![],
        )
    }
}

/// Channel restrictions announced in a system message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub valid_channels: Vec<String>,
    pub channel_required: bool,
}

impl ChannelConfig {
    pub fn require_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            valid_channels: channels.into_iter().map(Into::into).collect(),
            channel_required: true,
        }
    }
}

/// System message body: model identity and conversation-level configuration.
///
/// Tool namespaces live in a `BTreeMap` so rendering order is a function of
/// the namespace names alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tools: Option<BTreeMap<String, ToolNamespaceConfig>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub knowledge_cutoff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_config: Option<ChannelConfig>,
}

impl SystemContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_identity(mut self, identity: impl Into<String>) -> Self {
        self.model_identity = Some(identity.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn with_tools(mut self, namespace: ToolNamespaceConfig) -> Self {
        self.tools
            .get_or_insert_with(BTreeMap::new)
            .insert(namespace.name.clone(), namespace);
        self
    }

    pub fn with_conversation_start_date(mut self, date: impl Into<String>) -> Self {
        self.conversation_start_date = Some(date.into());
        self
    }

    pub fn with_knowledge_cutoff(mut self, cutoff: impl Into<String>) -> Self {
        self.knowledge_cutoff = Some(cutoff.into());
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = Some(config);
        self
    }

    pub fn with_required_channels<I, S>(self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_channel_config(ChannelConfig::require_channels(channels))
    }

    pub fn with_browser_tool(self) -> Self {
        self.with_tools(ToolNamespaceConfig::browser())
    }

    pub fn with_python_tool(self) -> Self {
        self.with_tools(ToolNamespaceConfig::python())
    }
}

/// Developer message body: free-form instructions plus tool namespaces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeveloperContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tools: Option<BTreeMap<String, ToolNamespaceConfig>>,
}

impl DeveloperContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tools(mut self, namespace: ToolNamespaceConfig) -> Self {
        self.tools
            .get_or_insert_with(BTreeMap::new)
            .insert(namespace.name.clone(), namespace);
        self
    }

    /// Install function-calling tools under the conventional `functions`
    /// namespace.
    pub fn with_function_tools(self, tools: Vec<ToolDescription>) -> Self {
        self.with_tools(ToolNamespaceConfig::new("functions", None, tools))
    }

    /// The `functions` namespace, if any tools are installed there.
    pub fn function_tools(&self) -> Option<&ToolNamespaceConfig> {
        self.tools.as_ref().and_then(|t| t.get("functions"))
    }
}

/// Message body. Exactly three variants; the JSON `type` tag is
/// authoritative at the boundary.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text(TextContent),
    #[serde(rename = "system_content")]
    System(SystemContent),
    #[serde(rename = "developer_content")]
    Developer(DeveloperContent),
}

impl Content {
    /// The body's text, when it is a text body.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(t) => Some(&t.text),
            _ => None,
        }
    }
}

impl From<TextContent> for Content {
    fn from(value: TextContent) -> Self {
        Content::Text(value)
    }
}

impl From<SystemContent> for Content {
    fn from(value: SystemContent) -> Self {
        Content::System(value)
    }
}

impl From<DeveloperContent> for Content {
    fn from(value: DeveloperContent) -> Self {
        Content::Developer(value)
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| D::Error::missing_field("type"))?
            .to_string();
        match tag.as_str() {
            "text" => TextContent::deserialize(value)
                .map(Content::Text)
                .map_err(D::Error::custom),
            "system_content" => SystemContent::deserialize(value)
                .map(Content::System)
                .map_err(D::Error::custom),
            "developer_content" => DeveloperContent::deserialize(value)
                .map(Content::Developer)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(HarmonyError::UnknownContentType(
                other.to_string(),
            ))),
        }
    }
}

/// One message: author, header fields, and an ordered list of bodies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "MessageRepr", try_from = "MessageRepr")]
pub struct Message {
    pub author: Author,
    pub content: Vec<Content>,
    pub channel: Option<String>,
    pub recipient: Option<String>,
    pub content_type: Option<String>,
}

impl Message {
    pub fn from_author_and_content(author: Author, content: impl Into<Content>) -> Self {
        Self {
            author,
            content: vec![content.into()],
            channel: None,
            recipient: None,
            content_type: None,
        }
    }

    pub fn from_role_and_content(role: Role, content: impl Into<Content>) -> Self {
        Self::from_author_and_content(Author::from_role(role), content)
    }

    pub fn from_role_and_contents(role: Role, contents: Vec<Content>) -> Self {
        Self {
            author: Author::from_role(role),
            content: contents,
            channel: None,
            recipient: None,
            content_type: None,
        }
    }

    pub fn adding_content(mut self, content: impl Into<Content>) -> Self {
        self.content.push(content.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Wire shape of a message. `content` accepts a bare string as shorthand
/// for one text body; serialization always emits the list form.
#[derive(Serialize, Deserialize)]
struct MessageRepr {
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    content_type: Option<String>,
    content: ContentRepr,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ContentRepr {
    Text(String),
    Parts(Vec<Content>),
}

impl From<Message> for MessageRepr {
    fn from(message: Message) -> Self {
        MessageRepr {
            role: message.author.role,
            name: message.author.name,
            recipient: message.recipient,
            channel: message.channel,
            content_type: message.content_type,
            content: ContentRepr::Parts(message.content),
        }
    }
}

impl TryFrom<MessageRepr> for Message {
    type Error = String;

    fn try_from(repr: MessageRepr) -> Result<Self, Self::Error> {
        let content = match repr.content {
            ContentRepr::Text(text) => vec![Content::Text(TextContent::new(text))],
            ContentRepr::Parts(parts) => parts,
        };
        Ok(Message {
            author: Author {
                role: repr.role,
                name: repr.name,
            },
            content,
            channel: repr.channel,
            recipient: repr.recipient,
            content_type: repr.content_type,
        })
    }
}

/// An ordered list of messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn from_messages<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = Message>,
    {
        Self {
            messages: messages.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_string_roundtrip() {
        for role in [
            Role::User,
            Role::Assistant,
            Role::System,
            Role::Developer,
            Role::Tool,
        ] {
            assert_eq!(Role::try_from(role.as_str()).unwrap(), role);
        }
    }

    #[test]
    fn unknown_role_is_named_error() {
        let err = Role::try_from("robot").unwrap_err();
        assert!(matches!(err, HarmonyError::UnknownRole(ref r) if r == "robot"));
    }

    #[test]
    fn unknown_effort_is_named_error() {
        let err = ReasoningEffort::try_from("extreme").unwrap_err();
        assert!(matches!(err, HarmonyError::UnknownReasoningEffort(_)));
    }

    #[test]
    fn message_json_roundtrip() {
        let message = Message::from_role_and_content(Role::Assistant, TextContent::new("hi"))
            .with_channel("final")
            .with_recipient("functions.check")
            .with_content_type("json");
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn message_content_string_shorthand() {
        let message: Message =
            serde_json::from_str(r#"{"role": "user", "content": "Hello"}"#).unwrap();
        assert_eq!(message.author.role, Role::User);
        assert_eq!(message.content.len(), 1);
        assert_eq!(message.content[0].as_text(), Some("Hello"));
    }

    #[test]
    fn message_rejects_unknown_role() {
        let err = serde_json::from_str::<Message>(r#"{"role": "robot", "content": "x"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown role"), "got: {err}");
    }

    #[test]
    fn content_rejects_unknown_type_tag() {
        let err = serde_json::from_str::<Content>(r#"{"type": "image", "url": "x"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown content type"), "got: {err}");
    }

    #[test]
    fn system_content_json_roundtrip() {
        let content = SystemContent::new()
            .with_model_identity("A helpful model")
            .with_reasoning_effort(ReasoningEffort::High)
            .with_knowledge_cutoff("2024-06")
            .with_browser_tool()
            .with_required_channels(["analysis", "final"]);
        let json = serde_json::to_value(&content).unwrap();
        let back: SystemContent = serde_json::from_value(json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn conversation_json_shape() {
        let conv = Conversation::from_messages([Message::from_role_and_content(
            Role::User,
            TextContent::new("Hi"),
        )]);
        let json = serde_json::to_value(&conv).unwrap();
        assert!(json.get("messages").is_some());
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn function_tools_land_in_functions_namespace() {
        let dev = DeveloperContent::new().with_function_tools(vec![ToolDescription::new(
            "lookup",
            "Looks things up.",
            None,
        )]);
        let ns = dev.function_tools().unwrap();
        assert_eq!(ns.name, "functions");
        assert_eq!(ns.tools.len(), 1);
    }

    #[test]
    fn browser_namespace_has_canonical_tools() {
        let browser = ToolNamespaceConfig::browser();
        let names: Vec<&str> = browser.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["search", "open", "find"]);
        assert!(browser.description.is_some());
    }

    #[test]
    fn python_namespace_has_no_tools() {
        let python = ToolNamespaceConfig::python();
        assert!(python.tools.is_empty());
        assert!(python.description.unwrap().contains("Jupyter"));
    }
}
