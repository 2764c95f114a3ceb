//! Message and Log domain types.
//!
//! A `Message` is an immutable value: helpers that "change" a field consume
//! the message and hand back a new one. The `Log` is the append-only record of
//! a session and the single source of truth for whose turn it is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Content of the sentinel system message recorded when a turn is interrupted.
pub const INTERRUPT_CONTENT: &str = "Interrupted by user";

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single message, including ~4 tokens of per-message
/// overhead for the role and delimiters of the wire format.
pub fn estimate_message_tokens(message: &Message) -> usize {
    4 + estimate_tokens(&message.content)
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions, tool output and control markers
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        f.write_str(s)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Attached files, in order (relative to the workspace where possible)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,

    /// Not shown when the log is printed (unless hidden messages are requested)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hide: bool,

    /// Already rendered; do not print again when appended
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub quiet: bool,

    /// Never treated as awaiting a reply
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,

    /// Structured tool calls requested by the assistant (tool-call format only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is the result of a structured tool call, which call it answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with the given role and default flags.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            files: Vec::new(),
            hide: false,
            quiet: false,
            pinned: false,
            tool_calls: Vec::new(),
            call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// The sentinel recorded in the log when a turn is interrupted.
    pub fn interrupted() -> Self {
        Self::system(INTERRUPT_CONTENT)
    }

    /// Whether this is the interrupt sentinel.
    pub fn is_interrupt(&self) -> bool {
        self.role == Role::System && self.content == INTERRUPT_CONTENT
    }

    pub fn with_content(self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self
        }
    }

    pub fn with_files(self, files: Vec<PathBuf>) -> Self {
        Self { files, ..self }
    }

    pub fn with_quiet(self, quiet: bool) -> Self {
        Self { quiet, ..self }
    }

    pub fn with_hide(self, hide: bool) -> Self {
        Self { hide, ..self }
    }

    pub fn with_pinned(self, pinned: bool) -> Self {
        Self { pinned, ..self }
    }

    pub fn with_call_id(self, call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..self
        }
    }
}

/// A structured tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}

/// The append-only record of a session.
///
/// Messages can only be appended; positions and contents of appended
/// messages never change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
    messages: Vec<Message>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the tail.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// Whether any user message has been recorded yet.
    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::User)
    }

    /// Estimated prompt size of the whole log.
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(estimate_message_tokens).sum()
    }
}

impl From<Vec<Message>> for Log {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

impl<'a> IntoIterator for &'a Log {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
