//! Tool domain types: what the model can ask the shell to do.
//!
//! Tool invocations are never stored separately: a [`ToolUse`] is parsed on
//! demand out of a message (fenced markdown blocks, `<tool-use>` XML, or
//! structured tool calls) and resolved once against a [`Toolset`] to decide
//! whether it is runnable here.

use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;

use crate::message::{Message, MessageToolCall};
use crate::provider::ToolDefinition;

/// The closed set of tools the shell knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Write a file, replacing its contents
    Save,
    /// Append to a file
    Append,
    /// Apply ORIGINAL/UPDATED patch blocks to a file
    Patch,
    /// Run a shell command
    Shell,
    /// Fetch a URL
    Browser,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Save,
        ToolKind::Append,
        ToolKind::Patch,
        ToolKind::Shell,
        ToolKind::Browser,
    ];

    /// Look up a tool by the name used in code blocks and tool calls.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "save" => Some(ToolKind::Save),
            "append" => Some(ToolKind::Append),
            "patch" => Some(ToolKind::Patch),
            "shell" => Some(ToolKind::Shell),
            "browser" => Some(ToolKind::Browser),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Save => "save",
            ToolKind::Append => "append",
            ToolKind::Patch => "patch",
            ToolKind::Shell => "shell",
            ToolKind::Browser => "browser",
        }
    }

    /// Whether running this tool can change files in the workspace.
    pub fn is_mutating(&self) -> bool {
        matches!(self, ToolKind::Save | ToolKind::Append | ToolKind::Patch)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::Save => "Create or overwrite a file with the given content.",
            ToolKind::Append => "Append the given content to a file.",
            ToolKind::Patch => {
                "Apply a patch made of <<<<<<< ORIGINAL / ======= / >>>>>>> UPDATED blocks to a file."
            }
            ToolKind::Shell => "Execute a shell command and return stdout/stderr.",
            ToolKind::Browser => "Fetch a URL and return its text content.",
        }
    }

    /// JSON Schema of the structured-call arguments for this tool.
    pub fn parameters_schema(&self) -> serde_json::Value {
        match self {
            ToolKind::Save | ToolKind::Append => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "The file path" },
                    "content": { "type": "string", "description": "The content to write" }
                },
                "required": ["path", "content"]
            }),
            ToolKind::Patch => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "The file to patch" },
                    "patch": { "type": "string", "description": "ORIGINAL/UPDATED blocks" }
                },
                "required": ["path", "patch"]
            }),
            ToolKind::Shell => serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The shell command to execute" }
                },
                "required": ["command"]
            }),
            ToolKind::Browser => serde_json::json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to fetch" }
                },
                "required": ["url"]
            }),
        }
    }

    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How tool invocations are exchanged with the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolFormat {
    /// Fenced code blocks tagged with the tool name
    #[default]
    Markdown,
    /// `<tool-use>` XML elements
    Xml,
    /// Structured tool calls; the tool schema is sent with each request
    Tool,
}

impl FromStr for ToolFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "markdown" => Ok(ToolFormat::Markdown),
            "xml" => Ok(ToolFormat::Xml),
            "tool" => Ok(ToolFormat::Tool),
            other => Err(format!("unknown tool format '{other}' (expected markdown, xml or tool)")),
        }
    }
}

/// The tools enabled in the current environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolset {
    enabled: Vec<ToolKind>,
}

impl Toolset {
    /// Every known tool enabled.
    pub fn all() -> Self {
        Self {
            enabled: ToolKind::ALL.to_vec(),
        }
    }

    /// No tools enabled.
    pub fn none() -> Self {
        Self { enabled: Vec::new() }
    }

    pub fn new(enabled: impl IntoIterator<Item = ToolKind>) -> Self {
        let mut kinds: Vec<ToolKind> = Vec::new();
        for kind in enabled {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Self { enabled: kinds }
    }

    /// Build from an allowlist of tool names; an empty list enables everything.
    /// Unknown names are ignored with a warning.
    pub fn from_allowlist(names: &[String]) -> Self {
        if names.is_empty() {
            return Self::all();
        }
        Self::new(names.iter().filter_map(|n| {
            let kind = ToolKind::from_name(n.trim());
            if kind.is_none() {
                tracing::warn!(tool = %n, "Unknown tool in allowlist, ignoring");
            }
            kind
        }))
    }

    pub fn is_runnable(&self, kind: ToolKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn kinds(&self) -> &[ToolKind] {
        &self.enabled
    }

    /// Definitions of the runnable tools (sent in the tool-call format).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.enabled.iter().map(|k| k.to_definition()).collect()
    }

    /// Parse every tool invocation in a message, in order of appearance.
    ///
    /// Markdown blocks come first, then XML elements, then structured calls.
    pub fn tool_uses(&self, message: &Message) -> Vec<ToolUse> {
        let mut uses = ToolUse::from_content(&message.content, self);
        uses.extend(
            message
                .tool_calls
                .iter()
                .filter_map(|call| ToolUse::from_call(call, self)),
        );
        uses
    }

    /// Whether a message contains at least one runnable tool invocation.
    pub fn has_runnable(&self, message: &Message) -> bool {
        self.tool_uses(message).iter().any(|tu| tu.is_runnable)
    }
}

impl Default for Toolset {
    fn default() -> Self {
        Self::all()
    }
}

/// A tool invocation parsed out of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    /// Which tool
    pub tool: ToolKind,

    /// Positional arguments (e.g. the path for `save`)
    pub args: Vec<String>,

    /// The block body (file content, command, patch)
    pub content: String,

    /// Structured call id, when this came from a tool call
    pub call_id: Option<String>,

    /// Whether the current environment can execute it
    pub is_runnable: bool,
}

static XML_TOOL_USE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<tool-use>\s*<([a-z]+)([^>]*)>\n?([\s\S]*?)\n?</([a-z]+)>\s*</tool-use>")
        .expect("static regex")
});

static XML_ARGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"args\s*=\s*["']([^"']*)["']"#).expect("static regex"));

impl ToolUse {
    fn new(tool: ToolKind, args: Vec<String>, content: String, toolset: &Toolset) -> Self {
        Self {
            tool,
            args,
            content,
            call_id: None,
            is_runnable: toolset.is_runnable(tool),
        }
    }

    /// Parse markdown and XML tool invocations out of free-form text.
    ///
    /// Code blocks whose language tag is not a known tool are ignored.
    pub fn from_content(content: &str, toolset: &Toolset) -> Vec<ToolUse> {
        let mut uses = Self::parse_markdown(content, toolset);
        uses.extend(Self::parse_xml(content, toolset));
        uses
    }

    fn parse_markdown(content: &str, toolset: &Toolset) -> Vec<ToolUse> {
        let mut uses = Vec::new();
        let mut lines = content.lines();

        while let Some(line) = lines.next() {
            let Some(header) = line.strip_prefix("```") else {
                continue;
            };
            let header = header.trim();
            if header.is_empty() {
                // Plain block: skip to its closing fence
                for inner in lines.by_ref() {
                    if inner.trim_end() == "```" {
                        break;
                    }
                }
                continue;
            }

            let mut parts = header.split_whitespace();
            let lang = parts.next().unwrap_or_default();
            let args: Vec<String> = parts.map(str::to_string).collect();

            let mut body = Vec::new();
            let mut closed = false;
            let mut depth = 0usize;
            for inner in lines.by_ref() {
                let trimmed = inner.trim_end();
                if trimmed == "```" {
                    if depth == 0 {
                        closed = true;
                        break;
                    }
                    depth -= 1;
                } else if trimmed.starts_with("```") && trimmed.len() > 3 {
                    depth += 1;
                }
                body.push(inner);
            }

            // Incomplete blocks (e.g. cut off mid-stream) are not invocations
            if !closed {
                break;
            }
            if let Some(kind) = ToolKind::from_name(lang) {
                uses.push(ToolUse::new(kind, args, body.join("\n"), toolset));
            }
        }
        uses
    }

    fn parse_xml(content: &str, toolset: &Toolset) -> Vec<ToolUse> {
        XML_TOOL_USE
            .captures_iter(content)
            .filter(|caps| caps[1] == caps[4])
            .filter_map(|caps| {
                let kind = ToolKind::from_name(&caps[1])?;
                let args = XML_ARGS
                    .captures(&caps[2])
                    .map(|a| a[1].split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                Some(ToolUse::new(kind, args, caps[3].to_string(), toolset))
            })
            .collect()
    }

    /// Convert a structured tool call into a tool use.
    pub fn from_call(call: &MessageToolCall, toolset: &Toolset) -> Option<ToolUse> {
        let kind = ToolKind::from_name(&call.name)?;
        let value: serde_json::Value = serde_json::from_str(&call.arguments).unwrap_or_default();
        let field = |key: &str| value[key].as_str().map(str::to_string);

        let (args, content) = match kind {
            ToolKind::Save | ToolKind::Append => (
                field("path").into_iter().collect(),
                field("content").unwrap_or_default(),
            ),
            ToolKind::Patch => (
                field("path").into_iter().collect(),
                field("patch").unwrap_or_default(),
            ),
            ToolKind::Shell => (Vec::new(), field("command").unwrap_or_default()),
            ToolKind::Browser => (field("url").into_iter().collect(), String::new()),
        };

        let mut tool_use = ToolUse::new(kind, args, content, toolset);
        tool_use.call_id = Some(call.id.clone());
        Some(tool_use)
    }

    /// Short human-readable description used in confirmation prompts.
    pub fn summary(&self) -> String {
        match self.tool {
            ToolKind::Shell => {
                format!("shell: {}", self.content.lines().next().unwrap_or_default())
            }
            _ => format!("{} {}", self.tool, self.args.join(" ")),
        }
    }
}

/// A side-effecting action awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub tool: ToolKind,
    pub summary: String,
}

impl From<&ToolUse> for PendingAction {
    fn from(tool_use: &ToolUse) -> Self {
        Self {
            tool: tool_use.tool,
            summary: tool_use.summary(),
        }
    }
}

/// Asks whether a side-effecting tool call may proceed.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, action: &PendingAction) -> bool;
}

/// The confirmation policy for one session: auto-approve, or ask.
#[derive(Clone)]
pub struct ConfirmPolicy {
    auto_approve: bool,
    prompt: Option<Arc<dyn Confirm>>,
}

impl ConfirmPolicy {
    /// Approve every action without asking.
    pub fn auto_approve() -> Self {
        Self {
            auto_approve: true,
            prompt: None,
        }
    }

    /// Ask the given confirmer before each action.
    pub fn ask(prompt: Arc<dyn Confirm>) -> Self {
        Self {
            auto_approve: false,
            prompt: Some(prompt),
        }
    }

    pub async fn allows(&self, action: &PendingAction) -> bool {
        if self.auto_approve {
            return true;
        }
        match &self.prompt {
            Some(prompt) => prompt.confirm(action).await,
            None => false,
        }
    }
}

impl std::fmt::Debug for ConfirmPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmPolicy")
            .field("auto_approve", &self.auto_approve)
            .field("has_prompt", &self.prompt.is_some())
            .finish()
    }
}

/// The tool-execution collaborator.
///
/// Invoked once per assistant response. Result messages are sent on the
/// returned channel as soon as each is produced, in execution order.
/// Dropping the receiver cancels whatever execution is still in flight.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, message: &Message, confirm: &ConfirmPolicy) -> mpsc::Receiver<Message>;
}
