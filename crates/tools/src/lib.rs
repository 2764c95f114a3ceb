//! Built-in tool implementations for Kestrel.
//!
//! Tools give the agent the ability to interact with the workspace:
//! write and patch files, run shell commands, and fetch web pages.
//! [`CodeBlockExecutor`] finds the tool invocations in an assistant message
//! and runs the runnable ones in order.

pub mod browser;
pub mod patch;
pub mod save;
pub mod shell;

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::message::Message;
use kestrel_core::tool::{ConfirmPolicy, PendingAction, ToolExecutor, ToolKind, ToolUse, Toolset};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use browser::BrowserTool;
pub use patch::PatchTool;
pub use save::SaveTool;
pub use shell::ShellTool;

/// A single runnable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Run one invocation and return the text handed back to the model.
    async fn run(&self, tool_use: &ToolUse) -> Result<String, ToolError>;
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => kestrel_config::dirs_home().join(rest),
        None => PathBuf::from(path),
    }
}

/// Resolve a tool path argument against the workspace, expanding `~/`.
pub fn resolve_path(workdir: &Path, path: &str) -> PathBuf {
    let p = expand_home(path);
    if p.is_absolute() {
        p
    } else {
        workdir.join(p)
    }
}

/// The tool-execution collaborator used by the step.
///
/// Every tool except `browser` changes the machine, so each of those
/// invocations goes through the confirmation policy first.
pub struct CodeBlockExecutor {
    toolset: Toolset,
    tools: Vec<Arc<dyn Tool>>,
}

impl CodeBlockExecutor {
    /// An executor with no tools registered.
    pub fn empty(toolset: Toolset) -> Self {
        Self {
            toolset,
            tools: Vec::new(),
        }
    }

    /// Register every built-in tool, rooted at `workdir`.
    pub fn with_builtin_tools(workdir: &Path, toolset: Toolset) -> Result<Self, ToolError> {
        let mut executor = Self::empty(toolset);
        executor.register(Arc::new(SaveTool::save(workdir)));
        executor.register(Arc::new(SaveTool::append(workdir)));
        executor.register(Arc::new(PatchTool::new(workdir)));
        executor.register(Arc::new(ShellTool::new(workdir)));
        executor.register(Arc::new(BrowserTool::new()?));
        Ok(executor)
    }

    /// Register a tool, replacing any earlier one of the same kind.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.kind() != tool.kind());
        self.tools.push(tool);
    }

    pub fn toolset(&self) -> &Toolset {
        &self.toolset
    }

    fn tool(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.kind() == kind).cloned()
    }
}

fn needs_confirmation(kind: ToolKind) -> bool {
    kind != ToolKind::Browser
}

/// Wrap a tool's output (or failure) as the system message the model sees.
fn result_message(tool_use: &ToolUse, result: Result<String, ToolError>) -> Message {
    let content = match result {
        Ok(output) => output,
        Err(e) => {
            warn!(tool = %tool_use.tool, error = %e, "Tool execution failed");
            format!("Error during execution: {e}")
        }
    };
    let message = Message::system(content);
    match &tool_use.call_id {
        Some(id) => message.with_call_id(id.clone()),
        None => message,
    }
}

impl ToolExecutor for CodeBlockExecutor {
    fn execute(&self, message: &Message, confirm: &ConfirmPolicy) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(8);

        let jobs: Vec<(ToolUse, Option<Arc<dyn Tool>>)> = self
            .toolset
            .tool_uses(message)
            .into_iter()
            .filter(|tu| tu.is_runnable)
            .map(|tu| {
                let tool = self.tool(tu.tool);
                (tu, tool)
            })
            .collect();

        if jobs.is_empty() {
            return rx;
        }

        let confirm = confirm.clone();
        tokio::spawn(async move {
            for (tool_use, tool) in jobs {
                let message = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Tool output receiver dropped, stopping execution");
                        return;
                    }
                    message = run_one(&tool_use, tool, &confirm) => message,
                };
                if tx.send(message).await.is_err() {
                    return;
                }
            }
        });

        rx
    }
}

async fn run_one(
    tool_use: &ToolUse,
    tool: Option<Arc<dyn Tool>>,
    confirm: &ConfirmPolicy,
) -> Message {
    let Some(tool) = tool else {
        return result_message(tool_use, Err(ToolError::NotFound(tool_use.tool.to_string())));
    };

    let action = PendingAction::from(tool_use);
    if needs_confirmation(tool_use.tool) && !confirm.allows(&action).await {
        info!(tool = %tool_use.tool, "Tool execution declined");
        let skipped = format!("Skipped `{}`: declined by user", action.summary);
        return result_message(tool_use, Ok(skipped));
    }

    debug!(tool = %tool_use.tool, "Running tool");
    result_message(tool_use, tool.run(tool_use).await)
}
