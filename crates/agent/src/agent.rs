//! The collaborators and settings shared by every step of a session.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::provider::Provider;
use kestrel_core::tool::{ConfirmPolicy, ToolExecutor, ToolFormat, Toolset};
use kestrel_telemetry::CostTracker;
use std::path::PathBuf;
use std::sync::Arc;

use crate::console::{Console, StdoutConsole};
use crate::gate::ModificationGate;
use crate::input::InputSource;
use crate::interrupt::InterruptController;
use crate::resolver::ReferenceResolver;

/// Default token budget for the outgoing context.
pub const DEFAULT_CONTEXT_BUDGET: usize = 100_000;

/// Reads responses aloud.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), ToolError>;
}

/// Everything a step talks to.
pub struct Agent {
    pub provider: Arc<dyn Provider>,
    pub executor: Arc<dyn ToolExecutor>,
    pub input: Arc<dyn InputSource>,
    pub console: Arc<dyn Console>,
    pub toolset: Toolset,
    pub resolver: ReferenceResolver,
    pub gate: ModificationGate,
    pub interrupts: Arc<InterruptController>,
    pub costs: Option<CostTracker>,
    pub speaker: Option<Arc<dyn Speaker>>,
}

impl Agent {
    /// An agent with all tools runnable, references resolved against the
    /// current directory, and no validation, cost logging or speech.
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
        input: Arc<dyn InputSource>,
    ) -> Self {
        Self {
            provider,
            executor,
            input,
            console: Arc::new(StdoutConsole),
            toolset: Toolset::all(),
            resolver: ReferenceResolver::new(std::env::current_dir().unwrap_or_default()),
            gate: ModificationGate::disabled(),
            interrupts: Arc::new(InterruptController::new()),
            costs: None,
            speaker: None,
        }
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    pub fn with_toolset(mut self, toolset: Toolset) -> Self {
        self.toolset = toolset;
        self
    }

    pub fn with_resolver(mut self, resolver: ReferenceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_gate(mut self, gate: ModificationGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_interrupts(mut self, interrupts: Arc<InterruptController>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn with_costs(mut self, costs: CostTracker) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn with_speaker(mut self, speaker: Arc<dyn Speaker>) -> Self {
        self.speaker = Some(speaker);
        self
    }
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub tool_format: ToolFormat,
    pub interactive: bool,
    pub show_hidden: bool,
    pub context_budget: usize,
    /// Attachments are stored and re-read relative to this directory
    pub workspace: Option<PathBuf>,
    /// Hidden system prompt describing the workspace, added once
    pub workspace_prompt: Option<String>,
    pub confirm: ConfirmPolicy,
}

impl ChatOptions {
    pub fn new(model: impl Into<String>, confirm: ConfirmPolicy) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            stream: true,
            tool_format: ToolFormat::default(),
            interactive: true,
            show_hidden: false,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            workspace: None,
            workspace_prompt: None,
            confirm,
        }
    }
}
