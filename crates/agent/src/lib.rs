//! The turn-taking loop at the heart of Kestrel.
//!
//! A session is driven by [`ChatLoop`], which owns the conversation log and
//! runs one [`Step`] at a time:
//!
//! 1. **Pre-check**: if files were just modified, run validation first
//! 2. **Prompt**: ask the user for input when it is their turn
//! 3. **Model call**: send the (reduced) context and render the reply
//! 4. **Tools**: execute the tool uses in the reply and yield their output
//!
//! Every blocking point is armed through the [`InterruptController`], so a
//! Ctrl-C cancels exactly the operation in progress and the loop records a
//! single "interrupted" marker before carrying on.

pub mod agent;
pub mod chat;
pub mod commands;
pub mod console;
pub mod context;
pub mod gate;
pub mod input;
pub mod interrupt;
pub mod resolver;
pub mod step;

pub use agent::{Agent, ChatOptions, DEFAULT_CONTEXT_BUDGET, Speaker};
pub use chat::{ChatLoop, ChatOutcome, SessionEnd};
pub use commands::{Command, CommandOutcome};
pub use console::{BufferConsole, Console, StdoutConsole};
pub use gate::{ModificationGate, PreCommitHook, ValidationHook};
pub use input::{InputSource, ScriptedInput, TerminalInput};
pub use interrupt::{ArmGuard, InterruptController, InterruptOutcome, Interrupted};
pub use resolver::{ReferenceResolver, TokenKind, UrlReader};
pub use step::{Step, StepError};
