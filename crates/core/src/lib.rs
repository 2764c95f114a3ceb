//! # Kestrel Core
//!
//! Domain types, traits, and error definitions for the Kestrel agent shell.
//! This crate has no runtime wiring of its own: it defines the conversation
//! model and the collaborator seams that the other crates implement against.
//!
//! - [`message`]: `Message` values and the append-only `Log`
//! - [`provider`]: the model client trait and its request/response types
//! - [`tool`]: tool kinds, parsed `ToolUse` views, and the executor/confirm seams

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{InputError, ProviderError, ToolError};
pub use message::{INTERRUPT_CONTENT, Log, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage};
pub use tool::{
    Confirm, ConfirmPolicy, PendingAction, ToolExecutor, ToolFormat, ToolKind, ToolUse, Toolset,
};
