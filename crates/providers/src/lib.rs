//! LLM Provider implementations for Kestrel.
//!
//! All providers implement the `kestrel_core::Provider` trait.
//! The router selects the correct provider based on configuration.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::build_from_config;
