//! Cost tracking for Kestrel model calls.
//!
//! Estimates the USD cost of every request from a built-in model pricing
//! table and logs it as a structured `tracing` event.

pub mod costs;
pub mod pricing;

pub use costs::{CostTracker, RequestCost, SessionCost};
pub use pricing::{ModelPricing, PricingTable};
