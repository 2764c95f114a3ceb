//! Per-request cost logging.

use kestrel_core::provider::Usage;
use std::sync::Mutex;
use tracing::info;

use crate::pricing::PricingTable;

/// Cost of one model call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestCost {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// `None` when the model has no known price
    pub usd: Option<f64>,
}

/// Running totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionCost {
    pub requests: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
}

/// The cost-accounting collaborator: prices each model call and logs it.
pub struct CostTracker {
    pricing: PricingTable,
    totals: Mutex<SessionCost>,
}

impl CostTracker {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            totals: Mutex::new(SessionCost::default()),
        }
    }

    /// Record one call.
    ///
    /// Provider-reported usage wins over the estimates, which are used when
    /// the backend reports nothing.
    pub fn record(
        &self,
        model: &str,
        usage: Option<Usage>,
        estimated_input: usize,
        estimated_output: usize,
    ) -> RequestCost {
        let (input_tokens, output_tokens) = match usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => (
                u32::try_from(estimated_input).unwrap_or(u32::MAX),
                u32::try_from(estimated_output).unwrap_or(u32::MAX),
            ),
        };
        let usd = self.pricing.compute_cost(model, input_tokens, output_tokens);

        let totals = {
            let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
            totals.requests += 1;
            totals.input_tokens += u64::from(input_tokens);
            totals.output_tokens += u64::from(output_tokens);
            totals.usd += usd.unwrap_or(0.0);
            *totals
        };

        info!(
            model = %model,
            input_tokens,
            output_tokens,
            estimated = usage.is_none(),
            cost_usd = usd.map(|c| format!("{c:.4}")).unwrap_or_else(|| "unknown".into()),
            session_usd = format!("{:.4}", totals.usd),
            "Model call cost"
        );

        RequestCost {
            input_tokens,
            output_tokens,
            usd,
        }
    }

    pub fn totals(&self) -> SessionCost {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }
}
