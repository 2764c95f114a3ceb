//! Wires configuration, provider, tools and input into a chat session.

use anyhow::Context;
use kestrel_agent::context::workspace_prompt;
use kestrel_agent::{
    Agent, ChatLoop, ChatOptions, InterruptController, InterruptOutcome, ModificationGate,
    PreCommitHook, ReferenceResolver, SessionEnd, TerminalInput,
};
use kestrel_config::{AppConfig, ProjectConfig};
use kestrel_core::message::{Log, Message};
use kestrel_core::tool::{ConfirmPolicy, Toolset};
use kestrel_telemetry::{CostTracker, ModelPricing, PricingTable};
use kestrel_tools::{BrowserTool, CodeBlockExecutor};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Cli, split_prompts};

/// Exit status used when the user quits with a double Ctrl-C.
const INTERRUPT_EXIT_CODE: i32 = 130;

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(format) = &cli.tool_format {
        config.tool_format = format.parse().map_err(anyhow::Error::msg)?;
    }
    if !cli.tools.is_empty() {
        config.tool_allowlist = cli.tools.clone();
    }
    if cli.no_stream {
        config.stream = false;
    }
    Ok(())
}

fn pricing_table(config: &AppConfig) -> PricingTable {
    config
        .pricing
        .iter()
        .fold(PricingTable::with_defaults(), |table, (model, price)| {
            table.with_override(
                model.clone(),
                ModelPricing::new(price.input_per_m, price.output_per_m),
            )
        })
}

/// Relative references resolve against the workspace, the same directory
/// tools write to.
fn reference_resolver(workspace: &Path, config: &AppConfig) -> ReferenceResolver {
    ReferenceResolver::new(workspace)
        .with_workspace(workspace)
        .with_fresh_context(config.fresh_context)
}

/// Deliver Ctrl-C to the interrupt controller until the process exits.
async fn listen_for_interrupts(interrupts: Arc<InterruptController>) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            return;
        }
        match interrupts.interrupt() {
            InterruptOutcome::Cancelled => debug!("Cancelled the running operation"),
            InterruptOutcome::Ignored => eprintln!("\nPress Ctrl-C again to exit."),
            InterruptOutcome::Exit => std::process::exit(INTERRUPT_EXIT_CODE),
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<SessionEnd> {
    let session_id = Uuid::new_v4();
    let mut config = AppConfig::load().context("Failed to load config")?;
    apply_cli_overrides(&mut config, &cli)?;

    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let workspace = cli.workspace.clone().unwrap_or_else(|| cwd.clone());
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace {} does not exist", workspace.display()))?;

    info!(
        session = %session_id,
        provider = %config.provider,
        model = %config.model,
        workspace = %workspace.display(),
        "Starting session"
    );

    let provider = kestrel_providers::build_from_config(&config).with_context(|| {
        format!(
            "Failed to set up provider; set KESTREL_API_KEY or edit {}",
            AppConfig::config_dir().join("config.toml").display()
        )
    })?;

    let toolset = Toolset::from_allowlist(&config.tool_allowlist);
    let executor = CodeBlockExecutor::with_builtin_tools(&workspace, toolset.clone())
        .context("Failed to set up tools")?;
    let browser = BrowserTool::new().context("Failed to set up URL reader")?;
    let resolver = reference_resolver(&workspace, &config).with_url_reader(Arc::new(browser));

    let input = Arc::new(TerminalInput::spawn());
    let confirm = if cli.no_confirm {
        ConfirmPolicy::auto_approve()
    } else {
        ConfirmPolicy::ask(input.clone())
    };

    let interrupts = Arc::new(InterruptController::new());
    let mut agent = Agent::new(provider, Arc::new(executor), input)
        .with_toolset(toolset)
        .with_resolver(resolver)
        .with_interrupts(interrupts.clone());
    if config.precommit {
        agent = agent.with_gate(ModificationGate::new(Box::new(PreCommitHook::new(&workspace))));
    }
    if config.show_costs {
        agent = agent.with_costs(CostTracker::new(pricing_table(&config)));
    }

    let project_prompt = ProjectConfig::load(&workspace)
        .context("Failed to load project config")?
        .and_then(|project| workspace_prompt(&workspace, &project));

    let options = ChatOptions {
        model: config.model.clone(),
        temperature: config.temperature,
        max_tokens: Some(config.max_tokens),
        stream: config.stream,
        tool_format: config.tool_format,
        interactive: !cli.non_interactive,
        show_hidden: cli.show_hidden,
        context_budget: config.context_budget_tokens,
        workspace: Some(workspace.clone()),
        workspace_prompt: project_prompt,
        confirm,
    };

    let listener = tokio::spawn(listen_for_interrupts(interrupts));
    let prompts = split_prompts(&cli.prompts)
        .into_iter()
        .map(Message::user)
        .collect();
    let outcome = ChatLoop::new(&agent, options, Log::new()).run(prompts).await;
    listener.abort();

    if let Some(costs) = &agent.costs {
        let totals = costs.totals();
        info!(
            requests = totals.requests,
            input_tokens = totals.input_tokens,
            output_tokens = totals.output_tokens,
            usd = totals.usd,
            "Session cost"
        );
    }
    info!(
        session = %session_id,
        messages = outcome.log.len(),
        end = ?outcome.end,
        "Session finished"
    );
    Ok(outcome.end)
}
