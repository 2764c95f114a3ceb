//! Kestrel CLI: the main entry point.
//!
//! Runs any prompts given on the command line, then keeps chatting
//! interactively unless `--non-interactive` is set.

use clap::Parser;
use std::path::PathBuf;

mod session;

#[derive(Parser, Debug)]
#[command(
    name = "kestrel",
    about = "Kestrel: chat with a model that can run tools in your workspace",
    version
)]
pub struct Cli {
    /// Prompts to run in order; separate multiple prompts with `-`
    pub prompts: Vec<String>,

    /// Model to use, overriding the config file
    #[arg(short, long)]
    pub model: Option<String>,

    /// Workspace directory for tools and attachments (defaults to the current directory)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// How tool invocations are exchanged: markdown, xml or tool
    #[arg(long)]
    pub tool_format: Option<String>,

    /// Comma-separated list of tools that may run
    #[arg(long, value_delimiter = ',')]
    pub tools: Vec<String>,

    /// Disable streaming responses
    #[arg(long)]
    pub no_stream: bool,

    /// Run tools without asking for confirmation
    #[arg(long)]
    pub no_confirm: bool,

    /// Exit once the prompts are done instead of asking for more input
    #[arg(short = 'n', long)]
    pub non_interactive: bool,

    /// Show hidden system messages
    #[arg(long)]
    pub show_hidden: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Group positional words into prompts, using a lone `-` as separator.
fn split_prompts(args: &[String]) -> Vec<String> {
    args.split(|arg| arg == "-")
        .map(|words| words.join("\n\n").trim().to_string())
        .filter(|prompt| !prompt.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    session::run(cli).await?;

    // The stdin reader may still be parked on a read; don't wait for it
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn prompts_split_on_dash() {
        let prompts = split_prompts(&args(&["write", "a", "test", "-", "run", "it"]));
        assert_eq!(prompts, ["write\n\na\n\ntest", "run\n\nit"]);
    }

    #[test]
    fn empty_segments_are_dropped() {
        assert!(split_prompts(&[]).is_empty());
        assert_eq!(split_prompts(&args(&["-", "hello", "-"])), ["hello"]);
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "kestrel",
            "--no-confirm",
            "-n",
            "--tools",
            "save,shell",
            "--tool-format",
            "xml",
            "hello",
        ])
        .unwrap();
        assert!(cli.no_confirm);
        assert!(cli.non_interactive);
        assert_eq!(cli.tools, ["save", "shell"]);
        assert_eq!(cli.tool_format.as_deref(), Some("xml"));
        assert_eq!(cli.prompts, ["hello"]);
    }
}
