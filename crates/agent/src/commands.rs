//! Slash commands typed at the prompt instead of a message for the model.

use kestrel_core::message::{Log, Message, Role};
use kestrel_core::tool::Toolset;

/// Leading character that marks a command.
pub const SENTINEL: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Exit,
    Log,
    Tokens,
    Tools,
    Model,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Help,
        Command::Exit,
        Command::Log,
        Command::Tokens,
        Command::Tools,
        Command::Model,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Help => "help",
            Command::Exit => "exit",
            Command::Log => "log",
            Command::Tokens => "tokens",
            Command::Tools => "tools",
            Command::Model => "model",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Command::Help => "Show this help message",
            Command::Exit => "Exit the session",
            Command::Log => "Show the conversation log",
            Command::Tokens => "Show the estimated token count of the conversation",
            Command::Tools => "List the available tools",
            Command::Model => "Show the current model, or switch with /model <name>",
        }
    }

    /// Parse `content` as a command invocation.
    ///
    /// Only a known name directly after the sentinel counts, so
    /// `/etc/hosts` stays an ordinary message.
    pub fn parse(content: &str) -> Option<(Command, &str)> {
        let rest = content.trim_start().strip_prefix(SENTINEL)?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest.trim_end(), ""),
        };
        Command::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .map(|c| (c, args))
    }

    /// Whether `token` starts with a command (commands may take path-shaped arguments).
    pub fn is_command_token(token: &str) -> bool {
        Command::ALL
            .iter()
            .any(|c| token.strip_prefix(SENTINEL).is_some_and(|t| t.starts_with(c.name())))
    }
}

/// State a command can read or change.
pub struct CommandContext<'a> {
    pub log: &'a Log,
    pub toolset: &'a Toolset,
    pub model: &'a mut String,
    pub show_hidden: bool,
}

/// Result of running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Text to show the user.
    Output(String),
    /// End the session.
    Exit,
}

/// Run `message` if it is a user command.
///
/// Returns `None` when the message is ordinary conversation.
pub fn execute(message: &Message, ctx: CommandContext<'_>) -> Option<CommandOutcome> {
    if message.role != Role::User {
        return None;
    }
    let (command, args) = Command::parse(&message.content)?;

    let outcome = match command {
        Command::Help => CommandOutcome::Output(help_text()),
        Command::Exit => CommandOutcome::Exit,
        Command::Log => CommandOutcome::Output(
            ctx.log
                .iter()
                .filter(|m| ctx.show_hidden || !m.hide)
                .map(crate::console::format_message)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Command::Tokens => CommandOutcome::Output(format!(
            "Messages: {}\nEstimated tokens: {}",
            ctx.log.len(),
            ctx.log.estimated_tokens()
        )),
        Command::Tools => CommandOutcome::Output(
            ctx.toolset
                .kinds()
                .iter()
                .map(|k| format!("  {:<8} {}", k.name(), k.description()))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Command::Model if args.is_empty() => {
            CommandOutcome::Output(format!("Current model: {}", ctx.model))
        }
        Command::Model => {
            *ctx.model = args.to_string();
            CommandOutcome::Output(format!("Switched model to {args}"))
        }
    };
    Some(outcome)
}

pub fn help_text() -> String {
    let mut text = String::from("Available commands:\n");
    for command in Command::ALL {
        text.push_str(&format!(
            "  {SENTINEL}{:<8} {}\n",
            command.name(),
            command.description()
        ));
    }
    text.push_str("\nMention a file path or URL in a message to include its contents.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(content: &str, log: &Log, model: &mut String) -> Option<CommandOutcome> {
        execute(
            &Message::user(content),
            CommandContext {
                log,
                toolset: &Toolset::all(),
                model,
                show_hidden: false,
            },
        )
    }

    #[test]
    fn parse_known_commands() {
        assert_eq!(Command::parse("/help"), Some((Command::Help, "")));
        assert_eq!(Command::parse("  /model gpt-4o "), Some((Command::Model, "gpt-4o")));
        assert_eq!(Command::parse("/etc/hosts what is this"), None);
        assert_eq!(Command::parse("/helpme"), None);
        assert_eq!(Command::parse("help"), None);
    }

    #[test]
    fn command_tokens_match_by_prefix() {
        assert!(Command::is_command_token("/help"));
        assert!(Command::is_command_token("/logs/today.txt"));
        assert!(!Command::is_command_token("/etc/hosts"));
        assert!(!Command::is_command_token("help"));
    }

    #[test]
    fn help_lists_every_command() {
        let text = help_text();
        for command in Command::ALL {
            assert!(text.contains(&format!("/{}", command.name())));
        }
    }

    #[test]
    fn non_commands_are_not_handled() {
        let log = Log::new();
        let mut model = "m".to_string();
        assert!(run("hello", &log, &mut model).is_none());

        let msg = Message::assistant("/help");
        let ctx = CommandContext {
            log: &log,
            toolset: &Toolset::all(),
            model: &mut model,
            show_hidden: false,
        };
        assert!(execute(&msg, ctx).is_none());
    }

    #[test]
    fn model_switch() {
        let log = Log::new();
        let mut model = "old".to_string();
        let out = run("/model new-model", &log, &mut model).unwrap();
        assert_eq!(out, CommandOutcome::Output("Switched model to new-model".into()));
        assert_eq!(model, "new-model");
    }

    #[test]
    fn log_hides_hidden_messages() {
        let log = Log::from(vec![
            Message::system("secret context").with_hide(true),
            Message::user("visible question"),
        ]);
        let mut model = "m".to_string();
        let Some(CommandOutcome::Output(text)) = run("/log", &log, &mut model) else {
            panic!("expected output");
        };
        assert!(text.contains("visible question"));
        assert!(!text.contains("secret context"));
    }

    #[test]
    fn exit_and_tokens() {
        let log = Log::from(vec![Message::user("test")]);
        let mut model = "m".to_string();
        assert_eq!(run("/exit", &log, &mut model), Some(CommandOutcome::Exit));
        let Some(CommandOutcome::Output(text)) = run("/tokens", &log, &mut model) else {
            panic!("expected output");
        };
        assert!(text.contains("Estimated tokens: 5"));
    }
}
