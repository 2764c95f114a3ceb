//! The outer conversation loop.
//!
//! [`ChatLoop`] owns the [`Log`] and is its only writer. Queued prompts are
//! run one at a time until the model stops asking for tools; after that the
//! loop switches to live input (interactive sessions) or ends.

use kestrel_core::message::{Log, Message, Role};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::agent::{Agent, ChatOptions};
use crate::commands::{self, Command, CommandContext, CommandOutcome};
use crate::console::Console;
use crate::step::{Step, StepError, effective_stream};

/// Printed after the resumed history.
pub const HISTORY_BANNER: &str = "--- ^^^ past messages ^^^ ---";

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The queue is empty in a non-interactive session.
    Finished,
    /// The user sent `/exit`.
    Exit,
    /// Input ended at the live prompt.
    EndOfInput,
}

/// The log at the end of a session and why it ended.
#[derive(Debug)]
pub struct ChatOutcome {
    pub log: Log,
    pub end: SessionEnd,
}

pub struct ChatLoop<'a> {
    agent: &'a Agent,
    options: ChatOptions,
    log: Log,
}

/// Append `message`, showing it unless it is quiet or hidden.
fn append(console: &dyn Console, log: &mut Log, show_hidden: bool, message: Message) {
    if !message.quiet && (show_hidden || !message.hide) {
        console.message(&message);
    }
    log.append(message);
}

impl<'a> ChatLoop<'a> {
    pub fn new(agent: &'a Agent, options: ChatOptions, log: Log) -> Self {
        Self { agent, options, log }
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Run the session to completion.
    pub async fn run(mut self, prompts: Vec<Message>) -> ChatOutcome {
        self.options.stream = effective_stream(self.agent, &self.options);
        self.print_history();
        self.add_workspace_prompt();

        let mut queue: VecDeque<Message> = prompts.into();
        while let Some(prompt) = queue.pop_front() {
            if let Some(end) = self.run_prompt(prompt).await {
                return self.finish(end);
            }
        }

        if !self.options.interactive {
            debug!("Non-interactive and prompts exhausted, exiting");
            return self.finish(SessionEnd::Finished);
        }

        loop {
            let result = self.run_step().await;
            let end = match result {
                Ok(end) => end,
                Err(e) => self.handle_error(e),
            };
            if let Some(end) = end {
                return self.finish(end);
            }
        }
    }

    fn finish(self, end: SessionEnd) -> ChatOutcome {
        debug!(?end, messages = self.log.len(), "Session ended");
        ChatOutcome { log: self.log, end }
    }

    fn print_history(&self) {
        if self.log.is_empty() {
            return;
        }
        for message in self.log.iter() {
            if self.options.show_hidden || !message.hide {
                self.agent.console.message(message);
            }
        }
        self.agent.console.notice(HISTORY_BANNER);
    }

    /// Add the workspace context once, before the first user message.
    fn add_workspace_prompt(&mut self) {
        let Some(prompt) = &self.options.workspace_prompt else {
            return;
        };
        if self.log.has_user_message() || self.log.iter().any(|m| &m.content == prompt) {
            return;
        }
        let message = Message::system(prompt.clone()).with_hide(true).with_quiet(true);
        self.log.append(message);
    }

    /// Run one queued prompt until no runnable tool is left.
    async fn run_prompt(&mut self, prompt: Message) -> Option<SessionEnd> {
        let is_command = prompt.role == Role::User && Command::parse(&prompt.content).is_some();
        let prompt = if is_command || prompt.role != Role::User {
            prompt
        } else {
            self.agent.resolver.resolve(&prompt).await
        };
        append(
            self.agent.console.as_ref(),
            &mut self.log,
            self.options.show_hidden,
            prompt.clone(),
        );

        if is_command {
            return self.run_command(&prompt);
        }

        loop {
            match self.run_step().await {
                Ok(Some(end)) => return Some(end),
                Ok(None) => {}
                Err(e) => return self.handle_error(e),
            }

            let runnable = self
                .log
                .last_assistant()
                .is_some_and(|m| self.agent.toolset.has_runnable(m));
            if !runnable {
                return None;
            }
        }
    }

    /// Drain one step into the log, stopping at a user command.
    async fn run_step(&mut self) -> Result<Option<SessionEnd>, StepError> {
        let mut command = None;
        {
            let mut step = Step::new(
                self.agent,
                &self.options,
                &self.options.model,
                self.log.messages().to_vec(),
            );
            while let Some(message) = step.next().await? {
                let is_command =
                    message.role == Role::User && Command::parse(&message.content).is_some();
                append(
                    self.agent.console.as_ref(),
                    &mut self.log,
                    self.options.show_hidden,
                    message.clone(),
                );
                if is_command {
                    command = Some(message);
                    break;
                }
            }
        }

        Ok(command.and_then(|message| self.run_command(&message)))
    }

    fn run_command(&mut self, message: &Message) -> Option<SessionEnd> {
        let outcome = commands::execute(
            message,
            CommandContext {
                log: &self.log,
                toolset: &self.agent.toolset,
                model: &mut self.options.model,
                show_hidden: self.options.show_hidden,
            },
        )?;
        match outcome {
            CommandOutcome::Output(text) => {
                self.agent.console.notice(&text);
                None
            }
            CommandOutcome::Exit => Some(SessionEnd::Exit),
        }
    }

    /// Record a failed step. Only the end of input ends the session.
    fn handle_error(&mut self, error: StepError) -> Option<SessionEnd> {
        match error {
            StepError::Interrupted => {
                self.agent
                    .console
                    .notice("Interrupted. Stopping current execution.");
                self.log.append(Message::interrupted());
                None
            }
            StepError::EndOfInput => {
                self.agent.console.notice("\nGoodbye!");
                Some(SessionEnd::EndOfInput)
            }
            StepError::Input(e) => {
                warn!(error = %e, "Input failed, ending session");
                self.agent.console.notice("\nGoodbye!");
                Some(SessionEnd::EndOfInput)
            }
            StepError::Provider(e) => {
                warn!(error = %e, model = %self.options.model, "Model call failed");
                let message = Message::system(format!("Error: {e}")).with_pinned(true);
                append(
                    self.agent.console.as_ref(),
                    &mut self.log,
                    self.options.show_hidden,
                    message,
                );
                None
            }
        }
    }
}
