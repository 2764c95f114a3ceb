//! One turn of the conversation as an explicit state machine.
//!
//! A [`Step`] is created from a snapshot of the log and drained with
//! [`Step::next`] until it returns `Ok(None)`. It never writes the log
//! itself: every message it produces is handed back to the caller, which
//! appends it before asking for the next one.
//!
//! Phases run in order: validation pre-check, user prompt (only when it is
//! the user's turn), model call, then tool results one by one.

use kestrel_core::error::{InputError, ProviderError};
use kestrel_core::message::{Message, Role, estimate_tokens};
use kestrel_core::provider::{ProviderRequest, Usage};
use kestrel_core::tool::ToolFormat;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{Agent, ChatOptions};
use crate::commands::Command;
use crate::context::{estimate_messages_tokens, prepare_messages};
use crate::interrupt::{ArmGuard, Interrupted};

/// Prompt shown when waiting for user input.
pub const PROMPT: &str = "User: ";

#[derive(Debug, Error)]
pub enum StepError {
    /// The armed operation was interrupted; the turn is over.
    #[error("interrupted by user")]
    Interrupted,

    /// End of input at the live prompt.
    #[error("end of input")]
    EndOfInput,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Input(#[from] InputError),
}

impl From<Interrupted> for StepError {
    fn from(_: Interrupted) -> Self {
        StepError::Interrupted
    }
}

/// Whether the next turn belongs to the user.
pub fn needs_user_input(messages: &[Message]) -> bool {
    match messages.last() {
        None => true,
        Some(last) => {
            last.role == Role::Assistant
                || last.is_interrupt()
                || last.pinned
                || !messages.iter().any(|m| m.role == Role::User)
        }
    }
}

enum Phase<'a> {
    PreCheck,
    Prompt,
    Model,
    Tools {
        rx: mpsc::Receiver<Message>,
        guard: ArmGuard<'a>,
    },
    Done,
}

/// A single, non-restartable turn.
pub struct Step<'a> {
    agent: &'a Agent,
    options: &'a ChatOptions,
    model: &'a str,
    messages: Vec<Message>,
    phase: Phase<'a>,
}

impl<'a> Step<'a> {
    pub fn new(
        agent: &'a Agent,
        options: &'a ChatOptions,
        model: &'a str,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            agent,
            options,
            model,
            messages,
            phase: Phase::PreCheck,
        }
    }

    /// Produce the next message of this turn, or `None` when it is finished.
    ///
    /// After an error the step is finished; further calls return `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<Message>, StepError> {
        let result = self.advance().await;
        if result.is_err() {
            self.phase = Phase::Done;
        }
        result
    }

    async fn advance(&mut self) -> Result<Option<Message>, StepError> {
        loop {
            match &mut self.phase {
                Phase::PreCheck => {
                    self.phase = Phase::Prompt;
                    if let Some(report) = self.pre_check().await? {
                        self.phase = Phase::Done;
                        return Ok(Some(Message::system(report)));
                    }
                }
                Phase::Prompt => {
                    self.phase = Phase::Model;
                    if needs_user_input(&self.messages) {
                        let message = self.prompt_user().await?;
                        self.messages.push(message.clone());
                        return Ok(Some(message));
                    }
                }
                Phase::Model => {
                    let response = self.call_model().await?;
                    let rx = self
                        .agent
                        .executor
                        .execute(&response, &self.options.confirm);
                    self.phase = Phase::Tools {
                        rx,
                        guard: self.agent.interrupts.arm(),
                    };
                    return Ok(Some(response.with_quiet(true)));
                }
                Phase::Tools { rx, guard } => {
                    let next = guard.run(rx.recv()).await?;
                    if next.is_some() {
                        return Ok(next);
                    }
                    self.phase = Phase::Done;
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    /// Run validation when the last response left nothing to execute.
    async fn pre_check(&self) -> Result<Option<String>, StepError> {
        let last_assistant = self.messages.iter().rev().find(|m| m.role == Role::Assistant);
        if last_assistant.is_some_and(|m| self.agent.toolset.has_runnable(m)) {
            return Ok(None);
        }
        let guard = self.agent.interrupts.arm();
        let log = kestrel_core::message::Log::from(self.messages.clone());
        Ok(guard.run(self.agent.gate.check(&log)).await?)
    }

    /// Wait for a non-empty instruction and resolve its references.
    async fn prompt_user(&self) -> Result<Message, StepError> {
        let line = loop {
            let guard = self.agent.interrupts.arm();
            match guard.run(self.agent.input.read_line(PROMPT)).await {
                Err(Interrupted) => {
                    self.agent.console.notice("\nInterrupted. Press Ctrl-D to exit.");
                }
                Ok(Ok(Some(line))) if line.trim().is_empty() => {}
                Ok(Ok(Some(line))) => break line,
                Ok(Ok(None)) => return Err(StepError::EndOfInput),
                Ok(Err(e)) => return Err(e.into()),
            }
        };

        let message = Message::user(line).with_quiet(true);
        if Command::parse(&message.content).is_some() {
            return Ok(message);
        }
        Ok(self.agent.resolver.resolve(&message).await)
    }

    async fn call_model(&self) -> Result<Message, StepError> {
        let outgoing = prepare_messages(
            &self.messages,
            self.options.workspace.as_deref(),
            self.options.context_budget,
        );
        let tools = match self.options.tool_format {
            ToolFormat::Tool => self.agent.toolset.definitions(),
            _ => Vec::new(),
        };
        let request = ProviderRequest {
            model: self.model.to_string(),
            messages: outgoing,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            tools,
            stream: self.options.stream,
        };
        let input_estimate = estimate_messages_tokens(&request.messages);

        debug!(
            model = %self.model,
            messages = request.messages.len(),
            stream = request.stream,
            "Calling model"
        );
        let guard = self.agent.interrupts.arm();
        let (response, usage) = if self.options.stream {
            guard.run(self.stream_response(request)).await??
        } else {
            guard.run(self.complete_response(request)).await??
        };
        drop(guard);

        if let Some(costs) = &self.agent.costs {
            costs.record(self.model, usage, input_estimate, estimate_tokens(&response.content));
        }

        if let Some(speaker) = &self.agent.speaker
            && let Err(e) = speaker.speak(&response.content).await
        {
            warn!(error = %e, "Text-to-speech failed");
        }

        Ok(response)
    }

    async fn complete_response(
        &self,
        request: ProviderRequest,
    ) -> Result<(Message, Option<Usage>), StepError> {
        let response = self.agent.provider.complete(request).await?;
        self.agent.console.message(&response.message);
        Ok((response.message, response.usage))
    }

    /// Stream a response, rendering deltas as they arrive.
    ///
    /// Only the assembled message is returned; if this future is dropped
    /// mid-stream, the receiver goes with it and nothing partial survives.
    async fn stream_response(
        &self,
        request: ProviderRequest,
    ) -> Result<(Message, Option<Usage>), StepError> {
        let mut rx = self.agent.provider.stream(request).await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;

        self.agent.console.stream_delta("Assistant: ");
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content {
                self.agent.console.stream_delta(&delta);
                content.push_str(&delta);
            }
            tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }
        self.agent.console.stream_end();

        let mut message = Message::assistant(content);
        message.tool_calls = tool_calls;
        Ok((message, usage))
    }
}

/// Turn off streaming when the model cannot stream.
pub fn effective_stream(agent: &Agent, options: &ChatOptions) -> bool {
    if options.stream && !agent.provider.supports_streaming(&options.model) {
        info!(
            provider = agent.provider.name(),
            model = %options.model,
            "Disabled streaming for model (not supported)"
        );
        return false;
    }
    options.stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::gate::{ModificationGate, ValidationHook};
    use crate::input::ScriptedInput;
    use async_trait::async_trait;
    use kestrel_core::message::MessageToolCall;
    use kestrel_core::provider::{Provider, ProviderResponse, StreamChunk};
    use kestrel_core::tool::{ConfirmPolicy, ToolExecutor};
    use std::sync::Arc;
    use std::sync::Mutex;

    /// A mock provider that returns scripted replies and records requests.
    struct ScriptedProvider {
        replies: Mutex<Vec<String>>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(ProviderResponse {
                message: Message::assistant(reply),
                usage: None,
                model: "scripted-model".into(),
            })
        }
    }

    /// Streams two chunks then hangs, like a stalled connection.
    struct StallingProvider;

    #[async_trait]
    impl Provider for StallingProvider {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            std::future::pending().await
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: Some("partial".into()),
                        ..StreamChunk::default()
                    }))
                    .await;
                tx.closed().await;
            });
            Ok(rx)
        }
    }

    /// Echoes one system message per assistant message with a shell block.
    struct EchoExecutor;

    impl ToolExecutor for EchoExecutor {
        fn execute(&self, message: &Message, _confirm: &ConfirmPolicy) -> mpsc::Receiver<Message> {
            let (tx, rx) = mpsc::channel(4);
            let count = kestrel_core::tool::Toolset::all()
                .tool_uses(message)
                .len();
            tokio::spawn(async move {
                for i in 0..count {
                    let _ = tx.send(Message::system(format!("ran tool {i}"))).await;
                }
            });
            rx
        }
    }

    struct FailingHook;

    #[async_trait]
    impl ValidationHook for FailingHook {
        async fn validate(&self) -> Option<String> {
            Some("lint failed".into())
        }
    }

    fn agent(provider: Arc<dyn Provider>, input: ScriptedInput) -> Agent {
        Agent::new(provider, Arc::new(EchoExecutor), Arc::new(input))
            .with_console(Arc::new(BufferConsole::new()))
    }

    fn options(stream: bool) -> ChatOptions {
        ChatOptions {
            stream,
            ..ChatOptions::new("test-model", ConfirmPolicy::auto_approve())
        }
    }

    async fn drain(step: &mut Step<'_>) -> Result<Vec<Message>, StepError> {
        let mut out = Vec::new();
        while let Some(m) = step.next().await? {
            out.push(m);
        }
        Ok(out)
    }

    #[test]
    fn turn_decision() {
        assert!(needs_user_input(&[]));
        assert!(needs_user_input(&[Message::system("setup")]));
        assert!(!needs_user_input(&[Message::user("hi")]));
        assert!(needs_user_input(&[Message::user("hi"), Message::assistant("hello")]));
        assert!(needs_user_input(&[Message::user("hi"), Message::interrupted()]));
        assert!(needs_user_input(&[
            Message::user("hi"),
            Message::system("note").with_pinned(true)
        ]));
        assert!(!needs_user_input(&[
            Message::user("hi"),
            Message::assistant("```shell\nls\n```"),
            Message::system("output"),
        ]));
    }

    #[tokio::test]
    async fn last_user_message_goes_straight_to_model() {
        let provider = ScriptedProvider::new(&["hello there"]);
        let input = ScriptedInput::new(["should not be read"]);
        let agent = agent(provider.clone(), input);
        let opts = options(false);

        let mut step = Step::new(&agent, &opts, "test-model", vec![Message::user("hi")]);
        let out = drain(&mut step).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "hello there");
        assert!(out[0].quiet);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn speech_failure_keeps_response() {
        struct BrokenSpeaker;

        #[async_trait]
        impl crate::agent::Speaker for BrokenSpeaker {
            async fn speak(&self, _text: &str) -> Result<(), kestrel_core::error::ToolError> {
                Err(kestrel_core::error::ToolError::NotFound("tts".into()))
            }
        }

        let provider = ScriptedProvider::new(&["spoken reply"]);
        let agent = agent(provider, ScriptedInput::new(Vec::<String>::new()))
            .with_speaker(Arc::new(BrokenSpeaker));
        let opts = options(false);

        let mut step = Step::new(&agent, &opts, "test-model", vec![Message::user("hi")]);
        let out = drain(&mut step).await.unwrap();
        assert_eq!(out[0].content, "spoken reply");
    }

    #[tokio::test]
    async fn model_calls_are_costed() {
        use kestrel_telemetry::{CostTracker, PricingTable};

        let provider = ScriptedProvider::new(&["reply"]);
        let agent = agent(provider, ScriptedInput::new(Vec::<String>::new()))
            .with_costs(CostTracker::new(PricingTable::with_defaults()));
        let opts = options(false);

        let mut step = Step::new(&agent, &opts, "test-model", vec![Message::user("hi")]);
        drain(&mut step).await.unwrap();

        let totals = agent.costs.as_ref().unwrap().totals();
        assert_eq!(totals.requests, 1);
        assert!(totals.input_tokens > 0);
    }

    #[tokio::test]
    async fn prompts_when_assistant_spoke_last() {
        let provider = ScriptedProvider::new(&["answer"]);
        let agent = agent(provider.clone(), ScriptedInput::new(["", "question"]));
        let opts = options(false);
        let log = vec![Message::user("hi"), Message::assistant("hello")];

        let mut step = Step::new(&agent, &opts, "test-model", log);
        let out = drain(&mut step).await.unwrap();

        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].content, "question");
        assert_eq!(out[1].content, "answer");
        let sent = &provider.requests.lock().unwrap()[0];
        assert_eq!(sent.messages.last().unwrap().content, "question");
    }

    #[tokio::test]
    async fn runnable_tool_result_continues_without_prompt() {
        let provider = ScriptedProvider::new(&["done"]);
        let input = Arc::new(ScriptedInput::new(["unused"]));
        let agent = Agent::new(provider.clone(), Arc::new(EchoExecutor), input.clone())
            .with_console(Arc::new(BufferConsole::new()));
        let opts = options(false);
        let log = vec![
            Message::user("list files"),
            Message::assistant("```shell\nls\n```"),
            Message::system("ran tool 0"),
        ];

        let mut step = Step::new(&agent, &opts, "test-model", log);
        drain(&mut step).await.unwrap();

        assert_eq!(input.remaining(), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn tool_results_follow_response() {
        let provider = ScriptedProvider::new(&["```shell\nls\n```\n```shell\npwd\n```"]);
        let agent = agent(provider, ScriptedInput::new(Vec::<String>::new()));
        let opts = options(false);

        let mut step = Step::new(&agent, &opts, "test-model", vec![Message::user("go")]);
        let out = drain(&mut step).await.unwrap();

        let contents: Vec<_> = out.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[1..], ["ran tool 0", "ran tool 1"]);
    }

    #[tokio::test]
    async fn failed_validation_stops_before_model() {
        let provider = ScriptedProvider::new(&["unused"]);
        let agent = agent(provider.clone(), ScriptedInput::new(Vec::<String>::new()))
            .with_gate(ModificationGate::new(Box::new(FailingHook)));
        let opts = options(false);
        let log = vec![
            Message::user("write it"),
            Message::assistant("```save a.txt\nx\n```\nDone."),
            Message::system("Saved to a.txt"),
            Message::assistant("All written."),
        ];

        let mut step = Step::new(&agent, &opts, "test-model", log);
        let out = drain(&mut step).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[0].content, "lint failed");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn end_of_input_ends_step() {
        let provider = ScriptedProvider::new(&[]);
        let agent = agent(provider, ScriptedInput::new(Vec::<String>::new()));
        let opts = options(false);

        let mut step = Step::new(&agent, &opts, "test-model", vec![]);
        assert!(matches!(step.next().await, Err(StepError::EndOfInput)));
        assert!(step.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupt_during_stream_yields_no_partial_message() {
        let agent = agent(Arc::new(StallingProvider), ScriptedInput::new(Vec::<String>::new()));
        let opts = options(true);
        let interrupts = agent.interrupts.clone();

        let mut step = Step::new(&agent, &opts, "test-model", vec![Message::user("hi")]);
        let (result, _) = tokio::join!(step.next(), async {
            while !interrupts.is_armed() {
                tokio::task::yield_now().await;
            }
            interrupts.interrupt();
        });

        assert!(matches!(result, Err(StepError::Interrupted)));
        assert!(!interrupts.is_armed());
    }

    #[tokio::test]
    async fn streamed_response_is_assembled() {
        struct TwoChunks;

        #[async_trait]
        impl Provider for TwoChunks {
            fn name(&self) -> &str {
                "two"
            }

            async fn complete(
                &self,
                _r: ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                unreachable!("streaming only")
            }

            async fn stream(
                &self,
                _r: ProviderRequest,
            ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
                let (tx, rx) = mpsc::channel(4);
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: Some("Hel".into()),
                        ..StreamChunk::default()
                    }))
                    .await;
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: Some("lo".into()),
                        tool_calls: vec![MessageToolCall {
                            id: "c1".into(),
                            name: "shell".into(),
                            arguments: "{\"command\":\"ls\"}".into(),
                        }],
                        done: true,
                        usage: None,
                    }))
                    .await;
                Ok(rx)
            }
        }

        let agent = agent(Arc::new(TwoChunks), ScriptedInput::new(Vec::<String>::new()));
        let opts = options(true);
        let mut step = Step::new(&agent, &opts, "test-model", vec![Message::user("hi")]);

        let response = step.next().await.unwrap().unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.tool_calls.len(), 1);
    }

    #[test]
    fn streaming_disabled_when_unsupported() {
        struct NoStream;

        #[async_trait]
        impl Provider for NoStream {
            fn name(&self) -> &str {
                "nostream"
            }

            fn supports_streaming(&self, _model: &str) -> bool {
                false
            }

            async fn complete(
                &self,
                _r: ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                unreachable!()
            }
        }

        let agent = agent(Arc::new(NoStream), ScriptedInput::new(Vec::<String>::new()));
        assert!(!effective_stream(&agent, &options(true)));
        assert!(!effective_stream(&agent, &options(false)));
    }
}
