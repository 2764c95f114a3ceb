//! End-to-end sessions through `ChatLoop` with scripted collaborators.

use async_trait::async_trait;
use kestrel_agent::{
    Agent, BufferConsole, ChatLoop, ChatOptions, ModificationGate, ReferenceResolver,
    ScriptedInput, SessionEnd, Step, ValidationHook,
};
use kestrel_core::error::{ProviderError, ToolError};
use kestrel_core::message::{Log, Message, Role};
use kestrel_core::provider::{Provider, ProviderRequest, ProviderResponse};
use kestrel_core::tool::{ConfirmPolicy, ToolExecutor, ToolKind, ToolUse, Toolset};
use kestrel_tools::{CodeBlockExecutor, Tool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// --- Mock collaborators ---

/// Replies with scripted messages in order and counts calls.
struct SequentialProvider {
    replies: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl SequentialProvider {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for SequentialProvider {
    fn name(&self) -> &str {
        "sequential"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| "Nothing more to say.".into());
        Ok(ProviderResponse {
            message: Message::assistant(reply),
            usage: None,
            model: request.model,
        })
    }
}

/// Never answers.
struct HangingProvider;

#[async_trait]
impl Provider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        std::future::pending().await
    }
}

struct NoTools;

impl ToolExecutor for NoTools {
    fn execute(&self, _message: &Message, _confirm: &ConfirmPolicy) -> mpsc::Receiver<Message> {
        mpsc::channel(1).1
    }
}

/// A shell that never finishes.
struct StuckShell;

#[async_trait]
impl Tool for StuckShell {
    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    async fn run(&self, _tool_use: &ToolUse) -> Result<String, ToolError> {
        std::future::pending().await
    }
}

/// Counts saves without touching the disk.
struct CountingSave {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CountingSave {
    fn kind(&self) -> ToolKind {
        ToolKind::Save
    }

    async fn run(&self, _tool_use: &ToolUse) -> Result<String, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok("Saved".into())
    }
}

struct CountingHook {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ValidationHook for CountingHook {
    async fn validate(&self) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some("Pre-commit checks failed".into())
    }
}

fn options(interactive: bool) -> ChatOptions {
    ChatOptions {
        stream: false,
        interactive,
        ..ChatOptions::new("test-model", ConfirmPolicy::auto_approve())
    }
}

// --- Scenarios ---

#[tokio::test]
async fn queued_prompt_inlines_referenced_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

    let provider = SequentialProvider::new(&["A greeting."]);
    let agent = Agent::new(provider.clone(), Arc::new(NoTools), Arc::new(ScriptedInput::default()))
        .with_console(Arc::new(BufferConsole::new()))
        .with_resolver(ReferenceResolver::new(dir.path()));

    let outcome = ChatLoop::new(&agent, options(false), Log::new())
        .run(vec![Message::user("summarize ./notes.txt")])
        .await;

    let user = &outcome.log.messages()[0];
    assert_eq!(user.role, Role::User);
    assert!(user.content.contains("```./notes.txt\nhello\n```"));
    assert_eq!(provider.calls(), 1);
    assert_eq!(outcome.end, SessionEnd::Finished);
}

#[tokio::test]
async fn queued_help_command_skips_model() {
    let provider = SequentialProvider::new(&[]);
    let console = Arc::new(BufferConsole::new());
    let agent = Agent::new(provider.clone(), Arc::new(NoTools), Arc::new(ScriptedInput::default()))
        .with_console(console.clone());

    let outcome = ChatLoop::new(&agent, options(false), Log::new())
        .run(vec![Message::user("/help")])
        .await;

    assert_eq!(provider.calls(), 0);
    assert!(console.contains("Available commands"));
    assert_eq!(outcome.log.len(), 1);
}

#[tokio::test]
async fn interrupt_during_model_call_appends_one_sentinel() {
    let agent = Agent::new(
        Arc::new(HangingProvider),
        Arc::new(NoTools),
        Arc::new(ScriptedInput::default()),
    )
    .with_console(Arc::new(BufferConsole::new()));
    let interrupts = agent.interrupts.clone();

    let chat = ChatLoop::new(&agent, options(false), Log::new());
    let (outcome, _) = tokio::join!(chat.run(vec![Message::user("hi")]), async {
        while !interrupts.is_armed() {
            tokio::task::yield_now().await;
        }
        interrupts.interrupt();
    });

    let log = outcome.log;
    assert_eq!(log.len(), 2);
    assert_eq!(log.messages()[0].content, "hi");
    assert!(log.messages()[1].is_interrupt());
    assert!(log.last_assistant().is_none());
    assert!(!agent.interrupts.is_armed());
}

#[tokio::test]
async fn interrupted_prompt_moves_to_next_queued_prompt() {
    let agent = Agent::new(
        Arc::new(HangingProvider),
        Arc::new(NoTools),
        Arc::new(ScriptedInput::default()),
    )
    .with_console(Arc::new(BufferConsole::new()));
    let interrupts = agent.interrupts.clone();

    let chat = ChatLoop::new(&agent, options(false), Log::new());
    let (outcome, _) = tokio::join!(
        chat.run(vec![Message::user("first"), Message::user("/tokens")]),
        async {
            while !interrupts.is_armed() {
                tokio::task::yield_now().await;
            }
            interrupts.interrupt();
        }
    );

    let roles: Vec<_> = outcome.log.iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User, Role::System, Role::User]);
    assert!(outcome.log.messages()[1].is_interrupt());
}

#[tokio::test]
async fn interrupt_while_waiting_for_input_reprompts() {
    let provider = SequentialProvider::new(&["Hi!"]);
    let console = Arc::new(BufferConsole::new());
    let input = Arc::new(ScriptedInput::paused(["hello"]));
    let agent = Agent::new(provider.clone(), Arc::new(NoTools), input.clone())
        .with_console(console.clone());
    let interrupts = agent.interrupts.clone();

    let chat = ChatLoop::new(&agent, options(true), Log::new());
    let (outcome, _) = tokio::join!(chat.run(vec![]), async {
        while !interrupts.is_armed() {
            tokio::task::yield_now().await;
        }
        interrupts.interrupt();
    });

    assert!(console.contains("Interrupted. Press Ctrl-D to exit."));
    assert!(!outcome.log.iter().any(|m| m.is_interrupt()));
    let contents: Vec<_> = outcome.log.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["hello", "Hi!"]);
    assert_eq!(provider.calls(), 1);
    assert_eq!(input.remaining(), 0);
    assert_eq!(outcome.end, SessionEnd::EndOfInput);
}

#[tokio::test]
async fn interrupt_during_tools_stops_remaining_tools() {
    let saves = Arc::new(AtomicUsize::new(0));
    let mut executor = CodeBlockExecutor::empty(Toolset::all());
    executor.register(Arc::new(StuckShell));
    executor.register(Arc::new(CountingSave { runs: saves.clone() }));

    let provider = SequentialProvider::new(&["```shell\nsleep 100\n```\n\n```save a.txt\na\n```"]);
    let agent = Agent::new(provider.clone(), Arc::new(executor), Arc::new(ScriptedInput::default()))
        .with_console(Arc::new(BufferConsole::new()));
    let interrupts = agent.interrupts.clone();

    let chat = ChatLoop::new(&agent, options(false), Log::new());
    let (outcome, _) = tokio::join!(chat.run(vec![Message::user("run it")]), async {
        while !interrupts.is_armed() {
            tokio::task::yield_now().await;
        }
        interrupts.interrupt();
    });
    // Give the executor task a chance to observe the dropped receiver
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let roles: Vec<_> = outcome.log.iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant, Role::System]);
    assert_eq!(outcome.log.iter().filter(|m| m.is_interrupt()).count(), 1);
    assert_eq!(saves.load(Ordering::SeqCst), 0);
    assert_eq!(provider.calls(), 1);
    assert!(!agent.interrupts.is_armed());
}

#[tokio::test]
async fn runnable_tools_continue_without_prompting() {
    let dir = tempfile::tempdir().unwrap();
    let executor = CodeBlockExecutor::with_builtin_tools(dir.path(), Toolset::all()).unwrap();
    let provider = SequentialProvider::new(&["```save hello.txt\nhi there\n```", "Done."]);
    let input = Arc::new(ScriptedInput::new(["should stay unread"]));
    let agent = Agent::new(provider.clone(), Arc::new(executor), input.clone())
        .with_console(Arc::new(BufferConsole::new()))
        .with_resolver(ReferenceResolver::new(dir.path()));

    let outcome = ChatLoop::new(&agent, options(false), Log::new())
        .run(vec![Message::user("write a greeting")])
        .await;

    assert_eq!(provider.calls(), 2);
    assert_eq!(input.remaining(), 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("hello.txt"))
            .unwrap()
            .trim_end(),
        "hi there"
    );
    let roles: Vec<_> = outcome.log.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [Role::User, Role::Assistant, Role::System, Role::Assistant]
    );
    assert_eq!(outcome.log.last().unwrap().content, "Done.");
}

#[tokio::test]
async fn resumed_user_message_goes_straight_to_model() {
    let provider = SequentialProvider::new(&["Hello!"]);
    let input = Arc::new(ScriptedInput::default());
    let agent = Agent::new(provider.clone(), Arc::new(NoTools), input)
        .with_console(Arc::new(BufferConsole::new()));
    let log = Log::from(vec![Message::user("hi")]);

    let outcome = ChatLoop::new(&agent, options(true), log).run(vec![]).await;

    assert_eq!(provider.calls(), 1);
    assert_eq!(outcome.log.messages()[1].content, "Hello!");
    assert_eq!(outcome.end, SessionEnd::EndOfInput);
}

#[tokio::test]
async fn three_saves_invoke_validation_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = SequentialProvider::new(&[]);
    // Saves are parsed but not runnable, so the pre-check runs
    let agent = Agent::new(provider.clone(), Arc::new(NoTools), Arc::new(ScriptedInput::default()))
        .with_console(Arc::new(BufferConsole::new()))
        .with_toolset(Toolset::new([ToolKind::Shell]))
        .with_gate(ModificationGate::new(Box::new(CountingHook {
            calls: calls.clone(),
        })));
    let opts = options(true);
    let history = vec![
        Message::user("write three files"),
        Message::assistant("```save a.txt\na\n```"),
        Message::assistant("```save b.txt\nb\n```"),
        Message::assistant("```save c.txt\nc\n```"),
    ];

    let mut step = Step::new(&agent, &opts, &opts.model, history);
    let mut produced = Vec::new();
    while let Some(message) = step.next().await.unwrap() {
        produced.push(message);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].role, Role::System);
    assert_eq!(produced[0].content, "Pre-commit checks failed");
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn validation_report_is_answered_by_model() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = SequentialProvider::new(&["I will fix the lint errors."]);
    let agent = Agent::new(provider.clone(), Arc::new(NoTools), Arc::new(ScriptedInput::default()))
        .with_console(Arc::new(BufferConsole::new()))
        .with_gate(ModificationGate::new(Box::new(CountingHook {
            calls: calls.clone(),
        })));
    let log = Log::from(vec![
        Message::user("write it"),
        Message::assistant("```save a.txt\na\n```"),
        Message::system("Saved to a.txt"),
        Message::assistant("Written."),
    ]);

    let outcome = ChatLoop::new(&agent, options(true), log).run(vec![]).await;

    let contents: Vec<_> = outcome.log.iter().skip(4).map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        ["Pre-commit checks failed", "I will fix the lint errors."]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.end, SessionEnd::EndOfInput);
}
