//! Rendering messages and notices for the user.

use kestrel_core::message::{Message, Role};
use std::io::Write;
use std::sync::Mutex;

/// Where the chat loop shows output.
pub trait Console: Send + Sync {
    /// Print a complete message.
    fn message(&self, message: &Message);

    /// Print a fragment of a streaming response.
    fn stream_delta(&self, text: &str);

    /// Finish a streamed response.
    fn stream_end(&self);

    /// Print a one-line notice (command output, hints, farewells).
    fn notice(&self, text: &str);
}

/// Format a message as `role: content`, listing attachments.
pub fn format_message(message: &Message) -> String {
    let label = match message.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    };
    let mut out = format!("{label}: {}", message.content);
    for file in &message.files {
        out.push_str(&format!("\n  [attached: {}]", file.display()));
    }
    out
}

/// Console writing to stdout.
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn message(&self, message: &Message) {
        println!("{}\n", format_message(message));
    }

    fn stream_delta(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn stream_end(&self) {
        println!("\n");
    }

    fn notice(&self, text: &str) {
        println!("{text}");
    }
}

/// Console that records everything it is asked to show.
#[derive(Debug, Default)]
pub struct BufferConsole {
    lines: Mutex<Vec<String>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    fn push(&self, line: String) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }
}

impl Console for BufferConsole {
    fn message(&self, message: &Message) {
        self.push(format_message(message));
    }

    fn stream_delta(&self, text: &str) {
        self.push(text.to_string());
    }

    fn stream_end(&self) {}

    fn notice(&self, text: &str) {
        self.push(text.to_string());
    }
}
