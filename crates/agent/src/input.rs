//! Live input sources for the prompt and for confirmations.

use async_trait::async_trait;
use kestrel_core::error::InputError;
use kestrel_core::tool::{Confirm, PendingAction};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// A source of user input lines.
///
/// `Ok(None)` means end of input (Ctrl-D).
#[async_trait]
pub trait InputSource: Send + Sync {
    async fn read_line(&self, prompt: &str) -> Result<Option<String>, InputError>;
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes")
}

/// Interactive terminal input.
///
/// One background task reads stdin, so a cancelled wait never loses a line:
/// the next `read_line` receives it.
pub struct TerminalInput {
    lines: Arc<tokio::sync::Mutex<mpsc::Receiver<Result<String, InputError>>>>,
}

impl TerminalInput {
    /// Start reading stdin. Must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut lines = BufReader::new(io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF (Ctrl+D)
                    Err(e) => {
                        let _ = tx.send(Err(InputError::Io(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Self {
            lines: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[async_trait]
impl InputSource for TerminalInput {
    async fn read_line(&self, prompt: &str) -> Result<Option<String>, InputError> {
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut lines = self.lines.lock().await;
        lines.recv().await.transpose()
    }
}

#[async_trait]
impl Confirm for TerminalInput {
    async fn confirm(&self, action: &PendingAction) -> bool {
        let prompt = format!("Execute {}? [Y/n] ", action.summary);
        matches!(self.read_line(&prompt).await, Ok(Some(answer)) if is_yes(&answer))
    }
}

/// Input replayed from a fixed list of lines.
///
/// When the lines run out it reports end of input. One built with
/// [`ScriptedInput::paused`] stalls on its first read, standing in for a
/// user who has not typed anything yet; a cancelled wait does not consume
/// a line.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    lines: Mutex<VecDeque<String>>,
    paused: AtomicBool,
}

impl ScriptedInput {
    pub fn new(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn paused(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            paused: AtomicBool::new(true),
            ..Self::new(lines)
        }
    }

    pub fn remaining(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl InputSource for ScriptedInput {
    async fn read_line(&self, _prompt: &str) -> Result<Option<String>, InputError> {
        if self.paused.swap(false, Ordering::SeqCst) {
            return std::future::pending().await;
        }
        Ok(self.lines.lock().unwrap_or_else(|e| e.into_inner()).pop_front())
    }
}

#[async_trait]
impl Confirm for ScriptedInput {
    async fn confirm(&self, _action: &PendingAction) -> bool {
        matches!(self.read_line("").await, Ok(Some(answer)) if is_yes(&answer))
    }
}
