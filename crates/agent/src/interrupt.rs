//! Scoped cancellation for the one active session.
//!
//! A blocking operation (model call, tool execution, input wait) arms the
//! controller for exactly as long as it blocks. Arming hands out a fresh
//! [`CancellationToken`] wrapped in an [`ArmGuard`]; dropping the guard disarms,
//! so every return path (including `?` and panics) clears the armed state.
//! An interrupt cancels the armed token and nothing else.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Two unarmed interrupts closer together than this end the process.
pub const EXIT_WINDOW: Duration = Duration::from_secs(1);

/// The armed operation was cancelled by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by user")]
pub struct Interrupted;

/// What an external interrupt signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The armed operation was cancelled.
    Cancelled,
    /// Nothing was armed; the signal had no effect.
    Ignored,
    /// Second unarmed interrupt in quick succession; the caller should exit.
    Exit,
}

#[derive(Default)]
struct State {
    generation: u64,
    armed: Option<(u64, CancellationToken)>,
    last_unarmed: Option<Instant>,
}

/// Process-wide interrupt state for the active session.
#[derive(Default)]
pub struct InterruptController {
    state: Mutex<State>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the current operation interruptible until the guard is dropped.
    pub fn arm(&self) -> ArmGuard<'_> {
        let mut state = self.state();
        state.generation += 1;
        let token = CancellationToken::new();
        state.armed = Some((state.generation, token.clone()));
        ArmGuard {
            controller: self,
            generation: state.generation,
            token,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state().armed.is_some()
    }

    /// Deliver an external interrupt signal.
    pub fn interrupt(&self) -> InterruptOutcome {
        let mut state = self.state();
        if let Some((_, token)) = state.armed.take() {
            debug!("Interrupt: cancelling armed operation");
            token.cancel();
            state.last_unarmed = None;
            return InterruptOutcome::Cancelled;
        }

        let now = Instant::now();
        match state.last_unarmed {
            Some(prev) if now.duration_since(prev) < EXIT_WINDOW => InterruptOutcome::Exit,
            _ => {
                state.last_unarmed = Some(now);
                InterruptOutcome::Ignored
            }
        }
    }

    fn disarm(&self, generation: u64) {
        let mut state = self.state();
        if state.armed.as_ref().is_some_and(|(g, _)| *g == generation) {
            state.armed = None;
        }
    }
}

/// One armed scope. Disarms on drop.
pub struct ArmGuard<'a> {
    controller: &'a InterruptController,
    generation: u64,
    token: CancellationToken,
}

impl ArmGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `fut` to completion unless the scope is interrupted first.
    ///
    /// On interrupt `fut` is dropped, which aborts whatever it was doing.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted),
            out = fut => Ok(out),
        }
    }
}

impl Drop for ArmGuard<'_> {
    fn drop(&mut self) {
        self.controller.disarm(self.generation);
    }
}
