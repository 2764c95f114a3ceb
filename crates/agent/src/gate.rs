//! Post-modification validation.
//!
//! After tools that write files have run, an external validation hook (the
//! project's pre-commit checks) gets a chance to object. Detecting "tools
//! that write files ran" is a loose heuristic: only the last few non-user
//! messages are inspected, so a long tool chain can slip past it. The gate
//! is a nudge, not a guarantee.

use async_trait::async_trait;
use kestrel_core::message::{Log, Role};
use kestrel_core::tool::Toolset;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// How many non-user messages are scanned for file changes.
pub const SCAN_LIMIT: usize = 3;

/// Whether the most recent non-user messages (up to [`SCAN_LIMIT`], stopping
/// at the last user message) contain a file-mutating tool invocation.
pub fn has_recent_modifications(log: &Log) -> bool {
    let all = Toolset::all();
    let recent: Vec<_> = log
        .iter()
        .rev()
        .take_while(|m| m.role != Role::User)
        .take(SCAN_LIMIT)
        .collect();

    let modified = recent
        .iter()
        .flat_map(|m| all.tool_uses(m))
        .any(|tu| tu.tool.is_mutating());

    debug!(scanned = recent.len(), modified, "Checked recent messages for modifications");
    modified
}

/// An external check run after the workspace may have changed.
#[async_trait]
pub trait ValidationHook: Send + Sync {
    /// The failure report, or `None` when the checks pass.
    async fn validate(&self) -> Option<String>;
}

/// Decides whether to run validation and relays its report.
#[derive(Default)]
pub struct ModificationGate {
    hook: Option<Box<dyn ValidationHook>>,
}

impl ModificationGate {
    /// A gate that never blocks.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(hook: Box<dyn ValidationHook>) -> Self {
        Self { hook: Some(hook) }
    }

    /// Run the hook if recent tool activity may have modified the workspace.
    pub async fn check(&self, log: &Log) -> Option<String> {
        let hook = self.hook.as_ref()?;
        if !has_recent_modifications(log) {
            return None;
        }
        hook.validate().await
    }
}

/// Runs `pre-commit` on the modified files of a git workspace.
pub struct PreCommitHook {
    workspace: PathBuf,
}

impl PreCommitHook {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl ValidationHook for PreCommitHook {
    async fn validate(&self) -> Option<String> {
        if !self.workspace.join(".pre-commit-config.yaml").exists() {
            return None;
        }

        debug!(workspace = %self.workspace.display(), "Running pre-commit checks");
        let output = Command::new("sh")
            .args(["-c", "pre-commit run --files $(git ls-files -m)"])
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Could not run pre-commit checks");
                return None;
            }
        };

        if output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Some(precommit_report(stdout.trim_end(), stderr.trim_end()))
    }
}

fn precommit_report(stdout: &str, stderr: &str) -> String {
    let mut report = String::from("Pre-commit checks failed");
    if !stdout.is_empty() {
        report.push_str(&format!("\n\n```stdout\n{stdout}\n```"));
    }
    if !stderr.is_empty() {
        report.push_str(&format!("\n\n```stderr\n{stderr}\n```"));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::message::Message;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: Arc<AtomicUsize>,
        report: Option<String>,
    }

    #[async_trait]
    impl ValidationHook for CountingHook {
        async fn validate(&self) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.report.clone()
        }
    }

    fn save(path: &str) -> Message {
        Message::assistant(format!("```save {path}\ncontent\n```"))
    }

    #[test]
    fn detects_mutation_since_last_user() {
        let log = Log::from(vec![
            Message::user("write it"),
            save("a.txt"),
            Message::system("Saved to a.txt"),
        ]);
        assert!(has_recent_modifications(&log));
    }

    #[test]
    fn stops_at_user_message() {
        let log = Log::from(vec![save("a.txt"), Message::user("thanks")]);
        assert!(!has_recent_modifications(&log));
    }

    #[test]
    fn only_three_messages_are_scanned() {
        let log = Log::from(vec![
            Message::user("go"),
            save("a.txt"),
            Message::system("Saved"),
            Message::assistant("```shell\nls\n```"),
            Message::system("Ran command"),
        ]);
        // The save is the fourth non-user message from the end
        assert!(!has_recent_modifications(&log));
    }

    #[test]
    fn shell_is_not_a_modification() {
        let log = Log::from(vec![Message::user("go"), Message::assistant("```shell\nls\n```")]);
        assert!(!has_recent_modifications(&log));
    }

    #[tokio::test]
    async fn three_saves_invoke_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = ModificationGate::new(Box::new(CountingHook {
            calls: calls.clone(),
            report: Some("lint failed".into()),
        }));
        let log = Log::from(vec![
            Message::user("write three files"),
            save("a.txt"),
            save("b.txt"),
            save("c.txt"),
        ]);

        assert_eq!(gate.check(&log).await.as_deref(), Some("lint failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hook_not_run_without_modification() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = ModificationGate::new(Box::new(CountingHook {
            calls: calls.clone(),
            report: Some("never".into()),
        }));
        let log = Log::from(vec![Message::user("hi"), Message::assistant("hello")]);

        assert!(gate.check(&log).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(ModificationGate::disabled().check(&log).await.is_none());
    }

    #[tokio::test]
    async fn precommit_skipped_without_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PreCommitHook::new(dir.path()).validate().await.is_none());
    }

    #[test]
    fn report_includes_output_blocks() {
        let report = precommit_report("trailing whitespace....Failed", "");
        assert!(report.starts_with("Pre-commit checks failed"));
        assert!(report.contains("```stdout\ntrailing whitespace....Failed\n```"));
        assert!(!report.contains("stderr"));
    }
}
