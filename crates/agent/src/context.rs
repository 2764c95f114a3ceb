//! Outgoing-context preparation.
//!
//! Builds the message list actually sent to the model from the log:
//! attachments are expanded at send time, then the history is reduced to
//! fit the token budget. The log itself is never touched.

use kestrel_config::ProjectConfig;
use kestrel_core::message::{Message, Role, estimate_message_tokens};
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Fenced blocks with fewer body lines than this are left alone.
const MIN_TRUNCATE_LINES: usize = 10;

/// Lines of a truncated block that are kept.
const KEEP_LINES: usize = 3;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```([^\n`]*)\n([\s\S]*?)\n```").expect("static regex"));

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

fn resolve_attachment(path: &Path, workspace: Option<&Path>) -> PathBuf {
    match workspace {
        Some(ws) if path.is_relative() => ws.join(path),
        _ => path.to_path_buf(),
    }
}

/// Re-read the attachments of a user message into the outgoing copy.
///
/// Text files are appended as fenced blocks with their current contents;
/// anything else is noted by path.
fn expand_attachments(message: &Message, workspace: Option<&Path>) -> Message {
    if message.role != Role::User || message.files.is_empty() {
        return message.clone();
    }

    let mut content = message.content.clone();
    for file in &message.files {
        let full = resolve_attachment(file, workspace);
        match std::fs::read_to_string(&full) {
            Ok(text) => content.push_str(&format!("\n\n```{}\n{text}\n```", file.display())),
            Err(e) => {
                debug!(path = %full.display(), error = %e, "Attachment not inlined as text");
                content.push_str(&format!("\n\n(attached: {})", file.display()));
            }
        }
    }
    message.clone().with_content(content)
}

/// Shorten the body of one fenced block, keeping its first lines.
fn truncate_block(content: &str, start: usize, end: usize) -> String {
    let block = &content[start..end];
    let Some(caps) = FENCED_BLOCK.captures(block) else {
        return content.to_string();
    };
    let lang = &caps[1];
    let body: Vec<&str> = caps[2].lines().collect();
    let dropped = body.len().saturating_sub(KEEP_LINES);
    let shortened = format!(
        "```{lang}\n{}\n[... {dropped} lines truncated]\n```",
        body[..KEEP_LINES.min(body.len())].join("\n")
    );
    format!("{}{shortened}{}", &content[..start], &content[end..])
}

/// The largest truncatable block among all but the last message.
fn largest_block(messages: &[Message]) -> Option<(usize, usize, usize)> {
    let older = messages.len().saturating_sub(1);
    messages[..older]
        .iter()
        .enumerate()
        .flat_map(|(i, m)| {
            FENCED_BLOCK.captures_iter(&m.content).filter_map(move |caps| {
                let whole = caps.get(0)?;
                let lines = caps.get(2)?.as_str().lines().count();
                (lines >= MIN_TRUNCATE_LINES).then_some((i, whole.start(), whole.end(), lines))
            })
        })
        .max_by_key(|&(_, _, _, lines)| lines)
        .map(|(i, start, end, _)| (i, start, end))
}

/// Reduce `messages` to fit `budget` tokens.
///
/// Long fenced blocks in older messages are truncated first, largest
/// first. If that is not enough, the oldest non-system messages are
/// dropped. The most recent message always survives.
pub fn reduce(mut messages: Vec<Message>, budget: usize) -> Vec<Message> {
    let before = estimate_messages_tokens(&messages);
    if before <= budget {
        return messages;
    }

    while estimate_messages_tokens(&messages) > budget {
        let Some((i, start, end)) = largest_block(&messages) else {
            break;
        };
        let content = truncate_block(&messages[i].content, start, end);
        messages[i] = messages[i].clone().with_content(content);
    }

    while estimate_messages_tokens(&messages) > budget {
        let last = messages.len().saturating_sub(1);
        let Some(oldest) = messages[..last].iter().position(|m| m.role != Role::System) else {
            break;
        };
        messages.remove(oldest);
    }

    debug!(
        before,
        after = estimate_messages_tokens(&messages),
        budget,
        remaining = messages.len(),
        "Reduced context to fit budget"
    );
    messages
}

/// Render the project files listed in `.kestrel.toml` as a context prompt.
///
/// Unreadable files are skipped. Returns `None` when nothing is left.
pub fn workspace_prompt(workspace: &Path, project: &ProjectConfig) -> Option<String> {
    let mut sections = Vec::new();
    for file in &project.files {
        match std::fs::read_to_string(workspace.join(file)) {
            Ok(text) => sections.push(format!("```{file}\n{}\n```", text.trim_end())),
            Err(e) => warn!(file = %file, error = %e, "Skipping unreadable project file"),
        }
    }
    if let Some(prompt) = &project.prompt {
        sections.push(prompt.clone());
    }
    if sections.is_empty() {
        return None;
    }
    Some(format!(
        "# Workspace context\n\nWorking directory: {}\n\n{}",
        workspace.display(),
        sections.join("\n\n")
    ))
}

/// Build the outgoing message list for one model call.
pub fn prepare_messages(
    messages: &[Message],
    workspace: Option<&Path>,
    budget: usize,
) -> Vec<Message> {
    let expanded = messages
        .iter()
        .map(|m| expand_attachments(m, workspace))
        .collect();
    reduce(expanded, budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(lines: usize) -> String {
        let body: Vec<String> = (0..lines).map(|i| format!("line {i}")).collect();
        format!("```txt\n{}\n```", body.join("\n"))
    }

    #[test]
    fn under_budget_is_untouched() {
        let msgs = vec![Message::user("hello"), Message::assistant("hi")];
        let out = reduce(msgs.clone(), 1000);
        assert_eq!(out, msgs);
    }

    #[test]
    fn truncates_largest_old_block_first() {
        let small = block(12);
        let big = block(200);
        let msgs = vec![
            Message::user(format!("small:\n{small}")),
            Message::user(format!("big:\n{big}")),
            Message::user("latest question"),
        ];
        let budget = estimate_messages_tokens(&msgs) - 100;

        let out = reduce(msgs, budget);

        assert_eq!(out.len(), 3);
        assert!(out[1].content.contains("lines truncated"));
        assert!(out[0].content.contains("line 11"));
        assert_eq!(out[2].content, "latest question");
    }

    #[test]
    fn never_truncates_last_message() {
        let msgs = vec![Message::user(block(500))];
        let out = reduce(msgs.clone(), 10);
        assert_eq!(out, msgs);
    }

    #[test]
    fn drops_oldest_non_system_messages() {
        let msgs = vec![
            Message::system("system prompt"),
            Message::user("a".repeat(400)),
            Message::assistant("b".repeat(400)),
            Message::user("latest"),
        ];
        let out = reduce(msgs, 150);

        assert_eq!(out[0].content, "system prompt");
        assert_eq!(out.last().unwrap().content, "latest");
        assert!(out.iter().all(|m| !m.content.starts_with('a')));
    }

    #[test]
    fn attachments_are_read_at_send_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "v1").unwrap();
        let msg = Message::user("summarize").with_files(vec![PathBuf::from("notes.txt")]);

        std::fs::write(dir.path().join("notes.txt"), "v2").unwrap();
        let out = prepare_messages(std::slice::from_ref(&msg), Some(dir.path()), 10_000);

        assert_eq!(out[0].content, "summarize\n\n```notes.txt\nv2\n```");
        // The log copy keeps the path only
        assert_eq!(msg.content, "summarize");
    }

    #[test]
    fn binary_attachments_are_noted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("img.png"), [0xff, 0xd8, 0x00]).unwrap();
        let msg = Message::user("what is this").with_files(vec![PathBuf::from("img.png")]);

        let out = prepare_messages(&[msg], Some(dir.path()), 10_000);
        assert!(out[0].content.ends_with("(attached: img.png)"));
    }

    #[test]
    fn workspace_prompt_lists_project_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Demo\n").unwrap();
        let project = ProjectConfig {
            files: vec!["README.md".into(), "missing.md".into()],
            prompt: Some("Use tabs.".into()),
        };

        let prompt = workspace_prompt(dir.path(), &project).unwrap();
        assert!(prompt.contains("```README.md\n# Demo\n```"));
        assert!(prompt.ends_with("Use tabs."));
        assert!(!prompt.contains("missing.md"));
        assert!(workspace_prompt(dir.path(), &ProjectConfig::default()).is_none());
    }
}
