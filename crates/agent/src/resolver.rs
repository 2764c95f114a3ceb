//! File and URL reference resolution for user messages.
//!
//! Path- and URL-like tokens in free-form text are found, classified, and
//! either inlined as fenced appendices or recorded as attachments. Fenced
//! code is never scanned, and an unreadable candidate is simply not a
//! reference.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::message::Message;
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::commands::Command;

/// Binary extensions kept as attachments when the file is not text.
const ATTACHABLE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "pdf"];

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").expect("static regex"));
static BACKTICK_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("static regex"));

/// Classification of a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Path,
    Url,
    Plain,
}

/// Fetches URL contents for inlining.
#[async_trait]
pub trait UrlReader: Send + Sync {
    async fn read_url(&self, url: &str) -> Result<String, ToolError>;
}

#[async_trait]
impl UrlReader for kestrel_tools::BrowserTool {
    async fn read_url(&self, url: &str) -> Result<String, ToolError> {
        kestrel_tools::BrowserTool::read_url(self, url).await
    }
}

fn strip_trailing_punctuation(word: &str) -> &str {
    word.trim_end_matches(['?', '.', ',', '!'])
}

fn is_url(token: &str) -> bool {
    url::Url::parse(token).is_ok_and(|u| u.has_host() && !u.scheme().is_empty())
}

/// Classify one token.
///
/// `cwd_entries` is the listing of the directory relative tokens resolve
/// against; a bare word naming one of its entries counts as a path.
pub fn classify(token: &str, cwd_entries: &[String]) -> TokenKind {
    if token.is_empty() || Command::is_command_token(token) {
        return TokenKind::Plain;
    }
    if is_url(token) {
        return TokenKind::Url;
    }

    let path_like = ["/", "~/", "./"].iter().any(|p| token.starts_with(p))
        || token.starts_with("http")
        || token.contains('/')
        || token
            .split('/')
            .next()
            .is_some_and(|first| cwd_entries.iter().any(|e| e == first));

    if path_like {
        TokenKind::Path
    } else {
        TokenKind::Plain
    }
}

/// Find candidate reference tokens in `content`, in order of appearance.
///
/// Backtick spans come first, then whitespace-delimited words outside them.
pub fn find_candidates(content: &str, cwd_entries: &[String]) -> Vec<String> {
    let without_code = FENCED_CODE.replace_all(content, "");
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |word: &str| {
        let word = strip_trailing_punctuation(word.trim());
        if classify(word, cwd_entries) != TokenKind::Plain
            && !candidates.iter().any(|c| c == word)
        {
            candidates.push(word.to_string());
        }
    };

    for caps in BACKTICK_SPAN.captures_iter(&without_code) {
        push(&caps[1]);
    }

    let without_spans = BACKTICK_SPAN.replace_all(&without_code, "");
    for word in without_spans.split_whitespace() {
        push(word);
    }

    candidates
}

/// What reading a path candidate produced.
enum FileContents {
    Text(String),
    Binary,
}

/// Splices referenced files and URLs into user messages.
pub struct ReferenceResolver {
    /// Directory relative tokens are read from
    base_dir: PathBuf,
    /// When set, attachments are stored relative to it
    workspace: Option<PathBuf>,
    fresh_context: bool,
    url_reader: Option<Arc<dyn UrlReader>>,
}

impl ReferenceResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            workspace: None,
            fresh_context: false,
            url_reader: None,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Record text files as attachments instead of inlining them.
    pub fn with_fresh_context(mut self, fresh: bool) -> Self {
        self.fresh_context = fresh;
        self
    }

    pub fn with_url_reader(mut self, reader: Arc<dyn UrlReader>) -> Self {
        self.url_reader = Some(reader);
        self
    }

    fn cwd_entries(&self) -> Vec<String> {
        std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn full_path(&self, token: &str) -> PathBuf {
        kestrel_tools::resolve_path(&self.base_dir, token)
    }

    /// The path recorded in `files` for a token.
    fn attachment_path(&self, token: &str) -> PathBuf {
        let path = kestrel_tools::expand_home(token);
        match &self.workspace {
            Some(ws) if !path.is_absolute() => {
                let full = self.base_dir.join(&path);
                match full.strip_prefix(ws) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => full,
                }
            }
            _ => path,
        }
    }

    /// Read a path candidate. Anything that isn't a readable file is `None`.
    async fn read(&self, path: &Path) -> Option<FileContents> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => Some(match String::from_utf8(bytes) {
                Ok(text) => FileContents::Text(text),
                Err(_) => FileContents::Binary,
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Unreadable path, not a reference");
                None
            }
        }
    }

    async fn read_url(&self, url: &str) -> Option<String> {
        let Some(reader) = &self.url_reader else {
            warn!(url = %url, "Browser tool not available, skipping URL read");
            return None;
        };
        match reader.read_url(url).await {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to read URL");
                None
            }
        }
    }

    /// Resolve the references in `message`, returning a new message.
    ///
    /// The input is never modified; with no references the content and
    /// attachments come back unchanged.
    pub async fn resolve(&self, message: &Message) -> Message {
        let cwd_entries = self.cwd_entries();
        let mut appendix = String::new();
        let mut files = Vec::new();

        for token in find_candidates(&message.content, &cwd_entries) {
            debug!(token = %token, "Potential path/URL");

            if classify(&token, &cwd_entries) == TokenKind::Url {
                if let Some(content) = self.read_url(&token).await {
                    appendix.push_str(&format!("\n\n```{token}\n{content}\n```"));
                }
                continue;
            }

            let path = self.full_path(&token);
            let is_attachable = || {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| ATTACHABLE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            };

            match self.read(&path).await {
                Some(FileContents::Text(contents)) if !self.fresh_context => {
                    appendix.push_str(&format!("\n\n```{token}\n{contents}\n```"));
                }
                Some(FileContents::Text(_)) => files.push(self.attachment_path(&token)),
                Some(FileContents::Binary) if is_attachable() => {
                    files.push(self.attachment_path(&token));
                }
                Some(FileContents::Binary) => {
                    debug!(path = %path.display(), "Unsupported binary file, skipping");
                }
                None => {}
            }
        }

        let mut resolved = message.clone();
        if !files.is_empty() {
            let mut all = resolved.files.clone();
            all.extend(files);
            resolved = resolved.with_files(all);
        }
        if !appendix.is_empty() {
            let content = format!("{}{appendix}", resolved.content);
            resolved = resolved.with_content(content);
        }
        resolved
    }
}
