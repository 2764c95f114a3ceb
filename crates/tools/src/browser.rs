//! Browser tool: fetch a URL and return readable text.
//!
//! Also used directly by the reference resolver to inline URLs mentioned in
//! user messages.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolKind, ToolUse};
use regex_lite::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use crate::Tool;

/// Upper bound on returned text, in bytes.
const MAX_TEXT_LEN: usize = 100_000;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
        .expect("static regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n(\s*\n)+").expect("static regex"));

pub struct BrowserTool {
    client: reqwest::Client,
}

impl BrowserTool {
    pub fn new() -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("kestrel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "browser".into(),
                reason: format!("HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Fetch `url` and return its content as text.
    pub async fn read_url(&self, url: &str) -> Result<String, ToolError> {
        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "browser".into(),
            reason,
        };

        debug!(url = %url, "Fetching URL");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("{url} returned HTTP {}", status.as_u16())));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("html"));
        let body = response.text().await.map_err(|e| failed(e.to_string()))?;

        let text = if is_html { html_to_text(&body) } else { body };
        Ok(truncate(text))
    }
}

fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(html, "");
    let text = TAG.replace_all(&without_scripts, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    BLANK_LINES.replace_all(text.trim(), "\n\n").into_owned()
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_TEXT_LEN {
        let mut cut = MAX_TEXT_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[... truncated]");
    }
    text
}

#[async_trait]
impl Tool for BrowserTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Browser
    }

    async fn run(&self, tool_use: &ToolUse) -> Result<String, ToolError> {
        let url = tool_use
            .args
            .first()
            .map(String::as_str)
            .or_else(|| tool_use.content.lines().map(str::trim).find(|l| !l.is_empty()))
            .ok_or_else(|| ToolError::InvalidArguments("browser: missing URL".into()))?;

        let text = self.read_url(url).await?;
        Ok(format!("Contents of {url}:\n\n```\n{text}\n```"))
    }
}
