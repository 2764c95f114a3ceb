//! Patch tool: apply ORIGINAL/UPDATED conflict-style blocks to a file.
//!
//! ```text
//! <<<<<<< ORIGINAL
//! old lines
//! =======
//! new lines
//! >>>>>>> UPDATED
//! ```
//!
//! Each ORIGINAL section must match the file exactly once (first match wins).

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolKind, ToolUse};
use std::path::PathBuf;
use tracing::debug;

use crate::{Tool, resolve_path};

const ORIGINAL: &str = "<<<<<<< ORIGINAL";
const DIVIDER: &str = "=======";
const UPDATED: &str = ">>>>>>> UPDATED";

pub struct PatchTool {
    workdir: PathBuf,
}

impl PatchTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

/// One replacement parsed from a patch body.
#[derive(Debug, PartialEq, Eq)]
struct Hunk {
    original: String,
    updated: String,
}

fn parse_hunks(patch: &str) -> Result<Vec<Hunk>, String> {
    let mut hunks = Vec::new();
    let mut lines = patch.lines();

    while let Some(line) = lines.next() {
        if line.trim_end() != ORIGINAL {
            continue;
        }

        let mut original = Vec::new();
        let mut found_divider = false;
        for inner in lines.by_ref() {
            if inner.trim_end() == DIVIDER {
                found_divider = true;
                break;
            }
            original.push(inner);
        }
        if !found_divider {
            return Err(format!("missing '{DIVIDER}' after '{ORIGINAL}'"));
        }

        let mut updated = Vec::new();
        let mut found_end = false;
        for inner in lines.by_ref() {
            if inner.trim_end() == UPDATED {
                found_end = true;
                break;
            }
            updated.push(inner);
        }
        if !found_end {
            return Err(format!("missing '{UPDATED}'"));
        }

        hunks.push(Hunk {
            original: original.join("\n"),
            updated: updated.join("\n"),
        });
    }

    if hunks.is_empty() {
        return Err(format!("no '{ORIGINAL}' blocks found"));
    }
    Ok(hunks)
}

fn apply_hunks(source: &str, hunks: &[Hunk]) -> Result<String, String> {
    let mut result = source.to_string();
    for (i, hunk) in hunks.iter().enumerate() {
        if hunk.original.is_empty() {
            return Err(format!("hunk {} has an empty ORIGINAL section", i + 1));
        }
        if !result.contains(&hunk.original) {
            return Err(format!("hunk {}: ORIGINAL section not found in file", i + 1));
        }
        result = result.replacen(&hunk.original, &hunk.updated, 1);
    }
    Ok(result)
}

#[async_trait]
impl Tool for PatchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Patch
    }

    async fn run(&self, tool_use: &ToolUse) -> Result<String, ToolError> {
        let path = tool_use
            .args
            .first()
            .ok_or_else(|| ToolError::InvalidArguments("patch: missing file path".into()))?;
        let full = resolve_path(&self.workdir, path);

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "patch".into(),
            reason,
        };

        let hunks = parse_hunks(&tool_use.content).map_err(ToolError::InvalidArguments)?;
        let source = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| failed(format!("{}: {e}", full.display())))?;
        let patched = apply_hunks(&source, &hunks).map_err(failed)?;

        debug!(path = %full.display(), hunks = hunks.len(), "Applying patch");
        tokio::fs::write(&full, patched)
            .await
            .map_err(|e| failed(format!("{}: {e}", full.display())))?;

        Ok(format!("Patch applied to {path}"))
    }
}
