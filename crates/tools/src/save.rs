//! Save and append tools: write a code block's body to a file.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolKind, ToolUse};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Tool, resolve_path};

pub struct SaveTool {
    workdir: PathBuf,
    append: bool,
}

impl SaveTool {
    /// Create or overwrite files.
    pub fn save(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            append: false,
        }
    }

    /// Append to files, creating them when missing.
    pub fn append(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            append: true,
        }
    }

    async fn write(&self, path: &Path, content: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.append {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            if !content.ends_with('\n') {
                file.write_all(b"\n").await?;
            }
            file.flush().await
        } else {
            tokio::fs::write(path, content).await
        }
    }
}

#[async_trait]
impl Tool for SaveTool {
    fn kind(&self) -> ToolKind {
        if self.append {
            ToolKind::Append
        } else {
            ToolKind::Save
        }
    }

    async fn run(&self, tool_use: &ToolUse) -> Result<String, ToolError> {
        let name = self.kind().name();
        let path = tool_use
            .args
            .first()
            .ok_or_else(|| ToolError::InvalidArguments(format!("{name}: missing file path")))?;
        let full = resolve_path(&self.workdir, path);

        debug!(tool = name, path = %full.display(), bytes = tool_use.content.len(), "Writing file");

        self.write(&full, &tool_use.content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: name.into(),
                reason: format!("{}: {e}", full.display()),
            })?;

        Ok(if self.append {
            format!("Appended to {path}")
        } else {
            format!("Saved to {path}")
        })
    }
}
