//! The `memory` tool: one `rig::tool::Tool` dispatching across the six
//! `MemoryStore` commands from a single tagged-args schema, per §4.5's
//! `{command, path, file_text?, view_range?, old_str?, new_str?,
//! insert_line?, new_path?}` input shape. Grounded in the teacher's
//! `tools/memory_delete.rs` (`NAME`/`Args: JsonSchema`/`Output: Serialize`
//! shape) generalized from one command to six.

use crate::memory::{MemoryStore, ViewResult};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCommand {
    View,
    Create,
    StrReplace,
    Insert,
    Delete,
    Rename,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryArgs {
    pub command: MemoryCommand,
    /// Path under `/memories/<bot>/...`.
    pub path: String,
    /// Full text for `create`.
    pub file_text: Option<String>,
    /// Inclusive 1-indexed `[start, end]` line range for `view`.
    pub view_range: Option<[usize; 2]>,
    /// Text to find, for `str_replace`.
    pub old_str: Option<String>,
    /// Replacement text, for `str_replace` and `insert`.
    pub new_str: Option<String>,
    /// 1-indexed line to insert before, for `insert`.
    pub insert_line: Option<usize>,
    /// Destination path, for `rename`.
    pub new_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MemoryOutput {
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MemoryToolError(pub String);

pub struct MemoryTool {
    store: Arc<MemoryStore>,
}

impl MemoryTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl Tool for MemoryTool {
    const NAME: &'static str = "memory";

    type Error = MemoryToolError;
    type Args = MemoryArgs;
    type Output = MemoryOutput;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "View, create, and edit files in your persistent memory, rooted at \
                           /memories/<bot>. Use `view` to list a directory or read a file, \
                           `create` to write a new file (or overwrite one), `str_replace` to \
                           replace one occurrence of text, `insert` to add a line, `delete` to \
                           remove a file or directory, and `rename` to move a file."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "enum": ["view", "create", "str_replace", "insert", "delete", "rename"]
                    },
                    "path": { "type": "string" },
                    "file_text": { "type": "string" },
                    "view_range": {
                        "type": "array",
                        "items": { "type": "integer" },
                        "minItems": 2,
                        "maxItems": 2
                    },
                    "old_str": { "type": "string" },
                    "new_str": { "type": "string" },
                    "insert_line": { "type": "integer" },
                    "new_path": { "type": "string" }
                },
                "required": ["command", "path"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let result = match args.command {
            MemoryCommand::View => {
                let range = args.view_range.map(|[a, b]| (a, b));
                self.store.view(&args.path, range).await.map(|v| match v {
                    ViewResult::File(text) => text,
                    ViewResult::Directory(entries) => entries
                        .into_iter()
                        .map(|e| if e.is_dir { format!("{}/", e.name) } else { e.name })
                        .collect::<Vec<_>>()
                        .join("\n"),
                })
            }
            MemoryCommand::Create => {
                let text = args.file_text.unwrap_or_default();
                self.store.create(&args.path, &text).await.map(|_| format!("Created {}", args.path))
            }
            MemoryCommand::StrReplace => {
                let (old, new) = (args.old_str.unwrap_or_default(), args.new_str.unwrap_or_default());
                self.store
                    .str_replace(&args.path, &old, &new)
                    .await
                    .map(|_| format!("Replaced in {}", args.path))
            }
            MemoryCommand::Insert => {
                let line = args.insert_line.unwrap_or(1);
                let text = args.new_str.unwrap_or_default();
                self.store
                    .insert(&args.path, line, &text)
                    .await
                    .map(|_| format!("Inserted into {} at line {line}", args.path))
            }
            MemoryCommand::Delete => self.store.delete(&args.path).await.map(|_| format!("Deleted {}", args.path)),
            MemoryCommand::Rename => {
                let new_path = args.new_path.unwrap_or_default();
                self.store
                    .rename(&args.path, &new_path)
                    .await
                    .map(|_| format!("Renamed {} to {new_path}", args.path))
            }
        };

        // Errors are returned as descriptive tool output text, never a raw
        // exception, per §4.2's "all failures return descriptive text usable
        // as tool output" — but still as an `Err` here so `ToolRouter` can
        // mark the `ToolResult` block `is_error`.
        result
            .map(|text| MemoryOutput { text })
            .map_err(|e| MemoryToolError(e.to_string()))
    }
}
