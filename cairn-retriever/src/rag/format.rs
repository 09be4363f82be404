//! Rendering of selected chunks into the context text handed to a language model.

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;

use crate::retrieval::index_manager::RetrievalResult;

/// Layout of the assembled context text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFormat {
    /// File headers followed by the chunk texts
    #[default]
    Compact,

    /// Like compact, with each chunk's position and relevance score
    Detailed,

    /// Fenced code blocks only, one per file, tagged with the file's language
    CodeOnly,
}

impl std::fmt::Display for ContextFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextFormat::Compact => write!(f, "compact"),
            ContextFormat::Detailed => write!(f, "detailed"),
            ContextFormat::CodeOnly => write!(f, "code-only"),
        }
    }
}

impl std::str::FromStr for ContextFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(ContextFormat::Compact),
            "detailed" | "detail" => Ok(ContextFormat::Detailed),
            "code-only" | "code_only" | "codeonly" | "code" => Ok(ContextFormat::CodeOnly),
            _ => Err(format!(
                "Invalid context format: '{s}'. Valid values are: compact, detailed, code-only"
            )),
        }
    }
}

/// Markdown fence tag for a file, from its extension.
pub fn language_tag(path: &str) -> &str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext.to_lowercase().as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "jsx",
        "ts" => "typescript",
        "tsx" => "tsx",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "sh" => "bash",
        "txt" => "text",
        _ => ext,
    }
}

/// Groups chunks by file, keeping the order in which each file first appears.
fn group_by_file(chunks: &[RetrievalResult]) -> Vec<(&str, Vec<&RetrievalResult>)> {
    let mut groups: Vec<(&str, Vec<&RetrievalResult>)> = Vec::new();
    for chunk in chunks {
        match groups.iter_mut().find(|(path, _)| *path == chunk.path) {
            Some((_, members)) => members.push(chunk),
            None => groups.push((chunk.path.as_str(), vec![chunk])),
        }
    }
    groups
}

/// Renders `chunks` in `format`. No chunks means an empty string.
pub fn format_context(chunks: &[RetrievalResult], format: ContextFormat) -> String {
    let mut out = String::new();
    for (path, members) in group_by_file(chunks) {
        match format {
            ContextFormat::Compact => {
                let _ = writeln!(out, "## {path}");
                for chunk in members {
                    out.push_str(chunk.text.trim_end());
                    out.push_str("\n\n");
                }
            }
            ContextFormat::Detailed => {
                let _ = writeln!(out, "## {path}");
                for chunk in members {
                    let _ = writeln!(
                        out,
                        "### Chunk {} (relevance: {:.2})",
                        chunk.chunk_ordinal, chunk.score
                    );
                    out.push_str(chunk.text.trim_end());
                    out.push_str("\n\n");
                }
            }
            ContextFormat::CodeOnly => {
                let _ = writeln!(out, "```{}", language_tag(path));
                let body: Vec<&str> = members.iter().map(|c| c.text.trim_end()).collect();
                out.push_str(&body.join("\n\n"));
                out.push_str("\n```\n\n");
            }
        }
    }
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out
}
