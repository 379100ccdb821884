//! Prompt definition store.
//!
//! Definitions live in `*.toml` (`[[prompt]]` tables) or `*.json` (an array,
//! or `{"prompts": [...]}`) files under the configured prompts directory.
//! Keys use the camelCase names of [`PromptDefinition`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::types::PromptDefinition;

/// Source of prompt definitions for the parser catalog.
pub trait PromptStore: Send + Sync {
    fn load_and_convert_prompts(&self) -> Result<Vec<PromptDefinition>>;
}

#[derive(Debug, Clone)]
pub struct FilePromptStore {
    dir: PathBuf,
}

impl FilePromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Debug, Deserialize)]
struct TomlPromptFile {
    #[serde(default)]
    prompt: Vec<PromptDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonPromptFile {
    List(Vec<PromptDefinition>),
    Wrapped { prompts: Vec<PromptDefinition> },
}

impl PromptStore for FilePromptStore {
    fn load_and_convert_prompts(&self) -> Result<Vec<PromptDefinition>> {
        if !self.dir.exists() {
            warn!(dir = %self.dir.display(), "prompts directory missing; no prompts loaded");
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("read {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("toml" | "json")
                    )
            })
            .collect();
        files.sort();

        let mut seen = HashSet::new();
        let mut prompts = Vec::new();
        for path in files {
            for prompt in read_prompt_file(&path)? {
                if prompt.id.trim().is_empty() {
                    return Err(anyhow!("prompt with empty id in {}", path.display()));
                }
                if !seen.insert(prompt.id.clone()) {
                    warn!(id = %prompt.id, file = %path.display(), "duplicate prompt id ignored");
                    continue;
                }
                prompts.push(prompt);
            }
        }
        debug!(count = prompts.len(), dir = %self.dir.display(), "prompts loaded");
        Ok(prompts)
    }
}

fn read_prompt_file(path: &Path) -> Result<Vec<PromptDefinition>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let file: JsonPromptFile =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        return Ok(match file {
            JsonPromptFile::List(prompts) | JsonPromptFile::Wrapped { prompts } => prompts,
        });
    }
    let file: TomlPromptFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(file.prompt)
}

/// In-memory store, used by tests and embedders that build definitions in code.
#[derive(Debug, Clone, Default)]
pub struct StaticPromptStore {
    prompts: Vec<PromptDefinition>,
}

impl StaticPromptStore {
    pub fn new(prompts: Vec<PromptDefinition>) -> Self {
        Self { prompts }
    }
}

impl PromptStore for StaticPromptStore {
    fn load_and_convert_prompts(&self) -> Result<Vec<PromptDefinition>> {
        Ok(self.prompts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_and_json_files_in_name_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("a.toml"),
            r#"
[[prompt]]
id = "summarize"
category = "analysis"
userMessageTemplate = "Summarize {{ input }}"

[[prompt.arguments]]
name = "input"
required = true

[[prompt]]
id = "research"
chainSteps = [{ promptId = "summarize" }, { promptId = "critique" }]
"#,
        )
        .expect("write toml");
        fs::write(
            temp.path().join("b.json"),
            r#"{"prompts": [{"id": "critique", "userMessageTemplate": "Critique {{ previous_step_output }}"},
                            {"id": "summarize", "userMessageTemplate": "dup"}]}"#,
        )
        .expect("write json");
        fs::write(temp.path().join("notes.md"), "ignored").expect("write md");

        let prompts = FilePromptStore::new(temp.path())
            .load_and_convert_prompts()
            .expect("load");
        let ids: Vec<&str> = prompts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["summarize", "research", "critique"]);
        assert!(prompts[0].arguments[0].required);
        assert_eq!(prompts[0].category, "analysis");
        assert!(prompts[1].is_chain());
        assert_eq!(prompts[2].category, "general");
    }

    #[test]
    fn missing_directory_yields_no_prompts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let prompts = FilePromptStore::new(temp.path().join("absent"))
            .load_and_convert_prompts()
            .expect("load");
        assert!(prompts.is_empty());
    }

    #[test]
    fn malformed_file_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("bad.toml"), "[[prompt]]\nid = ").expect("write");
        let err = FilePromptStore::new(temp.path())
            .load_and_convert_prompts()
            .expect_err("should fail");
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
