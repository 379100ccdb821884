//! Indexed view over the prompt definitions known to one invocation.

use std::collections::HashMap;

use crate::core::types::PromptDefinition;

/// How a prompt reference was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
}

#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    prompts: Vec<PromptDefinition>,
    by_id: HashMap<String, usize>,
    by_folded: HashMap<String, usize>,
}

impl PromptCatalog {
    pub fn new(prompts: Vec<PromptDefinition>) -> Self {
        let mut by_id = HashMap::new();
        let mut by_folded = HashMap::new();
        for (idx, prompt) in prompts.iter().enumerate() {
            by_id.entry(prompt.id.clone()).or_insert(idx);
            by_folded.entry(prompt.id.to_lowercase()).or_insert(idx);
            if !prompt.name.is_empty() {
                by_folded.entry(prompt.name.to_lowercase()).or_insert(idx);
            }
        }
        Self {
            prompts,
            by_id,
            by_folded,
        }
    }

    pub fn get(&self, id: &str) -> Option<&PromptDefinition> {
        self.by_id.get(id).map(|&idx| &self.prompts[idx])
    }

    /// Resolve by exact id first, then case-insensitively by id or name.
    pub fn resolve(&self, reference: &str) -> Option<(&PromptDefinition, MatchKind)> {
        if let Some(prompt) = self.get(reference) {
            return Some((prompt, MatchKind::Exact));
        }
        self.by_folded
            .get(&reference.to_lowercase())
            .map(|&idx| (&self.prompts[idx], MatchKind::CaseInsensitive))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.prompts.iter().map(|p| p.id.as_str())
    }

    pub fn all(&self) -> &[PromptDefinition] {
        &self.prompts
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}
