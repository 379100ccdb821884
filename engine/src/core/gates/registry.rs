//! Built-in gate registry, scoped temporary gates and gate guidance.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::definition::{
    GateActivation, GateCategory, GateDefinition, GateKind, PassCriterion,
};

/// Registered gate definitions, built-ins first.
#[derive(Debug, Clone)]
pub struct GateRegistry {
    gates: Vec<GateDefinition>,
}

impl Default for GateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl GateRegistry {
    pub fn with_builtins() -> Self {
        Self {
            gates: builtin_gates(),
        }
    }

    pub fn empty() -> Self {
        Self { gates: Vec::new() }
    }

    /// Register or replace a definition by id.
    pub fn register(&mut self, gate: GateDefinition) {
        match self.gates.iter_mut().find(|g| g.id == gate.id) {
            Some(existing) => *existing = gate,
            None => self.gates.push(gate),
        }
    }

    pub fn get(&self, id: &str) -> Option<&GateDefinition> {
        self.gates.iter().find(|g| g.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn all(&self) -> &[GateDefinition] {
        &self.gates
    }

    /// Gates whose activation rules select the given prompt category.
    ///
    /// Gates without category restrictions are never auto-selected.
    pub fn auto_for(&self, category: &str, framework: Option<&str>) -> Vec<&GateDefinition> {
        self.gates
            .iter()
            .filter(|g| g.category != GateCategory::Methodology)
            .filter(|g| !g.activation.prompt_categories.is_empty())
            .filter(|g| g.activation.matches(category, framework))
            .collect()
    }
}

fn builtin(
    id: &str,
    name: &str,
    category: GateCategory,
    guidance: &str,
    review: &str,
    categories: &[&str],
) -> GateDefinition {
    GateDefinition {
        id: id.to_string(),
        name: name.to_string(),
        kind: GateKind::Validation,
        category,
        guidance: guidance.to_string(),
        criteria: vec![PassCriterion::SelfReview {
            criteria: review.to_string(),
        }],
        blocking: false,
        activation: GateActivation {
            prompt_categories: categories.iter().map(|c| (*c).to_string()).collect(),
            frameworks: Vec::new(),
        },
    }
}

fn builtin_gates() -> Vec<GateDefinition> {
    vec![
        builtin(
            "code-quality",
            "Code Quality",
            GateCategory::Quality,
            "Prefer small, readable units with explicit error handling.",
            "Code compiles in principle, handles errors, and avoids dead or duplicated logic.",
            &["code", "development"],
        ),
        builtin(
            "security-awareness",
            "Security Awareness",
            GateCategory::Security,
            "Treat all external input as untrusted.",
            "No secrets in output; inputs are validated; injection risks are addressed.",
            &["code", "development", "security"],
        ),
        builtin(
            "content-structure",
            "Content Structure",
            GateCategory::Quality,
            "Organise the answer with headings and short paragraphs.",
            "Clear sections, a logical flow and a concise summary.",
            &["content", "documentation", "writing"],
        ),
        builtin(
            "technical-accuracy",
            "Technical Accuracy",
            GateCategory::Quality,
            "State facts precisely and flag uncertainty.",
            "Claims are correct, terminology is precise, and assumptions are stated.",
            &["analysis", "code", "research"],
        ),
        builtin(
            "research-quality",
            "Research Quality",
            GateCategory::Quality,
            "Support conclusions with evidence.",
            "Sources are cited or named, competing views are weighed, conclusions follow from evidence.",
            &["research"],
        ),
        builtin(
            "framework-compliance",
            "Framework Compliance",
            GateCategory::Methodology,
            "Follow every phase of the active methodology.",
            "Each phase of the active methodology is visibly addressed in order.",
            &[],
        ),
    ]
}

/// Gates registered for the lifetime of an execution or chain scope.
#[derive(Debug, Default)]
pub struct TemporaryGateRegistry {
    scopes: Mutex<HashMap<String, Vec<GateDefinition>>>,
}

impl TemporaryGateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under `scope`, replacing any with the same id.
    pub fn register(&self, scope: &str, gate: GateDefinition) {
        let Ok(mut scopes) = self.scopes.lock() else {
            warn!(scope, "temporary gate registry poisoned; registration dropped");
            return;
        };
        let gates = scopes.entry(scope.to_string()).or_default();
        match gates.iter_mut().find(|g| g.id == gate.id) {
            Some(existing) => *existing = gate,
            None => gates.push(gate),
        }
    }

    /// Look up `id` in the given scopes, first match wins.
    pub fn get(&self, scopes: &[String], id: &str) -> Option<GateDefinition> {
        let guard = self.scopes.lock().ok()?;
        scopes
            .iter()
            .filter_map(|scope| guard.get(scope))
            .find_map(|gates| gates.iter().find(|g| g.id == id).cloned())
    }

    pub fn scope_gates(&self, scope: &str) -> Vec<GateDefinition> {
        self.scopes
            .lock()
            .ok()
            .and_then(|s| s.get(scope).cloned())
            .unwrap_or_default()
    }

    /// Remove every gate registered under `scope`; returns how many were removed.
    pub fn cleanup_scope(&self, scope: &str) -> usize {
        let removed = match self.scopes.lock() {
            Ok(mut scopes) => scopes.remove(scope).map(|g| g.len()).unwrap_or(0),
            Err(_) => 0,
        };
        debug!(scope, removed, "temporary gate scope cleaned up");
        removed
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Injects gate guidance into prompt text.
pub trait GateGuidance {
    fn enhance(&self, prompt: &str, gate_ids: &[String]) -> String;
}

/// Resolves gate ids against the registry and the active temporary scopes.
pub struct GateLookup<'a> {
    registry: &'a GateRegistry,
    temporary: &'a TemporaryGateRegistry,
    scopes: Vec<String>,
}

impl<'a> GateLookup<'a> {
    pub fn new(
        registry: &'a GateRegistry,
        temporary: &'a TemporaryGateRegistry,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            registry,
            temporary,
            scopes,
        }
    }

    /// Temporary definitions shadow registry ones with the same id.
    pub fn get(&self, id: &str) -> Option<GateDefinition> {
        self.temporary
            .get(&self.scopes, id)
            .or_else(|| self.registry.get(id).cloned())
    }

    pub fn resolve_all(&self, ids: &[String]) -> Vec<GateDefinition> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }
}

impl GateGuidance for GateLookup<'_> {
    fn enhance(&self, prompt: &str, gate_ids: &[String]) -> String {
        let gates = self.resolve_all(gate_ids);
        if gates.is_empty() {
            return prompt.to_string();
        }
        let mut out = prompt.trim_end().to_string();
        out.push_str("\n\n## Quality Gates\n");
        for gate in &gates {
            out.push_str(&format!("\n- {}", gate.review_prompt().replace('\n', "\n  ")));
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_gate(id: &str) -> GateDefinition {
        GateDefinition {
            id: id.to_string(),
            name: id.to_string(),
            kind: GateKind::Validation,
            category: GateCategory::Custom,
            guidance: String::new(),
            criteria: vec![PassCriterion::SelfReview {
                criteria: "be terse".to_string(),
            }],
            blocking: true,
            activation: GateActivation::default(),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = GateRegistry::with_builtins();
        for id in [
            "code-quality",
            "security-awareness",
            "content-structure",
            "technical-accuracy",
            "research-quality",
            "framework-compliance",
        ] {
            assert!(registry.contains(id), "missing {id}");
        }
    }

    #[test]
    fn auto_selection_uses_prompt_category() {
        let registry = GateRegistry::with_builtins();
        let ids: Vec<&str> = registry
            .auto_for("code", None)
            .into_iter()
            .map(|g| g.id.as_str())
            .collect();
        assert!(ids.contains(&"code-quality"));
        assert!(ids.contains(&"security-awareness"));
        assert!(!ids.contains(&"framework-compliance"));
        assert!(registry.auto_for("general", None).is_empty());
    }

    #[test]
    fn temporary_scope_lookup_and_cleanup() {
        let temp = TemporaryGateRegistry::new();
        temp.register("exec-1", temp_gate("inline-1"));
        temp.register("exec-2", temp_gate("inline-1"));

        let scopes = vec!["exec-1".to_string()];
        assert!(temp.get(&scopes, "inline-1").is_some());
        assert_eq!(temp.scope_gates("exec-2").len(), 1);
        assert_eq!(temp.cleanup_scope("exec-1"), 1);
        assert!(temp.get(&scopes, "inline-1").is_none());
        assert_eq!(temp.scope_count(), 1);
    }

    #[test]
    fn enhance_appends_gate_section() {
        let registry = GateRegistry::with_builtins();
        let temp = TemporaryGateRegistry::new();
        temp.register("s", temp_gate("inline-1"));
        let lookup = GateLookup::new(&registry, &temp, vec!["s".to_string()]);
        let text = lookup.enhance(
            "Write the function.",
            &["code-quality".to_string(), "inline-1".to_string(), "unknown".to_string()],
        );
        assert!(text.starts_with("Write the function."));
        assert!(text.contains("## Quality Gates"));
        assert!(text.contains("Code Quality"));
        assert!(text.contains("be terse"));
    }
}
