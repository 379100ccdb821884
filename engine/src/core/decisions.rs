//! Framework decision authority.
//!
//! Resolves once per invocation whether a methodology is injected, skipped,
//! or whether the caller is asked to choose (judge flow). The verdict is
//! cached so every later stage reads the same answer.

use std::cell::OnceCell;

use serde::Serialize;

use crate::core::frameworks::FrameworkDefinition;
use crate::core::gates::GateDefinition;
use crate::core::types::ExecutionModifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    Override,
    Modifier,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum FrameworkDecision {
    Inject {
        framework_id: String,
        source: DecisionSource,
    },
    Skip {
        reason: &'static str,
    },
    Judge,
}

impl FrameworkDecision {
    pub fn framework_id(&self) -> Option<&str> {
        match self {
            Self::Inject { framework_id, .. } => Some(framework_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub frameworks_enabled: bool,
    pub modifiers: &'a [ExecutionModifier],
    pub framework_override: Option<&'a str>,
    pub requires_framework: bool,
    pub active_id: &'a str,
}

#[derive(Debug, Default)]
pub struct FrameworkDecisionAuthority {
    decision: OnceCell<FrameworkDecision>,
}

impl FrameworkDecisionAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide on first call; later calls return the cached decision.
    pub fn decide(&self, input: DecisionInput<'_>) -> &FrameworkDecision {
        self.decision.get_or_init(|| decide(input))
    }

    pub fn cached(&self) -> Option<&FrameworkDecision> {
        self.decision.get()
    }
}

fn decide(input: DecisionInput<'_>) -> FrameworkDecision {
    let has = |m: ExecutionModifier| input.modifiers.contains(&m);
    if has(ExecutionModifier::Judge) {
        return FrameworkDecision::Judge;
    }
    if has(ExecutionModifier::Clean) {
        return FrameworkDecision::Skip {
            reason: "%clean modifier",
        };
    }
    if has(ExecutionModifier::Lean) {
        return FrameworkDecision::Skip {
            reason: "%lean modifier",
        };
    }
    if let Some(id) = input.framework_override {
        return FrameworkDecision::Inject {
            framework_id: id.to_string(),
            source: DecisionSource::Override,
        };
    }
    if has(ExecutionModifier::Guided) {
        return FrameworkDecision::Inject {
            framework_id: input.active_id.to_string(),
            source: DecisionSource::Modifier,
        };
    }
    if !input.frameworks_enabled {
        return FrameworkDecision::Skip {
            reason: "frameworks disabled",
        };
    }
    if !input.requires_framework {
        return FrameworkDecision::Skip {
            reason: "prompt does not require a framework",
        };
    }
    FrameworkDecision::Inject {
        framework_id: input.active_id.to_string(),
        source: DecisionSource::Active,
    }
}

/// Menu returned by `%judge`: available methodologies and gates, plus how to re-issue.
pub fn render_judge_menu(
    command: &str,
    frameworks: &[FrameworkDefinition],
    gates: &[GateDefinition],
) -> String {
    let mut out = String::from("## Execution Options\n\nChoose a methodology and quality gates for this command.\n\n### Frameworks\n");
    for framework in frameworks {
        out.push_str(&format!("- `@{}`: {}\n", framework.id, framework.summary));
    }
    out.push_str("\n### Gates\n");
    for gate in gates {
        let first_line = gate.guidance.lines().next().unwrap_or_default();
        out.push_str(&format!("- `{}`: {first_line}\n", gate.id));
    }
    let bare = command
        .split_whitespace()
        .filter(|t| !t.eq_ignore_ascii_case("%judge"))
        .collect::<Vec<_>>()
        .join(" ");
    out.push_str(&format!(
        "\nRe-issue the command with your choices, for example:\n\n```\n@<Framework> {bare} :: <gate-id>\n```\n"
    ));
    out
}
