//! Materialise `::` criteria and request-supplied checks as gate definitions.
//!
//! Ids are derived from position and name only, so re-materialising the same
//! command on a later invocation yields the same ids.

use crate::core::types::InlineGates;

use super::definition::{GateActivation, GateCategory, GateDefinition, GateKind, PassCriterion};

/// Lowercase id fragment: alphanumerics kept, everything else collapsed to `-`.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Blocking self-review gate judged by the caller.
pub fn self_review_gate(id: String, name: String, criteria: Vec<String>, blocking: bool) -> GateDefinition {
    GateDefinition {
        id,
        name,
        kind: GateKind::Validation,
        category: GateCategory::Custom,
        guidance: String::new(),
        criteria: criteria
            .into_iter()
            .map(|criteria| PassCriterion::SelfReview { criteria })
            .collect(),
        blocking,
        activation: GateActivation::default(),
    }
}

/// Definitions for the free-text and named criteria of one `::` attachment.
///
/// `label` distinguishes attachments (`step2`, `cmd`). Shell verification and
/// bare references are not materialised here.
pub fn inline_gate_definitions(label: &str, gates: &InlineGates) -> Vec<GateDefinition> {
    let free = gates.criteria.iter().enumerate().map(|(i, text)| {
        self_review_gate(
            format!("inline-{label}-{}", i + 1),
            format!("Inline criterion {}", i + 1),
            vec![text.clone()],
            true,
        )
    });
    let named = gates.named.iter().map(|named| {
        let slug = slugify(&named.name);
        self_review_gate(
            format!("inline-{label}-{slug}"),
            named.name.clone(),
            vec![named.criteria.clone()],
            true,
        )
    });
    free.chain(named).collect()
}
