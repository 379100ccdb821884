use anyhow::Result;
use tracing::debug;

use super::step_metadata;
use crate::core::gates::{GateGuidance, GateSource, inline_gate_definitions};
use crate::core::types::{ExecutionModifier, ExecutionPlan};
use crate::pipeline::context::{ExecutionContext, GateState};
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Materialises `::` criteria and request gates into the accumulator.
///
/// Inline and temporary definitions are registered under the invocation
/// scope; ids are deterministic, so a resumed chain re-creates the same set.
pub struct InlineGateExtraction;

impl Stage for InlineGateExtraction {
    fn name(&self) -> &'static str {
        "inline-gate-extraction"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let scope = ctx.state.lifecycle.scope_id.clone();
        let Some(parsed) = ctx.parsed_command.as_mut() else {
            return Ok(());
        };
        let accumulator = &mut ctx.state.gates.accumulator;

        for step in &mut parsed.steps {
            let metadata = step_metadata(step.step_number);
            let label = format!("step{}", step.step_number);
            let mut ids: Vec<String> = Vec::new();
            for gate in inline_gate_definitions(&label, &step.inline_gates) {
                accumulator.add_with_metadata(&gate.id, GateSource::InlineOperator, metadata.clone());
                ids.push(gate.id.clone());
                services.temporary_gates.register(&scope, gate);
            }
            for reference in &step.inline_gates.references {
                if services.gate_registry.contains(reference) {
                    accumulator.add_with_metadata(reference, GateSource::InlineOperator, metadata.clone());
                    ids.push(reference.clone());
                }
            }
            for id in ids {
                if !step.resolved_gate_ids.contains(&id) {
                    step.resolved_gate_ids.push(id);
                }
            }
        }

        let mut command_ids: Vec<String> = Vec::new();
        for gate in inline_gate_definitions("cmd", &parsed.command_gates) {
            accumulator.add(&gate.id, GateSource::InlineOperator);
            command_ids.push(gate.id.clone());
            services.temporary_gates.register(&scope, gate);
        }
        for reference in &parsed.command_gates.references {
            if services.gate_registry.contains(reference) {
                accumulator.add(reference, GateSource::InlineOperator);
                command_ids.push(reference.clone());
            }
        }
        for id in command_ids {
            if !parsed.resolved_gate_ids.contains(&id) {
                parsed.resolved_gate_ids.push(id);
            }
        }

        let stored = ctx.state.session.lookup.as_ref().map(|l| &l.session.blueprint);
        let requested = ctx
            .request
            .requested_gates()
            .into_iter()
            .chain(stored.map(|b| b.temporary_gates.clone()).unwrap_or_default());
        for gate in requested {
            accumulator.add(&gate.id, GateSource::TemporaryRequest);
            services.temporary_gates.register(&scope, gate);
        }

        let lookup = services.gate_lookup(std::slice::from_ref(&scope));
        let selected: Vec<String> = ctx
            .request
            .gates
            .iter()
            .chain(stored.map(|b| b.client_gates.as_slice()).unwrap_or_default())
            .cloned()
            .collect();
        for id in selected {
            if lookup.get(&id).is_some() {
                accumulator.add(&id, GateSource::ClientSelection);
            } else {
                ctx.state
                    .session
                    .notices
                    .push(format!("Unknown gate `{id}` ignored."));
            }
        }

        debug!(gates = accumulator.len(), "inline and request gates collected");
        Ok(())
    }
}

/// Renders per-step gate guidance from the frozen plan.
///
/// `%clean` suppresses guidance entirely. The plan itself is never edited
/// here; methodology gates were already filtered during planning.
pub struct GateEnhancement;

impl Stage for GateEnhancement {
    fn name(&self) -> &'static str {
        "gate-enhancement"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let Some(parsed) = ctx.parsed_command.as_ref() else {
            return Ok(());
        };
        if parsed.has_modifier(ExecutionModifier::Clean) {
            return Ok(());
        }
        let lookup = services.gate_lookup(std::slice::from_ref(&ctx.state.lifecycle.scope_id));

        let GateState {
            step_plans,
            guidance,
            ..
        } = &mut ctx.state.gates;
        for (step, plan) in &*step_plans {
            let text = lookup.enhance("", &plan.gates);
            let text = text.trim();
            if !text.is_empty() {
                guidance.insert(*step, text.to_string());
            }
        }
        debug!(steps = guidance.len(), "gate guidance rendered");
        Ok(())
    }
}

/// Union of the plans' gate ids, first occurrence order.
pub(super) fn aggregate_gates<'a>(plans: impl Iterator<Item = &'a ExecutionPlan>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for plan in plans {
        for id in &plan.gates {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
    }
    out
}
