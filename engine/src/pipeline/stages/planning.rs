use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use super::gates::aggregate_gates;
use super::step_metadata;
use crate::core::frameworks::find_framework;
use crate::core::gates::{GateAccumulator, GateSource};
use crate::core::types::{
    CommandType, ExecutionModifier, ExecutionPlan, ExecutionStrategy, PromptDefinition,
};
use crate::gate_review::GateReviewService;
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::error::PlanningError;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Builds one [`ExecutionPlan`] per step plus the aggregate plan, then
/// freezes the gate set.
///
/// Methodology gates join the plan only for steps that need a framework and
/// only while `gates.methodology_gates` is enabled.
pub struct ExecutionPlanning;

impl Stage for ExecutionPlanning {
    fn name(&self) -> &'static str {
        "execution-planning"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let Some(parsed) = ctx.parsed_command.as_mut() else {
            return Err(PlanningError::EmptyPlan.into());
        };
        if parsed.prompt_id.is_none() && parsed.steps.is_empty() {
            return Err(PlanningError::EmptyPlan.into());
        }

        let clean = parsed.has_modifier(ExecutionModifier::Clean);
        let lean = parsed.has_modifier(ExecutionModifier::Lean);
        let guided = parsed.has_modifier(ExecutionModifier::Guided);
        let framework_id = parsed
            .framework_override
            .clone()
            .unwrap_or_else(|| services.frameworks.active_id());
        let strategy = match parsed.command_type {
            CommandType::Single => ExecutionStrategy::Single,
            CommandType::Chain => ExecutionStrategy::Chain,
        };
        let stored = ctx.state.session.lookup.as_ref().map(|l| &l.session.blueprint);
        let api_validation =
            ctx.request.api_validation || stored.is_some_and(|b| b.api_validation);
        let accumulator = &mut ctx.state.gates.accumulator;

        if !clean
            && parsed.command_type == CommandType::Chain
            && let Some(chain) = parsed.prompt_id.as_deref().and_then(|id| services.catalog.get(id))
        {
            accumulator.add_all(chain.chain_gates.iter(), GateSource::ChainLevel);
        }

        let steps = parsed.effective_steps().into_owned();
        let mut prompts: Vec<(u32, &PromptDefinition, bool)> = Vec::with_capacity(steps.len());
        for step in &steps {
            let prompt = services.catalog.get(&step.prompt_id).ok_or_else(|| {
                PlanningError::UnknownStepPrompt {
                    step: step.step_number,
                    prompt_id: step.prompt_id.clone(),
                }
            })?;
            let requires_framework = !clean
                && !lean
                && (prompt.needs_framework() || parsed.framework_override.is_some() || guided);
            if !clean {
                let metadata = step_metadata(step.step_number);
                for gate in services
                    .gate_registry
                    .auto_for(&prompt.category, Some(&framework_id))
                {
                    accumulator.add_with_metadata(&gate.id, GateSource::RegistryAuto, metadata.clone());
                }
                for id in &prompt.gates.include {
                    accumulator.add_with_metadata(id, GateSource::PromptConfig, metadata.clone());
                }
                if requires_framework
                    && services.config.gates.methodology_gates
                    && prompt.gates.framework_gates
                    && let Some(framework) = find_framework(&framework_id)
                {
                    for id in framework.gate_ids {
                        accumulator.add_with_metadata(id, GateSource::Methodology, metadata.clone());
                    }
                }
            }
            prompts.push((step.step_number, prompt, requires_framework));
        }

        let explicit_gates = accumulator
            .get_entries()
            .iter()
            .any(|e| e.priority >= GateSource::TemporaryRequest.priority());
        let requires_session = parsed.command_type == CommandType::Chain
            || explicit_gates
            || parsed.shell_verify().is_some()
            || ctx.request.chain_id.is_some();

        let mut step_plans = BTreeMap::new();
        for (step, prompt, requires_framework) in prompts {
            let gates = planned_gates(accumulator, step, &prompt.gates.exclude);
            step_plans.insert(
                step,
                ExecutionPlan {
                    strategy,
                    gates,
                    requires_framework,
                    requires_session,
                    framework_override: parsed.framework_override.clone(),
                    api_validation,
                },
            );
        }
        if parsed.command_type == CommandType::Chain {
            for step in &mut parsed.steps {
                step.plan = step_plans.get(&step.step_number).cloned();
            }
        }

        let plan = ExecutionPlan {
            strategy,
            gates: aggregate_gates(step_plans.values()),
            requires_framework: step_plans.values().any(|p| p.requires_framework),
            requires_session,
            framework_override: parsed.framework_override.clone(),
            api_validation,
        };
        debug!(
            ?strategy,
            gates = plan.gates.len(),
            requires_framework = plan.requires_framework,
            requires_session,
            "execution planned"
        );
        accumulator.freeze();
        ctx.state.gates.step_plans = step_plans;
        ctx.execution_plan = Some(plan);
        Ok(())
    }
}

/// Gate ids for `step`, minus the prompt's excludes. Explicitly requested
/// gates cannot be excluded.
fn planned_gates(accumulator: &GateAccumulator, step: u32, exclude: &[String]) -> Vec<String> {
    GateReviewService::step_gate_ids(accumulator, step)
        .into_iter()
        .filter(|id| {
            !exclude.contains(id)
                || accumulator
                    .get(id)
                    .is_some_and(|e| e.priority >= GateSource::TemporaryRequest.priority())
        })
        .collect()
}
