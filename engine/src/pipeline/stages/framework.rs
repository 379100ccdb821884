use anyhow::Result;
use tracing::{debug, info};

use crate::core::decisions::{DecisionInput, DecisionSource, FrameworkDecision, render_judge_menu};
use crate::core::frameworks::find_framework;
use crate::pipeline::context::{CleanupAction, ExecutionContext};
use crate::pipeline::error::PlanningError;
use crate::pipeline::response::ToolResponse;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Decides once whether a methodology is injected; `%judge` answers with the
/// selection menu instead of running anything.
pub struct JudgeDecision;

impl Stage for JudgeDecision {
    fn name(&self) -> &'static str {
        "judge-decision"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let (Some(parsed), Some(plan)) = (ctx.parsed_command.as_ref(), ctx.execution_plan.as_ref())
        else {
            return Ok(());
        };
        let active_id = services.frameworks.active_id();
        let decision = ctx.state.framework.authority.decide(DecisionInput {
            frameworks_enabled: services.frameworks.enabled(),
            modifiers: &parsed.modifiers,
            framework_override: parsed.framework_override.as_deref(),
            requires_framework: plan.requires_framework,
            active_id: &active_id,
        });
        debug!(?decision, "framework decision");
        if *decision == FrameworkDecision::Judge {
            let menu = render_judge_menu(
                &parsed.raw,
                services.frameworks.list(),
                services.gate_registry.all(),
            );
            ctx.response = Some(ToolResponse::text(menu));
        }
        Ok(())
    }
}

/// Resolves the injected framework; an `@` override becomes the active
/// framework until cleanup restores the previous one.
pub struct FrameworkResolution;

impl Stage for FrameworkResolution {
    fn name(&self) -> &'static str {
        "framework-resolution"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        ctx.state.framework.frequency = services.config.frameworks.injection;
        let Some(FrameworkDecision::Inject {
            framework_id,
            source,
        }) = ctx.state.framework.authority.cached().cloned()
        else {
            return Ok(());
        };
        let framework = find_framework(&framework_id).ok_or_else(|| {
            PlanningError::UnknownFramework {
                id: framework_id.clone(),
                available: services
                    .frameworks
                    .list()
                    .iter()
                    .map(|f| format!("@{}", f.id))
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })?;
        if source == DecisionSource::Override
            && let Some(previous) = services.frameworks.switch(framework.id)
        {
            info!(from = %previous, to = framework.id, "framework override active");
            ctx.state
                .lifecycle
                .cleanup
                .push(CleanupAction::RestoreFramework(previous));
        }
        ctx.state.framework.injection = Some(framework.injection());
        ctx.state.framework.framework_id = Some(framework.id.to_string());
        Ok(())
    }
}

/// Decides whether the methodology block is repeated on the current step.
pub struct InjectionFrequency;

impl Stage for InjectionFrequency {
    fn name(&self) -> &'static str {
        "injection-frequency"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let step = ctx.current_step();
        refresh_injection(ctx, services, step);
        Ok(())
    }
}

/// Per-step methodology reminder for steps whose plan requires a framework.
pub struct PromptGuidance;

impl Stage for PromptGuidance {
    fn name(&self) -> &'static str {
        "prompt-guidance"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        let step = ctx.current_step();
        refresh_guidance(ctx, step);
        Ok(())
    }
}

pub(super) fn refresh_injection(ctx: &mut ExecutionContext, services: &EngineServices, step: u32) {
    let framework = &mut ctx.state.framework;
    framework.inject_current = framework.injection.is_some()
        && framework
            .frequency
            .should_inject(step, services.config.frameworks.interval);
    debug!(step, inject = framework.inject_current, "injection frequency");
}

pub(super) fn refresh_guidance(ctx: &mut ExecutionContext, step: u32) {
    let guidance = if ctx.step_requires_framework(step) {
        ctx.state
            .framework
            .framework_id
            .as_deref()
            .and_then(find_framework)
            .map(|f| f.step_guidance())
    } else {
        None
    };
    ctx.state.framework.step_guidance = guidance;
}
