use anyhow::Result;
use tracing::{debug, info};

use crate::chain_session::{SessionLookup, now_millis};
use crate::core::session::{ChainSession, GateScope, SessionBlueprint, SessionDecision, SessionStatus};
use crate::core::types::{
    DEFAULT_VERIFY_MAX_ITERATIONS, DEFAULT_VERIFY_TIMEOUT_MS, ParsedCommand, ShellVerifyConfig,
};
use crate::gate_review::GateReviewService;
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::error::PlanningError;
use crate::pipeline::response::ToolResponse;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Creates or resumes the chain session and attaches pending work.
///
/// Whether a submission needs a gate review is delegated to the enforcement
/// authority; the resulting review is persisted on the session.
pub struct SessionManagement;

impl Stage for SessionManagement {
    fn name(&self) -> &'static str {
        "session-management"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let requires_session = ctx
            .execution_plan
            .as_ref()
            .is_some_and(|plan| plan.requires_session);
        let lookup = ctx.state.session.lookup.take();
        if !requires_session && lookup.is_none() {
            return Ok(());
        }

        let session_hit = lookup.as_ref().is_some_and(SessionLookup::session_hit);
        let decision = SessionDecision::resolve(
            ctx.request.force_restart,
            session_hit,
            lookup.is_some() && !session_hit,
        );
        let mut session = match lookup {
            Some(found) if decision.is_resume() => found.session,
            _ => create_session(ctx, services, decision)?,
        };
        ctx.state.session.decision = Some(decision);
        info!(
            ?decision,
            session_id = %session.session_id,
            chain_id = %session.chain_id,
            step = session.current_step(),
            "session resolved"
        );

        if !session.is_active() {
            ctx.response = Some(ToolResponse::text(render_inactive(&session)));
            ctx.session = Some(session);
            return Ok(());
        }

        if decision.is_resume() {
            let submitted = ctx.request.user_response.is_some() || ctx.request.gate_verdict.is_some();
            if submitted && !session.has_pending_work() {
                let step = session.current_step();
                let lookup = services.gate_lookup(std::slice::from_ref(&ctx.state.lifecycle.scope_id));
                let gates = GateReviewService::resolve_gates(
                    &ctx.state.gates.accumulator,
                    &lookup,
                    ctx.step_gates(step),
                );
                if let Some(review) = services.reviews.open_review(&gates, step, now_millis()) {
                    session.pending_gate_review = Some(review);
                    ctx.state.session.review_opened = true;
                }
            }
        } else {
            ensure_verification(ctx, services, &mut session)?;
        }

        services.sessions.save(&session)?;
        ctx.session = Some(session);
        Ok(())
    }
}

fn create_session(
    ctx: &ExecutionContext,
    services: &EngineServices,
    decision: SessionDecision,
) -> Result<ChainSession> {
    let parsed = ctx.parsed_command.clone().ok_or(PlanningError::EmptyPlan)?;
    let scope = ctx.request.scope();
    let chain_scoped = scope == GateScope::Chain;
    let original_args = parsed.args.clone();
    let blueprint = SessionBlueprint {
        parsed_command: parsed,
        temporary_gates: if chain_scoped {
            ctx.request.requested_gates()
        } else {
            Vec::new()
        },
        client_gates: if chain_scoped {
            ctx.request.gates.clone()
        } else {
            Vec::new()
        },
        gate_scope: scope,
        api_validation: ctx.request.api_validation,
    };
    services.sessions.create(blueprint, original_args, decision)
}

fn render_inactive(session: &ChainSession) -> String {
    let progress = format!("{}/{}", session.completed_steps(), session.state.total_steps);
    let headline = match session.status {
        SessionStatus::Completed => format!("✓ Chain complete ({progress})"),
        SessionStatus::Aborted => format!("✗ Chain aborted ({progress})"),
        SessionStatus::Active => format!("Step {progress}"),
    };
    format!(
        "Chain {} has already finished.\n\n---\nSession ID: {}\nChain ID: {}\n{headline}\nNext: no `user_response` needed. Send `command` with `force_restart: true` to start a new run.",
        session.chain_id, session.session_id, session.chain_id
    )
}

/// Attach the shell verification for the session's current step, if its
/// command declares one and none is pending yet.
pub(super) fn ensure_verification(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    session: &mut ChainSession,
) -> Result<()> {
    if session.pending_shell_verification.is_some() || !session.is_active() {
        return Ok(());
    }
    let step = session.current_step();
    let Some(mut config) = verify_directive(&session.blueprint.parsed_command, step) else {
        return Ok(());
    };
    if config.preset.is_none() {
        let defaults = &services.config.verification;
        if config.max_iterations == DEFAULT_VERIFY_MAX_ITERATIONS {
            config.max_iterations = defaults.max_attempts;
        }
        if config.timeout == DEFAULT_VERIFY_TIMEOUT_MS {
            config.timeout = defaults.timeout_ms;
        }
    }
    if config.original_goal.is_none() {
        config.original_goal = Some(format!(
            "Step {step} of {}: {}",
            session.chain_id,
            session.blueprint.parsed_command.raw.trim()
        ));
    }
    let pending = services.verification.begin(session, config, step)?;
    debug!(step, "verification attached");
    session.pending_shell_verification = Some(pending);
    ctx.state.session.verification_started = true;
    Ok(())
}

/// The step's own `verify:` directive, else the command-level one on the
/// final step.
fn verify_directive(parsed: &ParsedCommand, step: u32) -> Option<ShellVerifyConfig> {
    parsed
        .steps
        .iter()
        .find(|s| s.step_number == step)
        .and_then(|s| s.inline_gates.shell_verify.clone())
        .or_else(|| {
            (step == parsed.total_steps())
                .then(|| parsed.command_gates.shell_verify.clone())
                .flatten()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ArgMap, CommandType, InlineGates, ParseFormat, ParsedStep};

    fn command(step_verify: Option<u32>, command_verify: bool) -> ParsedCommand {
        let steps = (1..=3)
            .map(|n| {
                let mut step = ParsedStep::new(n, format!("p{n}"), ArgMap::new());
                if step_verify == Some(n) {
                    step.inline_gates.shell_verify = Some(ShellVerifyConfig::new("make lint"));
                }
                step
            })
            .collect();
        ParsedCommand {
            command_type: CommandType::Chain,
            format: ParseFormat::Symbolic,
            raw: ">>p1 --> >>p2 --> >>p3".to_string(),
            prompt_id: None,
            args: ArgMap::new(),
            steps,
            command_gates: InlineGates {
                shell_verify: command_verify.then(|| ShellVerifyConfig::new("cargo test")),
                ..InlineGates::default()
            },
            framework_override: None,
            style: None,
            modifiers: Vec::new(),
            operators: Vec::new(),
            confidence: 1.0,
            warnings: Vec::new(),
            promoted_from_single: false,
            resolved_gate_ids: Vec::new(),
        }
    }

    #[test]
    fn command_level_verify_applies_to_final_step_only() {
        let parsed = command(None, true);
        assert!(verify_directive(&parsed, 1).is_none());
        assert_eq!(
            verify_directive(&parsed, 3).map(|c| c.command),
            Some("cargo test".to_string())
        );
    }

    #[test]
    fn step_verify_wins_on_its_step() {
        let parsed = command(Some(2), true);
        assert_eq!(
            verify_directive(&parsed, 2).map(|c| c.command),
            Some("make lint".to_string())
        );
        assert!(verify_directive(&parsed, 1).is_none());
    }
}
