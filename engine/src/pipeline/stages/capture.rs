//! Stage 14: records the caller's response for the step that was presented
//! last time, settles pending reviews and verifications, and advances.

use anyhow::Result;
use tracing::{debug, info};

use super::framework::{refresh_guidance, refresh_injection};
use super::session::ensure_verification;
use crate::chain_session::{PlaceholderOutcome, now_millis};
use crate::core::gates::{CriterionOutcome, evaluate_gate};
use crate::core::review::{ActionOutcome, GateAction, render_review_escalation};
use crate::core::session::{ChainSession, PlaceholderSource};
use crate::core::verify::{self, AttemptOutcome};
use crate::gate_review::ReviewProgress;
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

pub struct ResponseCapture;

impl Stage for ResponseCapture {
    fn name(&self) -> &'static str {
        "response-capture"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        if !ctx.is_resume() {
            return Ok(());
        }
        let Some(mut session) = ctx.session.take() else {
            return Ok(());
        };
        let captured = capture(ctx, services, &mut session);
        let saved = services.sessions.save(&session);
        ctx.session = Some(session);
        captured?;
        saved
    }
}

fn capture(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    session: &mut ChainSession,
) -> Result<()> {
    if session.pending_shell_verification.is_some() {
        return settle_verification(ctx, services, session);
    }
    if session.pending_gate_review.is_some() {
        return settle_review(ctx, services, session);
    }
    if ctx.request.gate_verdict.is_some() {
        notice(ctx, "`gate_verdict` ignored: no gate review is pending.");
    }
    if ctx.request.gate_action.is_some() {
        notice(ctx, "`gate_action` ignored: nothing has escalated.");
    }

    match ctx.request.user_response.clone() {
        Some(response) => {
            services.sessions.capture(session, &response);
            let api_validation = ctx.execution_plan.as_ref().is_some_and(|p| p.api_validation);
            if api_validation && !validate_response(ctx, services, session.current_step(), &response) {
                return Ok(());
            }
            advance(ctx, services, session)
        }
        None => match services.sessions.resume_without_response(session) {
            PlaceholderOutcome::Advanced => after_advance(ctx, services, session),
            PlaceholderOutcome::Held => {
                notice(
                    ctx,
                    &format!(
                        "No `user_response` given; step {} stays current until its output is sent.",
                        session.current_step()
                    ),
                );
                Ok(())
            }
        },
    }
}

fn settle_verification(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    session: &mut ChainSession,
) -> Result<()> {
    let Some(mut pending) = session.pending_shell_verification.take() else {
        return Ok(());
    };
    if let Some(response) = ctx.request.user_response.clone() {
        services.sessions.capture(session, &response);
    }

    if pending.is_exhausted() {
        let Some(action) = ctx.request.gate_action else {
            ctx.state.session.feedback = Some(verify::render_escalation(&pending));
            session.pending_shell_verification = Some(pending);
            return Ok(());
        };
        match services.verification.apply_action(&mut pending, action)? {
            ActionOutcome::Reset => {
                notice(ctx, "Verification attempts reset; running the check again.");
            }
            ActionOutcome::Skipped => {
                notice(ctx, "Verification skipped; continuing with the current output.");
                services.sessions.skip_step(session, PlaceholderSource::VerificationSkip);
                return after_advance(ctx, services, session);
            }
            ActionOutcome::Aborted => {
                services.sessions.abort(session);
                notice(ctx, "Chain aborted at verification escalation.");
                return Ok(());
            }
        }
    } else if ctx.request.gate_action.is_some() {
        notice(ctx, "`gate_action` ignored: the verification has attempts left.");
    }

    let notes = ctx.request.user_response.as_deref();
    match services.verification.run_attempt(session, &mut pending, notes)? {
        AttemptOutcome::Passed => {
            notice(ctx, &verify::render_passed(&pending));
            let step = session.current_step();
            session.record_placeholder(step, PlaceholderSource::MissingResponse, now_millis());
            advance(ctx, services, session)
        }
        AttemptOutcome::Retry => {
            ctx.state.session.feedback = Some(verify::render_bounce_back(&pending));
            session.pending_shell_verification = Some(pending);
            Ok(())
        }
        AttemptOutcome::Escalated => {
            ctx.state.session.feedback = Some(verify::render_escalation(&pending));
            session.pending_shell_verification = Some(pending);
            Ok(())
        }
    }
}

fn settle_review(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    session: &mut ChainSession,
) -> Result<()> {
    let Some(mut review) = session.pending_gate_review.take() else {
        return Ok(());
    };
    let user_response = ctx.request.user_response.clone();
    if let Some(response) = &user_response {
        services.sessions.capture(session, response);
    }

    if review.is_exhausted() {
        let Some(action) = ctx.request.gate_action else {
            ctx.state.session.feedback = Some(render_review_escalation(&review));
            session.pending_gate_review = Some(review);
            return Ok(());
        };
        match services.reviews.act(&mut review, action) {
            ActionOutcome::Reset => {
                notice(ctx, "Gate review attempts reset; review the output again.");
                session.pending_gate_review = Some(review);
                return Ok(());
            }
            ActionOutcome::Skipped => {
                notice(ctx, "Gate review skipped; continuing with the current output.");
                services.sessions.skip_step(session, PlaceholderSource::GateSkip);
                return after_advance(ctx, services, session);
            }
            ActionOutcome::Aborted => {
                services.sessions.abort(session);
                notice(ctx, "Chain aborted at gate review escalation.");
                return Ok(());
            }
        }
    }
    if ctx.request.gate_action.is_some_and(|a| a != GateAction::Retry) {
        notice(ctx, "`gate_action` ignored: the review has attempts left.");
    }

    let progress = services.reviews.submit(
        &mut review,
        ctx.request.gate_verdict.as_deref(),
        user_response.as_deref(),
        now_millis(),
    );
    match progress {
        ReviewProgress::Passed(verdict) => {
            notice(ctx, &format!("Gate review passed: {}", verdict.rationale));
            let step = session.current_step();
            session.record_placeholder(step, PlaceholderSource::MissingResponse, now_millis());
            advance(ctx, services, session)
        }
        ReviewProgress::AwaitingVerdict | ReviewProgress::Retry(_) => {
            session.pending_gate_review = Some(review);
            Ok(())
        }
        ReviewProgress::Escalated(_) => {
            ctx.state.session.feedback = Some(render_review_escalation(&review));
            session.pending_gate_review = Some(review);
            Ok(())
        }
    }
}

/// Check a captured response against the step's auto-evaluable criteria.
///
/// Returns `false` when a blocking criterion failed; the step then stays
/// current with the failures as feedback.
fn validate_response(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    step: u32,
    response: &str,
) -> bool {
    let lookup = services.gate_lookup(std::slice::from_ref(&ctx.state.lifecycle.scope_id));
    let outcomes: Vec<CriterionOutcome> = lookup
        .resolve_all(ctx.step_gates(step))
        .iter()
        .flat_map(|gate| evaluate_gate(gate, response))
        .collect();
    let failed: Vec<&CriterionOutcome> = outcomes.iter().filter(|o| !o.passed).collect();
    let blocking = failed.iter().any(|o| o.blocking);
    debug!(step, checked = outcomes.len(), failed = failed.len(), blocking, "response validated");

    let lines: Vec<String> = failed
        .iter()
        .map(|o| format!("- `{}`: {}", o.gate_id, o.message))
        .collect();
    if blocking {
        ctx.state.session.feedback = Some(format!(
            "## Validation Failed (step {step})\n\n{}\n\nRevise the output and resend it as `user_response`.",
            lines.join("\n")
        ));
    } else if !lines.is_empty() {
        notice(ctx, &format!("Validation warnings:\n{}", lines.join("\n")));
    }
    ctx.state.gates.validation = outcomes;
    !blocking
}

fn advance(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    session: &mut ChainSession,
) -> Result<()> {
    services.sessions.advance(session);
    after_advance(ctx, services, session)
}

/// Re-derive step-dependent state for the step now current.
fn after_advance(
    ctx: &mut ExecutionContext,
    services: &EngineServices,
    session: &mut ChainSession,
) -> Result<()> {
    ctx.state.session.advanced = true;
    let step = session.current_step();
    info!(step, complete = session.is_complete(), "step settled");
    ensure_verification(ctx, services, session)?;
    refresh_injection(ctx, services, step);
    refresh_guidance(ctx, step);
    Ok(())
}

fn notice(ctx: &mut ExecutionContext, text: &str) {
    ctx.state.session.notices.push(text.to_string());
}
