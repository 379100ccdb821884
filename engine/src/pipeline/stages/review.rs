use anyhow::Result;

use crate::core::review::{render_review, render_review_escalation};
use crate::core::session::{ChainSession, SessionStatus};
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Replaces the step body with review or feedback content when the caller
/// owes a verdict or has to fix something first.
pub struct GateReview;

impl Stage for GateReview {
    fn name(&self) -> &'static str {
        "gate-review"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        let review = ctx
            .session
            .as_ref()
            .and_then(|s| s.pending_gate_review.as_ref());
        let content = match (&ctx.state.session.feedback, review) {
            (Some(feedback), _) => feedback.clone(),
            (None, Some(review)) if review.is_exhausted() => render_review_escalation(review),
            (None, Some(review)) => render_review(review),
            (None, None) => return Ok(()),
        };
        let mut body: String = ctx
            .state
            .session
            .notices
            .iter()
            .map(|n| format!("{n}\n\n"))
            .collect();
        body.push_str(&content);
        ctx.state.output.body = body;
        Ok(())
    }
}

/// Tells the caller exactly how to continue.
pub struct CallToAction;

impl Stage for CallToAction {
    fn name(&self) -> &'static str {
        "call-to-action"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        if let Some(session) = &ctx.session {
            ctx.state.output.call_to_action = next_actions(session);
        }
        Ok(())
    }
}

fn next_actions(session: &ChainSession) -> Vec<String> {
    let chain_id = &session.chain_id;
    match session.status {
        SessionStatus::Completed => {
            return vec!["no `user_response` needed; the chain is complete.".to_string()];
        }
        SessionStatus::Aborted => {
            return vec![
                "no `user_response` needed. Send `command` with `force_restart: true` to start a new run."
                    .to_string(),
            ];
        }
        SessionStatus::Active => {}
    }
    if let Some(review) = &session.pending_gate_review {
        if review.is_exhausted() {
            return vec![format!(
                "resend with `chain_id: \"{chain_id}\"` and `gate_action` (`retry`, `skip` or `abort`)."
            )];
        }
        return vec![format!(
            "resend with `chain_id: \"{chain_id}\"` and `gate_verdict: \"GATE_REVIEW: PASS - <reason>\"` (or FAIL)."
        )];
    }
    if let Some(pending) = &session.pending_shell_verification {
        if pending.is_exhausted() {
            return vec![format!(
                "resend with `chain_id: \"{chain_id}\"` and `gate_action` (`retry`, `skip` or `abort`)."
            )];
        }
        return vec![format!(
            "finish the work, then resend with `chain_id: \"{chain_id}\"` to run `{}`.",
            pending.shell_verify.command
        )];
    }
    vec![format!(
        "resend with `chain_id: \"{chain_id}\"` and `user_response` containing your output for step {}.",
        session.current_step()
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::PromptCatalog;
    use crate::core::parser::CommandParser;
    use crate::core::session::{PendingShellVerification, SessionBlueprint};
    use crate::core::types::{ArgMap, ShellVerifyConfig};
    use crate::test_support::prompt;

    fn session() -> ChainSession {
        let catalog = PromptCatalog::new(vec![prompt("a", "A"), prompt("b", "B")]);
        let parsed = CommandParser::new(&catalog, &|_: &str| false)
            .parse(">>a --> >>b")
            .expect("parse");
        ChainSession::new(
            "sess-1".to_string(),
            "chain-a#1".to_string(),
            SessionBlueprint {
                parsed_command: parsed,
                temporary_gates: Vec::new(),
                client_gates: Vec::new(),
                gate_scope: Default::default(),
                api_validation: false,
            },
            ArgMap::new(),
            0,
        )
    }

    #[test]
    fn active_chain_asks_for_the_step_output() {
        let actions = next_actions(&session());
        assert_eq!(actions.len(), 1);
        assert!(actions[0].contains("chain-a#1"));
        assert!(actions[0].contains("step 1"));
    }

    #[test]
    fn pending_verification_asks_for_a_rerun() {
        let mut session = session();
        session.pending_shell_verification = Some(PendingShellVerification::new(
            "shell-verify",
            ShellVerifyConfig::new("cargo test"),
            1,
        ));
        assert!(next_actions(&session)[0].contains("cargo test"));
    }
}
