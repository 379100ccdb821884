//! Gate enforcement authority.
//!
//! Decides whether an accumulated gate set requires an explicit review from
//! the caller, and applies verdicts and escalation actions to a pending
//! review. Retries are bounded by `max_attempts`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::gates::{GateDefinition, GateKind, GateSource, ParsedVerdict, PassCriterion, Verdict};
use crate::core::session::{GateReviewPrompt, PendingGateReview, ReviewAttempt};

pub const DEFAULT_REVIEW_MAX_ATTEMPTS: u32 = 2;

/// Caller choice once a review or verification loop escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Retry,
    Skip,
    Abort,
}

impl GateAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "skip" => Some(Self::Skip),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Abort => "abort",
        }
    }
}

/// Result of applying a verdict to a pending review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Review cleared; the chain may advance.
    Passed,
    /// Failed but attempts remain; the review stays pending.
    Retry,
    /// Attempt budget exhausted; waiting for a `gate_action`.
    Escalated,
}

/// Result of applying a `gate_action` to an exhausted review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Attempt count reset; the review stays pending.
    Reset,
    /// Review dropped; the chain advances with the current output.
    Skipped,
    /// The session must be aborted.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct GateEnforcementAuthority {
    max_attempts: u32,
}

impl Default for GateEnforcementAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_REVIEW_MAX_ATTEMPTS)
    }
}

impl GateEnforcementAuthority {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Gates the caller must explicitly judge.
    ///
    /// Explicitly requested gates (temporary, client-selected, inline) are
    /// enforced; registry and methodology gates only when declared blocking.
    pub fn is_enforced(&self, gate: &GateDefinition, source: GateSource) -> bool {
        let explicit = source.priority() >= GateSource::TemporaryRequest.priority();
        let reviewable = gate
            .criteria
            .iter()
            .any(|c| !matches!(c, PassCriterion::ShellVerify { .. }));
        gate.kind == GateKind::Validation && reviewable && (gate.blocking || explicit)
    }

    /// Build a pending review when any gate is enforced.
    pub fn review_for(
        &self,
        gates: &[(GateDefinition, GateSource)],
        step_number: u32,
        now: i64,
    ) -> Option<PendingGateReview> {
        let enforced: Vec<&GateDefinition> = gates
            .iter()
            .filter(|(gate, source)| self.is_enforced(gate, *source))
            .map(|(gate, _)| gate)
            .collect();
        if enforced.is_empty() {
            return None;
        }
        let prompts: Vec<GateReviewPrompt> = enforced
            .iter()
            .map(|gate| GateReviewPrompt {
                gate_id: gate.id.clone(),
                prompt: gate.review_prompt(),
            })
            .collect();
        let combined_prompt = prompts
            .iter()
            .map(|p| format!("- {}", p.prompt.replace('\n', "\n  ")))
            .collect::<Vec<_>>()
            .join("\n");
        debug!(gates = prompts.len(), step_number, "gate review required");
        Some(PendingGateReview {
            gate_ids: enforced.iter().map(|g| g.id.clone()).collect(),
            combined_prompt,
            prompts,
            created_at: now,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            step_number,
            history: Vec::new(),
        })
    }

    pub fn apply_verdict(
        &self,
        review: &mut PendingGateReview,
        verdict: &ParsedVerdict,
        now: i64,
    ) -> ReviewOutcome {
        review.history.push(ReviewAttempt {
            verdict: verdict.verdict.as_str().to_string(),
            rationale: verdict.rationale.clone(),
            at: now,
        });
        match verdict.verdict {
            Verdict::Pass => ReviewOutcome::Passed,
            Verdict::Fail => {
                review.attempt_count += 1;
                if review.is_exhausted() {
                    ReviewOutcome::Escalated
                } else {
                    ReviewOutcome::Retry
                }
            }
        }
    }

    pub fn apply_action(&self, review: &mut PendingGateReview, action: GateAction) -> ActionOutcome {
        match action {
            GateAction::Retry => {
                review.attempt_count = 0;
                ActionOutcome::Reset
            }
            GateAction::Skip => ActionOutcome::Skipped,
            GateAction::Abort => ActionOutcome::Aborted,
        }
    }
}

/// Call-to-action text for a pending review.
pub fn render_review(review: &PendingGateReview) -> String {
    let mut out = format!(
        "## Gate Review Required (attempt {}/{})\n\nEvaluate your response for step {} against these gates:\n\n{}\n",
        review.attempt_count + 1,
        review.max_attempts,
        review.step_number,
        review.combined_prompt
    );
    if let Some(last) = review.history.last()
        && last.verdict == Verdict::Fail.as_str()
    {
        out.push_str(&format!(
            "\nPrevious review failed: {}\nRevise the output, include the revision in `user_response`, then review again.\n",
            last.rationale
        ));
    }
    out.push_str(
        "\nReply with `gate_verdict` set to `GATE_REVIEW: PASS - <reason>` or `GATE_REVIEW: FAIL - <reason>`.",
    );
    out
}

/// Escalation text once the review budget is exhausted.
pub fn render_review_escalation(review: &PendingGateReview) -> String {
    let reason = review
        .history
        .last()
        .map(|a| a.rationale.as_str())
        .unwrap_or("no rationale given");
    format!(
        "## Gate Review Escalation\n\nThe response for step {} failed review {} time(s) (limit {}).\nLast failure: {reason}\n\n{}",
        review.step_number,
        review.attempt_count,
        review.max_attempts,
        escalation_choices("review")
    )
}

/// Shared `gate_action` menu.
pub fn escalation_choices(subject: &str) -> String {
    format!(
        "Resend with `chain_id` and `gate_action` set to one of:\n\
- `retry`: reset the attempt count and run the {subject} again\n\
- `skip`: accept the current output and continue the chain\n\
- `abort`: stop this chain"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gates::{GateActivation, GateCategory, VerdictSource};

    fn gate(id: &str, blocking: bool) -> GateDefinition {
        GateDefinition {
            id: id.to_string(),
            name: id.to_string(),
            kind: GateKind::Validation,
            category: GateCategory::Custom,
            guidance: String::new(),
            criteria: vec![PassCriterion::SelfReview {
                criteria: "cite sources".to_string(),
            }],
            blocking,
            activation: GateActivation::default(),
        }
    }

    fn verdict(v: Verdict) -> ParsedVerdict {
        ParsedVerdict {
            verdict: v,
            rationale: "because".to_string(),
            source: VerdictSource::GateVerdict,
            pattern: "bare",
        }
    }

    #[test]
    fn registry_gate_without_blocking_is_not_reviewed() {
        let authority = GateEnforcementAuthority::default();
        let gates = vec![(gate("code-quality", false), GateSource::RegistryAuto)];
        assert!(authority.review_for(&gates, 1, 0).is_none());
    }

    #[test]
    fn inline_gate_requires_review() {
        let authority = GateEnforcementAuthority::default();
        let gates = vec![
            (gate("inline-1", true), GateSource::InlineOperator),
            (gate("code-quality", false), GateSource::ClientSelection),
        ];
        let review = authority.review_for(&gates, 2, 7).expect("review");
        assert_eq!(review.gate_ids, vec!["inline-1", "code-quality"]);
        assert_eq!(review.max_attempts, 2);
        assert_eq!(review.step_number, 2);
        assert!(review.combined_prompt.contains("cite sources"));
    }

    #[test]
    fn fail_verdicts_escalate_at_budget() {
        let authority = GateEnforcementAuthority::new(2);
        let gates = vec![(gate("g", true), GateSource::InlineOperator)];
        let mut review = authority.review_for(&gates, 1, 0).expect("review");

        assert_eq!(authority.apply_verdict(&mut review, &verdict(Verdict::Fail), 1), ReviewOutcome::Retry);
        assert_eq!(review.attempt_count, 1);
        assert_eq!(
            authority.apply_verdict(&mut review, &verdict(Verdict::Fail), 2),
            ReviewOutcome::Escalated
        );
        assert!(render_review_escalation(&review).contains("`retry`"));

        assert_eq!(authority.apply_action(&mut review, GateAction::Retry), ActionOutcome::Reset);
        assert_eq!(review.attempt_count, 0);
        assert_eq!(authority.apply_verdict(&mut review, &verdict(Verdict::Pass), 3), ReviewOutcome::Passed);
        assert_eq!(review.history.len(), 3);
    }

    #[test]
    fn review_text_mentions_previous_failure() {
        let authority = GateEnforcementAuthority::new(3);
        let gates = vec![(gate("g", true), GateSource::InlineOperator)];
        let mut review = authority.review_for(&gates, 1, 0).expect("review");
        authority.apply_verdict(&mut review, &verdict(Verdict::Fail), 1);
        let text = render_review(&review);
        assert!(text.contains("attempt 2/3"));
        assert!(text.contains("Previous review failed: because"));
        assert!(text.contains("GATE_REVIEW: PASS"));
    }

    #[test]
    fn gate_action_parses_case_insensitively() {
        assert_eq!(GateAction::parse("RETRY"), Some(GateAction::Retry));
        assert_eq!(GateAction::parse(" skip "), Some(GateAction::Skip));
        assert_eq!(GateAction::parse("later"), None);
    }
}
