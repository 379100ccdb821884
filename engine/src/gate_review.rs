//! Gate review service: which gates apply to a step, when a review opens,
//! and how verdicts and escalation actions move it along.

use tracing::{debug, info};

use crate::core::gates::{
    GateAccumulator, GateDefinition, GateLookup, GateSource, ParsedVerdict, VerdictSource,
    parse_gate_verdict,
};
use crate::core::review::{ActionOutcome, GateAction, GateEnforcementAuthority, ReviewOutcome};
use crate::core::session::PendingGateReview;

/// Accumulator metadata key restricting a gate to one step.
pub const STEP_METADATA_KEY: &str = "step";

/// What a submission did to the pending review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewProgress {
    /// No verdict could be read from the submission.
    AwaitingVerdict,
    Passed(ParsedVerdict),
    Retry(ParsedVerdict),
    Escalated(ParsedVerdict),
}

#[derive(Debug, Clone, Default)]
pub struct GateReviewService {
    authority: GateEnforcementAuthority,
}

impl GateReviewService {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            authority: GateEnforcementAuthority::new(max_attempts),
        }
    }

    pub fn authority(&self) -> &GateEnforcementAuthority {
        &self.authority
    }

    /// Gate ids applying to `step`: command-wide entries plus the step's own.
    pub fn step_gate_ids(accumulator: &GateAccumulator, step: u32) -> Vec<String> {
        accumulator
            .get_entries()
            .iter()
            .filter(|e| {
                e.metadata
                    .get(STEP_METADATA_KEY)
                    .is_none_or(|s| s.parse::<u32>().is_ok_and(|n| n == step))
            })
            .map(|e| e.id.clone())
            .collect()
    }

    /// Resolve `ids` to definitions paired with their winning source.
    pub fn resolve_gates(
        accumulator: &GateAccumulator,
        lookup: &GateLookup<'_>,
        ids: &[String],
    ) -> Vec<(GateDefinition, GateSource)> {
        ids.iter()
            .filter_map(|id| {
                let source = accumulator.get(id)?.source;
                lookup.get(id).map(|gate| (gate, source))
            })
            .collect()
    }

    /// Ask the enforcement authority whether `gates` need an explicit review.
    pub fn open_review(
        &self,
        gates: &[(GateDefinition, GateSource)],
        step: u32,
        now: i64,
    ) -> Option<PendingGateReview> {
        let review = self.authority.review_for(gates, step, now);
        if let Some(review) = &review {
            info!(step, gates = ?review.gate_ids, "gate review opened");
        }
        review
    }

    /// Read a verdict from the trusted channel first, then from free text.
    pub fn read_verdict(
        gate_verdict: Option<&str>,
        user_response: Option<&str>,
    ) -> Option<ParsedVerdict> {
        gate_verdict
            .and_then(|text| parse_gate_verdict(text, VerdictSource::GateVerdict))
            .or_else(|| {
                user_response.and_then(|text| parse_gate_verdict(text, VerdictSource::UserResponse))
            })
    }

    pub fn submit(
        &self,
        review: &mut PendingGateReview,
        gate_verdict: Option<&str>,
        user_response: Option<&str>,
        now: i64,
    ) -> ReviewProgress {
        let Some(verdict) = Self::read_verdict(gate_verdict, user_response) else {
            debug!(step = review.step_number, "no verdict in submission");
            return ReviewProgress::AwaitingVerdict;
        };
        let outcome = self.authority.apply_verdict(review, &verdict, now);
        info!(
            step = review.step_number,
            verdict = verdict.verdict.as_str(),
            pattern = verdict.pattern,
            attempts = review.attempt_count,
            "gate verdict applied"
        );
        match outcome {
            ReviewOutcome::Passed => ReviewProgress::Passed(verdict),
            ReviewOutcome::Retry => ReviewProgress::Retry(verdict),
            ReviewOutcome::Escalated => ReviewProgress::Escalated(verdict),
        }
    }

    pub fn act(&self, review: &mut PendingGateReview, action: GateAction) -> ActionOutcome {
        let outcome = self.authority.apply_action(review, action);
        info!(step = review.step_number, action = action.as_str(), "review action applied");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::gates::{
        GateActivation, GateCategory, GateKind, GateRegistry, PassCriterion,
        TemporaryGateRegistry, Verdict,
    };

    fn inline_gate(id: &str) -> GateDefinition {
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

    fn step_meta(step: u32) -> BTreeMap<String, String> {
        BTreeMap::from([(STEP_METADATA_KEY.to_string(), step.to_string())])
    }

    #[test]
    fn step_gates_include_command_wide_entries() {
        let mut acc = GateAccumulator::new();
        acc.add_with_metadata("inline-step1-1", GateSource::InlineOperator, step_meta(1));
        acc.add_with_metadata("inline-step2-1", GateSource::InlineOperator, step_meta(2));
        acc.add("code-quality", GateSource::ClientSelection);

        assert_eq!(
            GateReviewService::step_gate_ids(&acc, 1),
            vec!["inline-step1-1".to_string(), "code-quality".to_string()]
        );
        assert_eq!(
            GateReviewService::step_gate_ids(&acc, 2),
            vec!["inline-step2-1".to_string(), "code-quality".to_string()]
        );
    }

    #[test]
    fn explicit_inline_gate_opens_a_review() {
        let registry = GateRegistry::with_builtins();
        let temporary = TemporaryGateRegistry::new();
        temporary.register("exec-1", inline_gate("inline-step1-1"));
        let lookup = GateLookup::new(&registry, &temporary, vec!["exec-1".to_string()]);

        let mut acc = GateAccumulator::new();
        acc.add_with_metadata("inline-step1-1", GateSource::InlineOperator, step_meta(1));
        acc.add("technical-accuracy", GateSource::RegistryAuto);

        let ids = GateReviewService::step_gate_ids(&acc, 1);
        let gates = GateReviewService::resolve_gates(&acc, &lookup, &ids);
        assert_eq!(gates.len(), 2);
        let svc = GateReviewService::new(2);
        let review = svc.open_review(&gates, 1, 0).expect("review");
        // Non-blocking registry gates are guidance only.
        assert_eq!(review.gate_ids, vec!["inline-step1-1".to_string()]);
    }

    #[test]
    fn verdicts_retry_then_escalate() {
        let svc = GateReviewService::new(2);
        let mut review = svc
            .open_review(&[(inline_gate("g"), GateSource::InlineOperator)], 1, 0)
            .expect("review");

        assert_eq!(
            svc.submit(&mut review, None, Some("Here is my answer."), 1),
            ReviewProgress::AwaitingVerdict
        );
        assert!(matches!(
            svc.submit(&mut review, Some("FAIL - too long"), None, 2),
            ReviewProgress::Retry(_)
        ));
        match svc.submit(&mut review, None, Some("GATE_REVIEW: FAIL - still long"), 3) {
            ReviewProgress::Escalated(v) => assert_eq!(v.source, VerdictSource::UserResponse),
            other => panic!("expected escalation, got {other:?}"),
        }
        assert_eq!(svc.act(&mut review, GateAction::Retry), ActionOutcome::Reset);
        assert_eq!(review.attempt_count, 0);

        match svc.submit(&mut review, Some("PASS - trimmed"), None, 4) {
            ReviewProgress::Passed(v) => assert_eq!(v.verdict, Verdict::Pass),
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[test]
    fn bare_verdict_in_free_text_is_ignored() {
        assert!(GateReviewService::read_verdict(None, Some("PASS - looks fine")).is_none());
        assert!(GateReviewService::read_verdict(Some("PASS - ok"), None).is_some());
    }
}
