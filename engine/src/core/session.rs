//! Chain session data model and its pure state transitions.
//!
//! A session is the serializable record that lets a chain resume across
//! independent invocations. `current_step` is the step most recently handed
//! to the caller and awaiting its response.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::gates::GateDefinition;
use crate::core::types::{ArgMap, ParsedCommand, ShellVerifyConfig};
use crate::core::verify::AttemptRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    /// The run that `chain-<base>` resolves to.
    Canonical,
    /// A superseded or finished run, reachable only by explicit id.
    Dormant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

/// Why a step holds synthetic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaceholderSource {
    /// The caller resumed without a `user_response`.
    MissingResponse,
    /// A gate review was skipped via `gate_action:"skip"`.
    GateSkip,
    /// A shell verification was skipped via `gate_action:"skip"`.
    VerificationSkip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StepState {
    Pending,
    #[serde(rename_all = "camelCase")]
    Completed {
        output: String,
        is_placeholder: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder_source: Option<PlaceholderSource>,
        captured_at: i64,
    },
}

impl StepState {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Completed { is_placeholder: true, .. })
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Self::Completed { is_placeholder: false, .. })
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Completed { output, .. } => Some(output),
            Self::Pending => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSessionState {
    pub current_step: u32,
    pub total_steps: u32,
    pub step_states: BTreeMap<u32, StepState>,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReviewPrompt {
    pub gate_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAttempt {
    pub verdict: String,
    pub rationale: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingGateReview {
    pub gate_ids: Vec<String>,
    pub combined_prompt: String,
    pub prompts: Vec<GateReviewPrompt>,
    pub created_at: i64,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub step_number: u32,
    #[serde(default)]
    pub history: Vec<ReviewAttempt>,
}

impl PendingGateReview {
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub passed: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub command: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub isolated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingShellVerification {
    pub gate_id: String,
    pub shell_verify: ShellVerifyConfig,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub previous_results: Vec<VerificationResult>,
    pub step_number: u32,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    /// What each attempt tried and learned; survives a `retry` reset.
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

/// Worktree state recorded before a verification, for `rollback:true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Commit-ish holding the tracked files.
    pub reference: String,
    /// Untracked, non-ignored paths that already existed; anything else
    /// untracked at restore time is removed.
    #[serde(default)]
    pub untracked: Vec<String>,
}

impl PendingShellVerification {
    pub fn new(gate_id: impl Into<String>, config: ShellVerifyConfig, step_number: u32) -> Self {
        let max_attempts = config.max_iterations.max(1);
        Self {
            gate_id: gate_id.into(),
            shell_verify: config,
            attempt_count: 0,
            max_attempts,
            previous_results: Vec::new(),
            step_number,
            checkpoint: None,
            history: Vec::new(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn last_result(&self) -> Option<&VerificationResult> {
        self.previous_results.last()
    }
}

/// How gates supplied with the request are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateScope {
    /// Removed when the invocation finishes.
    #[default]
    Execution,
    /// Kept until the chain completes.
    Chain,
}

/// Everything needed to re-hydrate a chain from only its identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBlueprint {
    pub parsed_command: ParsedCommand,
    #[serde(default)]
    pub temporary_gates: Vec<GateDefinition>,
    #[serde(default)]
    pub client_gates: Vec<String>,
    #[serde(default)]
    pub gate_scope: GateScope,
    #[serde(default)]
    pub api_validation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSession {
    pub session_id: String,
    pub chain_id: String,
    pub state: ChainSessionState,
    #[serde(default)]
    pub pending_gate_review: Option<PendingGateReview>,
    #[serde(default)]
    pub pending_shell_verification: Option<PendingShellVerification>,
    pub lifecycle: SessionLifecycle,
    pub status: SessionStatus,
    pub original_args: ArgMap,
    pub start_time: i64,
    pub last_activity: i64,
    pub blueprint: SessionBlueprint,
}

impl ChainSession {
    pub fn new(
        session_id: String,
        chain_id: String,
        blueprint: SessionBlueprint,
        original_args: ArgMap,
        now: i64,
    ) -> Self {
        let total_steps = blueprint.parsed_command.total_steps().max(1);
        let step_states = (1..=total_steps).map(|n| (n, StepState::Pending)).collect();
        Self {
            session_id,
            chain_id,
            state: ChainSessionState {
                current_step: 1,
                total_steps,
                step_states,
                last_updated: now,
            },
            pending_gate_review: None,
            pending_shell_verification: None,
            lifecycle: SessionLifecycle::Canonical,
            status: SessionStatus::Active,
            original_args,
            start_time: now,
            last_activity: now,
            blueprint,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn current_step(&self) -> u32 {
        self.state.current_step
    }

    pub fn step_state(&self, step: u32) -> Option<&StepState> {
        self.state.step_states.get(&step)
    }

    /// Store a real response for `step`, replacing any placeholder.
    pub fn capture_response(&mut self, step: u32, output: &str, now: i64) {
        self.state.step_states.insert(
            step,
            StepState::Completed {
                output: output.to_string(),
                is_placeholder: false,
                placeholder_source: None,
                captured_at: now,
            },
        );
        self.touch(now);
    }

    /// Store a synthetic output for `step` unless a real response is already present.
    ///
    /// Returns `true` when a placeholder was written.
    pub fn record_placeholder(&mut self, step: u32, source: PlaceholderSource, now: i64) -> bool {
        if self.step_state(step).is_some_and(StepState::is_real) {
            return false;
        }
        self.state.step_states.insert(
            step,
            StepState::Completed {
                output: placeholder_text(step, source),
                is_placeholder: true,
                placeholder_source: Some(source),
                captured_at: now,
            },
        );
        self.touch(now);
        true
    }

    /// Move to the next step; completes the session past the last one.
    pub fn advance(&mut self, now: i64) {
        if self.state.current_step >= self.state.total_steps {
            self.status = SessionStatus::Completed;
        } else {
            self.state.current_step += 1;
        }
        self.touch(now);
    }

    pub fn abort(&mut self, now: i64) {
        self.status = SessionStatus::Aborted;
        self.pending_gate_review = None;
        self.pending_shell_verification = None;
        self.touch(now);
    }

    pub fn touch(&mut self, now: i64) {
        self.state.last_updated = now;
        self.last_activity = now;
    }

    /// Outputs captured so far, keyed by step number.
    pub fn outputs(&self) -> BTreeMap<u32, String> {
        self.state
            .step_states
            .iter()
            .filter_map(|(n, s)| s.output().map(|o| (*n, o.to_string())))
            .collect()
    }

    pub fn completed_steps(&self) -> u32 {
        self.state
            .step_states
            .values()
            .filter(|s| matches!(s, StepState::Completed { .. }))
            .count() as u32
    }

    pub fn has_pending_work(&self) -> bool {
        self.pending_gate_review.is_some() || self.pending_shell_verification.is_some()
    }
}

fn placeholder_text(step: u32, source: PlaceholderSource) -> String {
    match source {
        PlaceholderSource::MissingResponse => {
            format!("[step {step} output not provided; continue from the step instructions]")
        }
        PlaceholderSource::GateSkip => format!("[step {step} gate review skipped]"),
        PlaceholderSource::VerificationSkip => format!("[step {step} verification skipped]"),
    }
}

/// How the session stage resolved the current invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionDecision {
    CreateNew,
    ResumeChain,
    ResumeChainId,
    CreateForceRestart,
}

impl SessionDecision {
    pub fn is_resume(self) -> bool {
        matches!(self, Self::ResumeChain | Self::ResumeChainId)
    }

    /// Decide from the lookups already performed by the caller.
    ///
    /// `session_hit` is an active session matched by explicit session id and
    /// `chain_hit` a session matched by chain identifier (dormant included).
    pub fn resolve(force_restart: bool, session_hit: bool, chain_hit: bool) -> Self {
        if force_restart {
            Self::CreateForceRestart
        } else if session_hit {
            Self::ResumeChain
        } else if chain_hit {
            Self::ResumeChainId
        } else {
            Self::CreateNew
        }
    }
}

/// `chain-<base>#<run>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    pub base: String,
    pub run: u32,
}

impl ChainId {
    pub fn new(base: impl Into<String>, run: u32) -> Self {
        Self {
            base: base.into(),
            run,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}#{}", self.base, self.run)
    }
}

/// A caller-supplied `chain_id` value, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainReference {
    /// Explicit session id (`sess-...`).
    Session(String),
    /// `chain-<base>#<run>`.
    Run(ChainId),
    /// `chain-<base>`: the canonical (latest) run of the base.
    Latest(String),
}

pub const SESSION_ID_PREFIX: &str = "sess-";

impl ChainReference {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with(SESSION_ID_PREFIX) {
            return Some(Self::Session(raw.to_string()));
        }
        let body = raw.strip_prefix("chain-")?;
        match body.rsplit_once('#') {
            Some((base, run)) if !base.is_empty() => {
                run.parse().ok().map(|run| Self::Run(ChainId::new(base, run)))
            }
            Some(_) => None,
            None if body.is_empty() => None,
            None => Some(Self::Latest(body.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CommandType, InlineGates, ParseFormat};

    fn blueprint(steps: u32) -> SessionBlueprint {
        let steps = (1..=steps)
            .map(|n| crate::core::types::ParsedStep::new(n, format!("p{n}"), ArgMap::new()))
            .collect();
        SessionBlueprint {
            parsed_command: ParsedCommand {
                command_type: CommandType::Chain,
                format: ParseFormat::Symbolic,
                raw: String::new(),
                prompt_id: None,
                args: ArgMap::new(),
                steps,
                command_gates: InlineGates::default(),
                framework_override: None,
                style: None,
                modifiers: Vec::new(),
                operators: Vec::new(),
                confidence: 0.9,
                warnings: Vec::new(),
                promoted_from_single: false,
                resolved_gate_ids: Vec::new(),
            },
            temporary_gates: Vec::new(),
            client_gates: Vec::new(),
            gate_scope: GateScope::Execution,
            api_validation: false,
        }
    }

    fn session(steps: u32) -> ChainSession {
        ChainSession::new(
            "sess-1".to_string(),
            "chain-p1#1".to_string(),
            blueprint(steps),
            ArgMap::new(),
            0,
        )
    }

    #[test]
    fn new_session_starts_at_step_one_with_pending_states() {
        let s = session(3);
        assert_eq!(s.current_step(), 1);
        assert_eq!(s.state.total_steps, 3);
        assert!(s.state.step_states.values().all(|st| *st == StepState::Pending));
    }

    #[test]
    fn real_response_overwrites_placeholder() {
        let mut s = session(2);
        assert!(s.record_placeholder(1, PlaceholderSource::MissingResponse, 1));
        assert!(s.step_state(1).is_some_and(StepState::is_placeholder));
        s.capture_response(1, "real", 2);
        assert_eq!(s.step_state(1).and_then(StepState::output), Some("real"));
        assert!(!s.step_state(1).is_some_and(StepState::is_placeholder));
    }

    #[test]
    fn placeholder_never_replaces_real_output() {
        let mut s = session(2);
        s.capture_response(1, "real", 1);
        assert!(!s.record_placeholder(1, PlaceholderSource::MissingResponse, 2));
        assert_eq!(s.step_state(1).and_then(StepState::output), Some("real"));
    }

    #[test]
    fn advancing_past_last_step_completes() {
        let mut s = session(2);
        s.advance(1);
        assert_eq!(s.current_step(), 2);
        assert!(s.is_active());
        s.advance(2);
        assert_eq!(s.current_step(), 2);
        assert!(s.is_complete());
    }

    #[test]
    fn decision_resolution_order() {
        assert_eq!(SessionDecision::resolve(true, true, true), SessionDecision::CreateForceRestart);
        assert_eq!(SessionDecision::resolve(false, true, true), SessionDecision::ResumeChain);
        assert_eq!(SessionDecision::resolve(false, false, true), SessionDecision::ResumeChainId);
        assert_eq!(SessionDecision::resolve(false, false, false), SessionDecision::CreateNew);
    }

    #[test]
    fn chain_reference_forms() {
        assert_eq!(
            ChainReference::parse("chain-research#3"),
            Some(ChainReference::Run(ChainId::new("research", 3)))
        );
        assert_eq!(
            ChainReference::parse("chain-research"),
            Some(ChainReference::Latest("research".to_string()))
        );
        assert_eq!(
            ChainReference::parse("sess-abc"),
            Some(ChainReference::Session("sess-abc".to_string()))
        );
        assert_eq!(ChainReference::parse("research"), None);
        assert_eq!(ChainReference::parse("chain-x#y"), None);
        assert_eq!(ChainId::new("research", 2).to_string(), "chain-research#2");
    }

    #[test]
    fn step_state_serializes_with_status_tag() {
        let state = StepState::Completed {
            output: "x".to_string(),
            is_placeholder: true,
            placeholder_source: Some(PlaceholderSource::MissingResponse),
            captured_at: 5,
        };
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["isPlaceholder"], true);
        assert_eq!(value["placeholderSource"], "missing-response");
    }
}
