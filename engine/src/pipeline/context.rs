//! Per-invocation state threaded through the pipeline stages.
//!
//! Each concern owns one sub-state so stages only touch what they need.
//! `parsed_command` is written once by the parse stage; later stages only
//! annotate `resolved_gate_ids` and step plans.

use std::collections::BTreeMap;

use crate::chain_session::SessionLookup;
use crate::core::decisions::FrameworkDecisionAuthority;
use crate::core::frameworks::InjectionFrequency;
use crate::core::gates::{CriterionOutcome, GateAccumulator};
use crate::core::scripts::ScriptOutcomes;
use crate::core::session::{ChainSession, SessionDecision};
use crate::core::types::{ExecutionPlan, ParsedCommand};
use crate::pipeline::request::PromptEngineRequest;
use crate::pipeline::response::ToolResponse;

pub struct ExecutionContext {
    pub request: PromptEngineRequest,
    pub parsed_command: Option<ParsedCommand>,
    pub execution_plan: Option<ExecutionPlan>,
    pub session: Option<ChainSession>,
    pub state: ContextState,
    pub response: Option<ToolResponse>,
}

impl ExecutionContext {
    pub fn new(request: PromptEngineRequest) -> Self {
        Self {
            request,
            parsed_command: None,
            execution_plan: None,
            session: None,
            state: ContextState::default(),
            response: None,
        }
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Step currently presented: the session's, else 1.
    pub fn current_step(&self) -> u32 {
        self.session.as_ref().map_or(1, ChainSession::current_step)
    }

    pub fn is_resume(&self) -> bool {
        self.state.session.decision.is_some_and(SessionDecision::is_resume)
    }

    /// Gate ids planned for `step`.
    pub fn step_gates(&self, step: u32) -> &[String] {
        self.state
            .gates
            .step_plans
            .get(&step)
            .map(|plan| plan.gates.as_slice())
            .unwrap_or_default()
    }

    pub fn step_requires_framework(&self, step: u32) -> bool {
        self.state
            .gates
            .step_plans
            .get(&step)
            .is_some_and(|plan| plan.requires_framework)
    }
}

#[derive(Default)]
pub struct ContextState {
    pub lifecycle: LifecycleState,
    pub gates: GateState,
    pub session: SessionState,
    pub framework: FrameworkState,
    pub scripts: ScriptOutcomes,
    pub output: OutputState,
}

/// Deferred work for the cleanup stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    ReleaseGateScope(String),
    RestoreFramework(String),
}

#[derive(Debug, Default)]
pub struct LifecycleState {
    /// Temporary-gate scope owned by this invocation.
    pub scope_id: String,
    pub cleanup: Vec<CleanupAction>,
    pub cleaned_up: bool,
}

#[derive(Debug, Default)]
pub struct GateState {
    pub accumulator: GateAccumulator,
    pub step_plans: BTreeMap<u32, ExecutionPlan>,
    /// Rendered gate guidance per step.
    pub guidance: BTreeMap<u32, String>,
    pub validation: Vec<CriterionOutcome>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub lookup: Option<SessionLookup>,
    pub decision: Option<SessionDecision>,
    /// A verification was attached during this invocation.
    pub verification_started: bool,
    /// Replaces the step body (bounce-back, escalation).
    pub feedback: Option<String>,
    pub review_opened: bool,
    pub advanced: bool,
    pub notices: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FrameworkState {
    pub authority: FrameworkDecisionAuthority,
    pub injection: Option<String>,
    pub framework_id: Option<String>,
    pub frequency: InjectionFrequency,
    pub inject_current: bool,
    pub step_guidance: Option<String>,
}

#[derive(Debug, Default)]
pub struct OutputState {
    pub body: String,
    pub call_to_action: Vec<String>,
}
