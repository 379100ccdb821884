use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::core::gates::CriterionOutcome;
use crate::core::session::{ChainSession, SessionStatus};
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::response::ToolResponse;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Machine-readable summary attached as `structuredContent`.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionSummary<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    framework: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    gates: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    auto_approved_tools: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    confirmation_required: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    validation_errors: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    auto_execute: BTreeMap<&'a str, &'a Value>,
    #[serde(skip_serializing_if = "is_empty")]
    validation: &'a [CriterionOutcome],
}

fn is_empty<T>(items: &&[T]) -> bool {
    items.is_empty()
}

/// Assembles the final text, the session footer and the structured summary.
pub struct ResponseFormatting;

impl Stage for ResponseFormatting {
    fn name(&self) -> &'static str {
        "response-formatting"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        let mut text = ctx.state.output.body.trim_end().to_string();
        if let Some(session) = &ctx.session {
            text.push_str("\n\n---\n");
            text.push_str(&footer(session, &ctx.state.output.call_to_action));
        }

        let scripts = &ctx.state.scripts;
        let summary = ExecutionSummary {
            session_id: ctx.session.as_ref().map(|s| s.session_id.as_str()),
            chain_id: ctx.session.as_ref().map(|s| s.chain_id.as_str()),
            current_step: ctx.session.as_ref().map(ChainSession::current_step),
            total_steps: ctx.session.as_ref().map(|s| s.state.total_steps),
            status: ctx.session.as_ref().map(|s| s.status),
            framework: ctx.state.framework.framework_id.as_deref(),
            gates: ctx
                .execution_plan
                .as_ref()
                .map(|plan| plan.gates.as_slice())
                .unwrap_or_default(),
            auto_approved_tools: &scripts.auto_approved_tools,
            confirmation_required: &scripts.confirmation_required,
            validation_errors: &scripts.validation_errors,
            auto_execute: scripts
                .auto_execute
                .iter()
                .map(|(id, payload)| (id.as_str(), payload))
                .collect(),
            validation: &ctx.state.gates.validation,
        };
        let structured = serde_json::to_value(&summary).context("serialize execution summary")?;

        let response = ToolResponse::text(text);
        ctx.response = Some(match structured {
            Value::Object(map) if map.is_empty() => response,
            value => response.with_structured(value),
        });
        Ok(())
    }
}

fn footer(session: &ChainSession, next: &[String]) -> String {
    let progress = format!("{}/{}", session.completed_steps(), session.state.total_steps);
    let status = match session.status {
        SessionStatus::Completed => format!("✓ Chain complete ({progress})"),
        SessionStatus::Aborted => format!("✗ Chain aborted ({progress})"),
        SessionStatus::Active => format!(
            "Step {}/{}",
            session.current_step(),
            session.state.total_steps
        ),
    };
    let mut out = format!(
        "Session ID: {}\nChain ID: {}\n{status}",
        session.session_id, session.chain_id
    );
    for line in next {
        out.push_str(&format!("\nNext: {line}"));
    }
    out
}
