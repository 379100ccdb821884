use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::scripts::{ScriptOutcomes, ToolPlan, args_to_json, plan_tool};
use crate::core::session::SessionStatus;
use crate::core::types::{ArgMap, CommandType, ParsedStep, PromptDefinition};
use crate::core::verify::render_pending;
use crate::io::scripts::ScriptInvocation;
use crate::io::template::TemplateVars;
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::error::{PlanningError, SessionError};
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Renders the current step: script tools, template, and the guidance
/// blocks collected by earlier stages.
///
/// Skipped while the caller owes a verdict or is reading feedback.
pub struct StepExecution;

impl Stage for StepExecution {
    fn name(&self) -> &'static str {
        "step-execution"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        if ctx.state.session.feedback.is_some()
            || ctx.session.as_ref().is_some_and(|s| s.pending_gate_review.is_some())
        {
            return Ok(());
        }
        if let Some(session) = &ctx.session
            && !session.is_active()
        {
            let mut body = notices(ctx);
            body.push_str(match session.status {
                SessionStatus::Aborted => "## Chain Aborted",
                _ => "## Chain Complete",
            });
            ctx.state.output.body = body;
            return Ok(());
        }
        let Some(parsed) = ctx.parsed_command.as_ref() else {
            return Err(PlanningError::EmptyPlan.into());
        };

        let step_number = ctx.current_step();
        let steps = parsed.effective_steps();
        let step: &ParsedStep = steps
            .iter()
            .find(|s| s.step_number == step_number)
            .ok_or(SessionError::MissingStep { step: step_number })?;
        let prompt = services.catalog.get(&step.prompt_id).ok_or_else(|| {
            PlanningError::UnknownStepPrompt {
                step: step_number,
                prompt_id: step.prompt_id.clone(),
            }
        })?;
        let mut args = ctx
            .session
            .as_ref()
            .map(|s| s.original_args.clone())
            .unwrap_or_default();
        args.extend(step.args.clone());

        let scripts = run_tools(services, prompt, &args);
        let outputs = ctx
            .session
            .as_ref()
            .map(|s| s.outputs())
            .unwrap_or_default();
        let vars = TemplateVars::from_args(&args)
            .with_step_outputs(&outputs, step_number)
            .with_tool_outputs(&scripts.tool_outputs);
        let content = services
            .templates
            .render(&prompt.user_message_template, &vars)
            .with_context(|| format!("render prompt '{}'", prompt.id))?;
        let system = prompt
            .system_message
            .as_deref()
            .map(|tpl| services.templates.render(tpl, &vars))
            .transpose()
            .with_context(|| format!("render system message of '{}'", prompt.id))?;

        let mut sections: Vec<String> = Vec::new();
        if ctx.state.framework.inject_current
            && let Some(injection) = &ctx.state.framework.injection
        {
            sections.push(injection.clone());
        }
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            sections.push(system.trim().to_string());
        }
        if let Some(style) = &parsed.style {
            sections.push(format!("**Response style:** {style}"));
        }
        let heading = match parsed.command_type {
            CommandType::Chain => Some(format!(
                "## Step {step_number}/{}: {}",
                parsed.total_steps(),
                prompt.display_name()
            )),
            CommandType::Single => None,
        };
        let content = content.trim();
        sections.push(match heading {
            Some(heading) => format!("{heading}\n\n{content}"),
            None => content.to_string(),
        });
        if let Some(guidance) = &ctx.state.framework.step_guidance {
            sections.push(guidance.clone());
        }
        if let Some(guidance) = ctx.state.gates.guidance.get(&step_number) {
            sections.push(guidance.clone());
        }
        let rendered_scripts = scripts.render();
        if !rendered_scripts.trim().is_empty() {
            sections.push(rendered_scripts.trim().to_string());
        }
        if ctx.state.session.verification_started
            && let Some(pending) = ctx
                .session
                .as_ref()
                .and_then(|s| s.pending_shell_verification.as_ref())
        {
            sections.push(render_pending(pending));
        }
        if !ctx.is_resume() && !parsed.warnings.is_empty() {
            let lines: Vec<String> = parsed.warnings.iter().map(|w| format!("- {w}")).collect();
            sections.push(format!("**Parser warnings:**\n{}", lines.join("\n")));
        }

        let mut body = notices(ctx);
        body.push_str(&sections.join("\n\n"));
        debug!(step = step_number, prompt = %prompt.id, chars = body.len(), "step rendered");
        ctx.state.output.body = body;
        ctx.state.scripts = scripts;
        Ok(())
    }
}

/// Run the prompt's script tools against the step arguments.
fn run_tools(services: &EngineServices, prompt: &PromptDefinition, args: &ArgMap) -> ScriptOutcomes {
    let mut outcomes = ScriptOutcomes::default();
    for tool in &prompt.tools {
        match plan_tool(tool, args) {
            ToolPlan::Skip => debug!(tool = %tool.id, "tool not triggered"),
            ToolPlan::InvalidInput(errors) => outcomes
                .validation_errors
                .extend(errors.into_iter().map(|e| format!("{}: {e}", tool.id))),
            ToolPlan::AwaitConfirmation => outcomes.confirmation_required.push(tool.id.clone()),
            ToolPlan::Run => {
                let invocation = ScriptInvocation {
                    tool_id: tool.id.clone(),
                    command: tool.command.clone(),
                    working_dir: tool.working_dir.as_ref().map(PathBuf::from),
                    input: args_to_json(args),
                    timeout: Duration::from_millis(
                        tool.timeout_ms.unwrap_or(services.config.scripts.timeout_ms),
                    ),
                    output_limit_bytes: services.config.scripts.output_limit_bytes,
                };
                match services.scripts.execute(&invocation) {
                    Ok(execution) => {
                        info!(tool = %tool.id, success = execution.success, "tool executed");
                        outcomes.record(tool, &execution);
                    }
                    Err(err) => {
                        warn!(tool = %tool.id, err = %format!("{err:#}"), "tool failed to run");
                        outcomes.failures.push(format!("{}: {err:#}", tool.id));
                    }
                }
            }
        }
    }
    outcomes
}

fn notices(ctx: &ExecutionContext) -> String {
    ctx.state
        .session
        .notices
        .iter()
        .map(|n| format!("{n}\n\n"))
        .collect()
}
