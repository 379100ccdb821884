use anyhow::Result;
use tracing::{debug, info};

use crate::core::frameworks::{BUILTIN_FRAMEWORKS, find_framework};
use crate::core::parser::CommandParser;
use crate::core::types::{ArgMap, CommandType, ParsedCommand};
use crate::pipeline::context::ExecutionContext;
use crate::pipeline::error::{PlanningError, SessionError};
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Parses `command`, or re-hydrates the stored command of the referenced chain.
pub struct CommandParsing;

impl Stage for CommandParsing {
    fn name(&self) -> &'static str {
        "command-parsing"
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        if let Some(reference) = ctx.request.chain_id.clone() {
            if let Some(lookup) = services.sessions.lookup(&reference)? {
                info!(
                    chain_id = %lookup.session.chain_id,
                    step = lookup.session.current_step(),
                    "resuming from stored command"
                );
                if ctx.request.command.is_some() {
                    ctx.state.session.notices.push(format!(
                        "`command` ignored: continuing {} from its stored command.",
                        lookup.session.chain_id
                    ));
                }
                ctx.parsed_command = Some(lookup.session.blueprint.parsed_command.clone());
                ctx.state.session.lookup = Some(lookup);
                return Ok(());
            }
            if ctx.request.command.is_none() {
                return Err(SessionError::UnknownChain { reference }.into());
            }
            ctx.state.session.notices.push(format!(
                "No chain found for `{reference}`; starting a new run from `command`."
            ));
        }

        let raw = ctx.request.command.clone().unwrap_or_default();
        let is_known_gate = |id: &str| services.gate_registry.contains(id);
        let parser = CommandParser::new(&services.catalog, &is_known_gate);
        let mut parsed = parser.parse(&raw)?;
        apply_options(&mut parsed, ctx.request.option_args());
        debug!(
            command_type = ?parsed.command_type,
            steps = parsed.total_steps(),
            operators = parsed.operators.len(),
            "command parsed"
        );
        ctx.parsed_command = Some(parsed);
        Ok(())
    }
}

/// Request `options` become arguments of the first step; command text wins.
fn apply_options(parsed: &mut ParsedCommand, options: ArgMap) {
    if options.is_empty() {
        return;
    }
    let target = match parsed.command_type {
        CommandType::Chain => match parsed.steps.first_mut() {
            Some(step) => &mut step.args,
            None => &mut parsed.args,
        },
        CommandType::Single => &mut parsed.args,
    };
    for (key, value) in options {
        target.entry(key).or_insert(value);
    }
}

/// Canonicalises the `@Framework` override against the known frameworks.
pub struct OperatorValidation;

impl Stage for OperatorValidation {
    fn name(&self) -> &'static str {
        "operator-validation"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        let Some(parsed) = ctx.parsed_command.as_mut() else {
            return Ok(());
        };
        let Some(raw) = parsed.framework_override.take() else {
            return Ok(());
        };
        let Some(framework) = find_framework(&raw) else {
            let available = BUILTIN_FRAMEWORKS
                .iter()
                .map(|f| format!("@{}", f.id))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(PlanningError::UnknownFramework {
                id: raw.trim_start_matches('@').to_string(),
                available,
            }
            .into());
        };
        parsed.framework_override = Some(framework.id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ParsedStep;

    fn chain(steps: u32) -> ParsedCommand {
        ParsedCommand {
            command_type: CommandType::Chain,
            format: crate::core::types::ParseFormat::Symbolic,
            raw: String::new(),
            prompt_id: None,
            args: ArgMap::new(),
            steps: (1..=steps)
                .map(|n| {
                    let mut args = ArgMap::new();
                    args.insert("topic".to_string(), format!("t{n}"));
                    ParsedStep::new(n, format!("p{n}"), args)
                })
                .collect(),
            command_gates: Default::default(),
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
    fn options_fill_first_step_without_overriding() {
        let mut parsed = chain(2);
        let options = ArgMap::from([
            ("topic".to_string(), "ignored".to_string()),
            ("depth".to_string(), "3".to_string()),
        ]);
        apply_options(&mut parsed, options);
        assert_eq!(parsed.steps[0].args.get("topic").map(String::as_str), Some("t1"));
        assert_eq!(parsed.steps[0].args.get("depth").map(String::as_str), Some("3"));
        assert!(!parsed.steps[1].args.contains_key("depth"));
    }
}
