//! Symbolic command parser.
//!
//! Turns raw command text into a [`ParsedCommand`]. Supported forms, from
//! simplest to richest:
//!
//! - `>>prompt_id key="value"` (the `>>` is optional for a lone prompt)
//! - a JSON envelope `{"command": ">>prompt_id", "args": {...}}`
//! - symbolic operators: `-->` chains, `::` gate clauses, `@Framework`,
//!   `#style`, `%modifier`, `&` parallel groups, `|` pipes and `* N`
//!   repetition.
//!
//! The parser never drops an operator it recognised: combinations it cannot
//! honour are reported as warnings on the result.

pub mod args;
pub mod error;
pub mod gates;
pub mod scan;
pub mod suggest;

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

pub use error::ParseError;

use crate::core::catalog::{MatchKind, PromptCatalog};
use crate::core::types::{
    ArgMap, CommandType, ExecutionModifier, InlineGates, Operator, OperatorKind, ParseFormat,
    ParsedCommand, ParsedStep, PromptDefinition, StepJoin,
};
use args::{json_object_to_args, missing_required, parse_arguments};
use gates::parse_gate_clause;
use scan::{Spacing, find_top_level, split_top_level};
use suggest::closest_match;

/// Upper bound for `* N` repetition.
pub const MAX_REPETITION: u32 = 20;

static REPETITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(.*?)\s+\*\s*(\d+)\s*$").expect("repetition regex should compile")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("identifier regex should compile")
});

static TEMPLATE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("template var regex should compile")
});

#[derive(Debug, Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    args: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Parser bound to the prompts and gates known for one invocation.
pub struct CommandParser<'a> {
    catalog: &'a PromptCatalog,
    is_known_gate: &'a dyn Fn(&str) -> bool,
}

#[derive(Default)]
struct Draft {
    steps: Vec<ParsedStep>,
    command_gates: InlineGates,
    framework_override: Option<String>,
    style: Option<String>,
    modifiers: Vec<ExecutionModifier>,
    operators: Vec<Operator>,
    warnings: Vec<String>,
    folded_match: bool,
    next_group: u32,
}

impl Draft {
    fn operator(&mut self, kind: OperatorKind, detail: impl Into<String>) {
        self.operators.push(Operator {
            kind,
            detail: detail.into(),
        });
    }
}

impl<'a> CommandParser<'a> {
    pub fn new(catalog: &'a PromptCatalog, is_known_gate: &'a dyn Fn(&str) -> bool) -> Self {
        Self {
            catalog,
            is_known_gate,
        }
    }

    /// Parse raw command text.
    #[instrument(skip_all, fields(len = raw.len()))]
    pub fn parse(&self, raw: &str) -> Result<ParsedCommand, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::EmptyCommand);
        }
        let parsed = if trimmed.starts_with('{') {
            self.parse_envelope(raw, trimmed)?
        } else {
            self.parse_text(raw, trimmed)?
        };
        debug!(
            command_type = ?parsed.command_type,
            format = ?parsed.format,
            steps = parsed.total_steps(),
            warnings = parsed.warnings.len(),
            "command parsed"
        );
        Ok(parsed)
    }

    fn parse_envelope(&self, raw: &str, trimmed: &str) -> Result<ParsedCommand, ParseError> {
        let envelope: Envelope =
            serde_json::from_str(trimmed).map_err(|err| ParseError::MalformedEnvelope {
                detail: err.to_string(),
            })?;
        let inner = envelope.command.trim();
        if inner.is_empty() {
            return Err(ParseError::EmptyCommand);
        }
        if inner.starts_with('{') {
            return Err(ParseError::MalformedEnvelope {
                detail: "nested envelopes are not supported".to_string(),
            });
        }
        let mut parsed = self.parse_text(raw, inner)?;
        if let Some(extra) = envelope.args {
            let extra = json_object_to_args(extra);
            match parsed.command_type {
                CommandType::Single => parsed.args.extend(extra),
                CommandType::Chain => {
                    if let Some(first) = parsed.steps.first_mut() {
                        first.args.extend(extra.clone());
                    }
                    parsed.args.extend(extra);
                }
            }
        }
        parsed.format = ParseFormat::Json;
        parsed.confidence = confidence(ParseFormat::Json, false, parsed.warnings.len());
        Ok(parsed)
    }

    fn parse_text(&self, raw: &str, text: &str) -> Result<ParsedCommand, ParseError> {
        let mut draft = Draft::default();
        let body = self.consume_prefixes(text, &mut draft);
        if body.is_empty() {
            return Err(ParseError::EmptyCommand);
        }

        let segments = split_top_level(body, "-->", Spacing::Any);
        if segments.len() > 1 {
            draft.operator(OperatorKind::Chain, format!("{} steps", segments.len()));
        }
        if let Some(empty) = segments.iter().position(|s| s.is_empty()) {
            return Err(ParseError::AmbiguousFormat {
                fragment: format!("empty chain step at position {}", empty + 1),
            });
        }

        for segment in &segments {
            let pieces = split_top_level(segment, "::", Spacing::Before);
            let step_body = pieces[0];
            if step_body.is_empty() {
                return Err(ParseError::AmbiguousFormat {
                    fragment: (*segment).to_string(),
                });
            }
            self.parse_segment_steps(step_body, &mut draft)?;

            let mut clause_gates = InlineGates::default();
            for clause in &pieces[1..] {
                draft.operator(OperatorKind::Gate, (*clause).to_string());
                let parsed = parse_gate_clause(clause, self.is_known_gate);
                draft.warnings.extend(parsed.warnings);
                clause_gates.merge(parsed.gates);
            }
            if clause_gates.is_empty() {
                continue;
            }
            if segments.len() == 1 {
                draft.command_gates.merge(clause_gates);
            } else if let Some(step) = draft.steps.last_mut() {
                step.inline_gates.merge(clause_gates);
            }
        }

        self.finish(raw, draft)
    }

    /// Strip leading `%modifier`, `#style` and `@Framework` tokens.
    fn consume_prefixes<'t>(&self, text: &'t str, draft: &mut Draft) -> &'t str {
        let mut rest = text.trim_start();
        loop {
            let Some(first) = rest.chars().next() else {
                return rest;
            };
            if !matches!(first, '%' | '#' | '@') {
                return rest;
            }
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let token = &rest[1..end];
            match first {
                '%' => match ExecutionModifier::parse(token) {
                    Some(modifier) => {
                        draft.operator(OperatorKind::Modifier, token);
                        if !draft.modifiers.contains(&modifier) {
                            draft.modifiers.push(modifier);
                        }
                    }
                    None => {
                        draft.operator(OperatorKind::Modifier, token);
                        draft.warnings.push(format!(
                            "unknown modifier '%{token}' (expected clean, lean, guided, judge)"
                        ));
                    }
                },
                '#' => {
                    draft.operator(OperatorKind::Style, token);
                    if draft.style.is_some() {
                        draft
                            .warnings
                            .push(format!("multiple styles given; '#{token}' wins"));
                    }
                    draft.style = Some(token.to_string());
                }
                _ => {
                    draft.operator(OperatorKind::Framework, token);
                    if draft.framework_override.is_some() {
                        draft
                            .warnings
                            .push(format!("multiple framework overrides given; '@{token}' wins"));
                    }
                    draft.framework_override = Some(token.to_string());
                }
            }
            rest = rest[end..].trim_start();
        }
    }

    /// Parse one `-->` segment, which may hold `&` groups, `|` pipes and `* N`.
    fn parse_segment_steps(&self, body: &str, draft: &mut Draft) -> Result<(), ParseError> {
        let parallel = split_top_level(body, "&", Spacing::Around);
        let group = if parallel.len() > 1 {
            draft.next_group += 1;
            draft.operator(OperatorKind::Parallel, format!("{} members", parallel.len()));
            Some(draft.next_group)
        } else {
            None
        };

        let first_in_group = draft.steps.len() + 1;
        for member in parallel {
            let piped = split_top_level(member, "|", Spacing::Around);
            if piped.len() > 1 {
                draft.operator(OperatorKind::Pipe, format!("{} stages", piped.len()));
            }
            for (pipe_idx, stage) in piped.into_iter().enumerate() {
                if stage.is_empty() {
                    return Err(ParseError::AmbiguousFormat {
                        fragment: member.to_string(),
                    });
                }
                let join = match (group, pipe_idx) {
                    (_, i) if i > 0 => StepJoin::Pipe,
                    (Some(g), _) => StepJoin::Parallel { group: g },
                    (None, _) => StepJoin::Sequential,
                };
                self.parse_step(stage, join, draft)?;
            }
        }

        if let Some(g) = group {
            draft.warnings.push(format!(
                "parallel group {g} (steps {first_in_group}-{}) runs sequentially; each member still returns its own output",
                draft.steps.len()
            ));
        }
        Ok(())
    }

    fn parse_step(&self, text: &str, join: StepJoin, draft: &mut Draft) -> Result<(), ParseError> {
        let (text, repeat) = match REPETITION.captures(text) {
            Some(caps) => {
                let body = caps.get(1).map_or("", |m| m.as_str());
                let count: u32 = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(1);
                draft.operator(OperatorKind::Repetition, count.to_string());
                let clamped = count.clamp(1, MAX_REPETITION);
                if clamped != count {
                    draft.warnings.push(format!(
                        "repetition '* {count}' clamped to {clamped} (allowed 1..={MAX_REPETITION})"
                    ));
                }
                (body, clamped)
            }
            None => (text, 1),
        };

        let text = text.trim();
        let reference_text = text
            .strip_prefix(">>")
            .or_else(|| text.strip_prefix('/'))
            .unwrap_or(text)
            .trim_start();
        let id_end = reference_text
            .find(char::is_whitespace)
            .unwrap_or(reference_text.len());
        let reference = &reference_text[..id_end];
        let rest = &reference_text[id_end..];

        if reference.is_empty() || !IDENTIFIER.is_match(reference) {
            return Err(ParseError::AmbiguousFormat {
                fragment: if reference.is_empty() {
                    text.to_string()
                } else {
                    reference.to_string()
                },
            });
        }

        let (prompt, kind) = self.resolve(reference)?;
        if kind == MatchKind::CaseInsensitive {
            draft.folded_match = true;
        }
        let parsed_args = parse_arguments(rest, prompt)?;
        draft.warnings.extend(parsed_args.warnings);

        for _ in 0..repeat {
            let mut step = ParsedStep::new(
                draft.steps.len() as u32 + 1,
                prompt.id.clone(),
                parsed_args.args.clone(),
            );
            step.join = join;
            draft.steps.push(step);
        }
        Ok(())
    }

    fn resolve(&self, reference: &str) -> Result<(&'a PromptDefinition, MatchKind), ParseError> {
        self.catalog
            .resolve(reference)
            .ok_or_else(|| ParseError::UnknownPrompt {
                id: reference.to_string(),
                suggestion: closest_match(reference, self.catalog.ids()),
            })
    }

    fn finish(&self, raw: &str, mut draft: Draft) -> Result<ParsedCommand, ParseError> {
        let has_chain_operator = draft
            .operators
            .iter()
            .any(|op| matches!(op.kind, OperatorKind::Chain | OperatorKind::Repetition | OperatorKind::Parallel | OperatorKind::Pipe));

        check_modifier_conflicts(&mut draft);

        let first = draft
            .steps
            .first()
            .cloned()
            .ok_or_else(|| ParseError::AmbiguousFormat {
                fragment: raw.trim().to_string(),
            })?;
        let multi_step = draft.steps.len() > 1;
        for step in &draft.steps {
            let Some(prompt) = self.catalog.get(&step.prompt_id) else {
                continue;
            };
            let missing = missing_required(prompt, &step.args);
            if missing.is_empty() || prompt.is_chain() {
                continue;
            }
            let missing = missing.join(", ");
            return Err(ParseError::InvalidArguments {
                prompt_id: prompt.id.clone(),
                detail: if multi_step {
                    format!("step {} is missing required argument(s): {missing}", step.step_number)
                } else {
                    format!("missing required argument(s): {missing}")
                },
            });
        }

        let single_chain_prompt = !has_chain_operator
            && draft.steps.len() == 1
            && self
                .catalog
                .get(&first.prompt_id)
                .is_some_and(PromptDefinition::is_chain);

        let mut promoted = false;
        let (command_type, prompt_id, args, steps) = if single_chain_prompt {
            promoted = true;
            let chain = self.catalog.get(&first.prompt_id).cloned().ok_or_else(|| {
                ParseError::UnknownPrompt {
                    id: first.prompt_id.clone(),
                    suggestion: None,
                }
            })?;
            let steps = self.expand_chain(&chain, &first, &mut draft)?;
            (CommandType::Chain, Some(chain.id), first.args, steps)
        } else if has_chain_operator || draft.steps.len() > 1 {
            for step in &draft.steps {
                if self.catalog.get(&step.prompt_id).is_some_and(PromptDefinition::is_chain) {
                    draft.warnings.push(format!(
                        "'{}' defines its own chain steps; inside a '-->' chain it runs as a single step",
                        step.prompt_id
                    ));
                }
            }
            let steps = std::mem::take(&mut draft.steps);
            (CommandType::Chain, None, ArgMap::new(), steps)
        } else {
            (
                CommandType::Single,
                Some(first.prompt_id.clone()),
                first.args,
                Vec::new(),
            )
        };

        let format = if draft.operators.is_empty() {
            ParseFormat::Simple
        } else {
            ParseFormat::Symbolic
        };

        Ok(ParsedCommand {
            command_type,
            format,
            raw: raw.to_string(),
            prompt_id,
            args,
            steps,
            command_gates: draft.command_gates,
            framework_override: draft.framework_override,
            style: draft.style,
            modifiers: draft.modifiers,
            operators: draft.operators,
            confidence: confidence(format, draft.folded_match, draft.warnings.len()),
            warnings: draft.warnings,
            promoted_from_single: promoted,
            resolved_gate_ids: Vec::new(),
        })
    }

    /// Expand a chain prompt's declared steps using the invocation arguments.
    fn expand_chain(
        &self,
        chain: &PromptDefinition,
        invocation: &ParsedStep,
        draft: &mut Draft,
    ) -> Result<Vec<ParsedStep>, ParseError> {
        let mut steps = Vec::with_capacity(chain.chain_steps.len());
        for (idx, declared) in chain.chain_steps.iter().enumerate() {
            let (prompt, _) = self.resolve(&declared.prompt_id)?;
            let mut args = invocation.args.clone();
            for (key, template) in &declared.args {
                args.insert(key.clone(), substitute(template, &invocation.args));
            }
            let mut step = ParsedStep::new(idx as u32 + 1, prompt.id.clone(), args);
            // Gates written on the lone invocation belong to the whole chain.
            step.inline_gates = InlineGates::default();
            steps.push(step);
        }
        if steps.is_empty() {
            draft
                .warnings
                .push(format!("chain prompt '{}' declares no steps", chain.id));
        }
        Ok(steps)
    }
}

/// Replace `{{ name }}` placeholders that refer to known invocation arguments.
///
/// Unknown placeholders (e.g. `previous_step_output`) are left for render time.
fn substitute(template: &str, args: &ArgMap) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).map_or("", |m| m.as_str());
            match args.get(name) {
                Some(value) => value.clone(),
                None => caps.get(0).map_or(String::new(), |m| m.as_str().to_string()),
            }
        })
        .into_owned()
}

fn check_modifier_conflicts(draft: &mut Draft) {
    let clean = draft.modifiers.contains(&ExecutionModifier::Clean);
    let lean = draft.modifiers.contains(&ExecutionModifier::Lean);
    let guided = draft.modifiers.contains(&ExecutionModifier::Guided);
    if clean && guided {
        draft
            .warnings
            .push("'%clean' and '%guided' conflict; '%clean' wins".to_string());
    }
    if clean && draft.framework_override.is_some() {
        draft.warnings.push(
            "'%clean' disables framework injection; the '@' override only changes the active framework"
                .to_string(),
        );
    }
    if lean && guided {
        draft
            .warnings
            .push("'%lean' and '%guided' conflict; '%lean' wins".to_string());
    }
}

fn confidence(format: ParseFormat, folded_match: bool, warnings: usize) -> f32 {
    let base = match format {
        ParseFormat::Simple | ParseFormat::Json => 1.0,
        ParseFormat::Symbolic => 0.9,
    };
    let folded = if folded_match { 0.1 } else { 0.0 };
    (base - folded - 0.05 * warnings as f32).clamp(0.1, 1.0)
}

/// True when `text` contains an unquoted chain operator.
pub fn has_chain_operator(text: &str) -> bool {
    !find_top_level(text, "-->", Spacing::Any).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VerifyPreset;
    use crate::test_support::{chain_prompt, prompt, prompt_with_args};

    fn catalog() -> PromptCatalog {
        let mut research = chain_prompt("research", &["gather", "summarize"]);
        research.chain_steps[0]
            .args
            .insert("topic".to_string(), "{{ topic }}".to_string());
        research.chain_steps[1]
            .args
            .insert("notes".to_string(), "{{ previous_step_output }}".to_string());
        PromptCatalog::new(vec![
            prompt_with_args("tool_a", "A {{ x }}", &["x"]),
            prompt_with_args("tool_b", "B {{ y }}", &["y"]),
            prompt_with_args("analyze", "Analyze {{ topic }}", &["topic"]),
            prompt("gather", "Gather {{ topic }}"),
            prompt("summarize", "Summarize {{ notes }}"),
            research,
        ])
    }

    fn known_gate(id: &str) -> bool {
        id == "code-quality"
    }

    fn parse(text: &str) -> Result<ParsedCommand, ParseError> {
        let catalog = catalog();
        CommandParser::new(&catalog, &known_gate).parse(text)
    }

    #[test]
    fn chain_with_step_level_gate_round_trips() {
        let cmd = parse(r#">>tool_a x="1" :: "be terse" --> >>tool_b y="2""#).expect("parse");
        assert_eq!(cmd.command_type, CommandType::Chain);
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[0].inline_gates.criteria, vec!["be terse"]);
        assert!(cmd.steps[1].inline_gates.is_empty());
        assert_eq!(cmd.steps[0].args["x"], "1");
        assert_eq!(cmd.steps[1].args["y"], "2");
        assert_eq!(cmd.steps[1].step_number, 2);
        assert_eq!(cmd.format, ParseFormat::Symbolic);
    }

    #[test]
    fn plain_prompt_is_simple_single() {
        let cmd = parse(">>analyze topic=\"ownership\"").expect("parse");
        assert_eq!(cmd.command_type, CommandType::Single);
        assert_eq!(cmd.prompt_id.as_deref(), Some("analyze"));
        assert_eq!(cmd.args["topic"], "ownership");
        assert_eq!(cmd.format, ParseFormat::Simple);
        assert!((cmd.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert_eq!(parse("   ").expect_err("empty"), ParseError::EmptyCommand);
    }

    #[test]
    fn unknown_prompt_suggests_closest() {
        let err = parse(">>anaylze topic=x").expect_err("unknown");
        assert_eq!(
            err,
            ParseError::UnknownPrompt {
                id: "anaylze".to_string(),
                suggestion: Some("analyze".to_string()),
            }
        );
    }

    #[test]
    fn malformed_envelope_reports_guidance() {
        let err = parse("{\"command\": ").expect_err("malformed");
        assert!(matches!(err, ParseError::MalformedEnvelope { .. }));
    }

    #[test]
    fn envelope_args_merge_into_single_prompt() {
        let cmd = parse(r#"{"command": ">>analyze", "args": {"topic": "traits"}}"#).expect("parse");
        assert_eq!(cmd.format, ParseFormat::Json);
        assert_eq!(cmd.args["topic"], "traits");
    }

    #[test]
    fn ambiguous_identifier_is_rejected() {
        let err = parse(">>what?? is this").expect_err("ambiguous");
        assert!(matches!(err, ParseError::AmbiguousFormat { .. }));
    }

    #[test]
    fn chain_prompt_is_promoted_from_single_syntax() {
        let cmd = parse(">>research topic=\"rust\"").expect("parse");
        assert_eq!(cmd.command_type, CommandType::Chain);
        assert!(cmd.promoted_from_single);
        assert_eq!(cmd.prompt_id.as_deref(), Some("research"));
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[0].args["topic"], "rust");
        assert_eq!(cmd.steps[1].args["notes"], "{{ previous_step_output }}");
        assert_eq!(cmd.chain_base(), "research");
    }

    #[test]
    fn prefixes_are_captured() {
        let cmd = parse("%lean #analytical @react >>analyze topic=x").expect("parse");
        assert_eq!(cmd.modifiers, vec![ExecutionModifier::Lean]);
        assert_eq!(cmd.style.as_deref(), Some("analytical"));
        assert_eq!(cmd.framework_override.as_deref(), Some("react"));
        assert_eq!(cmd.format, ParseFormat::Symbolic);
    }

    #[test]
    fn final_step_gates_attach_to_final_step() {
        let cmd = parse(">>tool_a x=1 --> >>tool_b y=2 :: code-quality :: verify:\"cargo test\" :fast")
            .expect("parse");
        assert!(cmd.steps[0].inline_gates.is_empty());
        assert!(cmd.command_gates.is_empty());
        let last = &cmd.steps[1].inline_gates;
        assert_eq!(last.references, vec!["code-quality"]);
        let verify = last.shell_verify.as_ref().expect("verify");
        assert_eq!(verify.preset, Some(VerifyPreset::Fast));
        assert_eq!(verify.max_iterations, 1);
        assert_eq!(cmd.shell_verify().map(|v| v.command.as_str()), Some("cargo test"));
    }

    #[test]
    fn single_prompt_gates_attach_to_command() {
        let cmd = parse(">>analyze topic=x :: \"cite sources\"").expect("parse");
        assert_eq!(cmd.command_type, CommandType::Single);
        assert_eq!(cmd.command_gates.criteria, vec!["cite sources"]);
    }

    #[test]
    fn repetition_expands_and_clamps() {
        let cmd = parse(">>analyze topic=x * 3").expect("parse");
        assert_eq!(cmd.command_type, CommandType::Chain);
        assert_eq!(cmd.steps.len(), 3);

        let cmd = parse(">>analyze topic=x * 50").expect("parse");
        assert_eq!(cmd.steps.len(), MAX_REPETITION as usize);
        assert!(cmd.warnings.iter().any(|w| w.contains("clamped")));
    }

    #[test]
    fn parallel_group_is_kept_with_warning() {
        let cmd = parse(">>tool_a x=1 & >>tool_b y=2 --> >>analyze topic=z").expect("parse");
        assert_eq!(cmd.steps.len(), 3);
        assert_eq!(cmd.steps[0].join, StepJoin::Parallel { group: 1 });
        assert_eq!(cmd.steps[1].join, StepJoin::Parallel { group: 1 });
        assert_eq!(cmd.steps[2].join, StepJoin::Sequential);
        assert!(cmd.warnings.iter().any(|w| w.contains("parallel group 1")));
    }

    #[test]
    fn pipe_marks_following_step() {
        let cmd = parse(">>gather | >>summarize").expect("parse");
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[1].join, StepJoin::Pipe);
    }

    #[test]
    fn case_insensitive_match_lowers_confidence() {
        let cmd = parse(">>ANALYZE topic=x").expect("parse");
        assert_eq!(cmd.prompt_id.as_deref(), Some("analyze"));
        assert!(cmd.confidence < 1.0);
    }

    #[test]
    fn multiline_argument_survives_operators() {
        let cmd = parse(">>tool_a x=\"line one\nline --> two\" --> >>tool_b y=\"2\"").expect("parse");
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[0].args["x"], "line one\nline --> two");
    }

    #[test]
    fn inner_quotes_do_not_leak_operators() {
        let mut prompts = catalog().all().to_vec();
        prompts.push(prompt_with_args("doc", "{{ content }}", &["content"]));
        let catalog = PromptCatalog::new(prompts);
        let parser = CommandParser::new(&catalog, &known_gate);

        let cmd = parser
            .parse(">>doc content=\"She said \"hi\" | a | b |\nend\"")
            .expect("pipe inside value");
        assert_eq!(cmd.command_type, CommandType::Single);
        assert_eq!(cmd.args["content"], "She said \"hi\" | a | b |\nend");

        let cmd = parser
            .parse(r#">>doc content="x "y" & z" & >>tool_a x="1""#)
            .expect("parallel after value");
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[0].args["content"], r#"x "y" & z"#);

        let cmd = parser
            .parse(r#">>doc content="say "go" --> now" --> >>tool_b y="2""#)
            .expect("chain after value");
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[0].args["content"], r#"say "go" --> now"#);
        assert_eq!(cmd.steps[1].args["y"], "2");
    }

    #[test]
    fn required_arguments_are_checked_on_every_step() {
        let mut strict = prompt("strict", "{{ value }}");
        strict.arguments = vec![crate::core::types::PromptArgument {
            name: "value".to_string(),
            description: String::new(),
            required: true,
            default: None,
        }];
        let catalog = PromptCatalog::new(vec![strict, prompt("gather", "Gather")]);
        let parser = CommandParser::new(&catalog, &known_gate);

        let err = parser.parse(">>gather --> >>strict").expect_err("missing");
        let ParseError::InvalidArguments { prompt_id, detail } = err else {
            panic!("expected invalid arguments, got {err:?}");
        };
        assert_eq!(prompt_id, "strict");
        assert!(detail.contains("step 2"), "{detail}");
        assert!(detail.contains("value"), "{detail}");

        assert!(parser.parse(">>gather --> >>strict value=\"x\"").is_ok());
    }

    #[test]
    fn missing_required_argument_is_reported() {
        let mut strict = prompt("strict", "{{ value }}");
        strict.arguments = vec![crate::core::types::PromptArgument {
            name: "value".to_string(),
            description: String::new(),
            required: true,
            default: None,
        }];
        let catalog = PromptCatalog::new(vec![strict]);
        let err = CommandParser::new(&catalog, &known_gate)
            .parse(">>strict")
            .expect_err("missing");
        assert!(matches!(err, ParseError::InvalidArguments { .. }));
    }
}
