//! Argument parsing for a single step body.
//!
//! Quoted values may span lines and are closed with the same rule the
//! operator scanner uses, so markdown payloads with embedded quotes survive
//! intact and never leak operators into the command.

use std::sync::LazyLock;

use regex::Regex;

use super::error::ParseError;
use super::scan::{QuoteEnd, closing_quote, unquote};
use crate::core::types::{ArgMap, PromptDefinition};

static KEY_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)([A-Za-z_][A-Za-z0-9_-]*)=").expect("key regex should compile")
});

/// Fallback argument name for positional text when a prompt declares none.
pub const DEFAULT_POSITIONAL_ARG: &str = "input";

/// Arguments parsed from a step body plus non-fatal diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub args: ArgMap,
    pub warnings: Vec<String>,
}

/// Parse `text` (everything after the prompt id) into an argument map.
///
/// Accepts `key="value"`, `key='value'`, `key=value`, a JSON object, or free
/// text that binds to the first declared argument.
pub fn parse_arguments(text: &str, prompt: &PromptDefinition) -> Result<ParsedArgs, ParseError> {
    let trimmed = text.trim();
    let mut parsed = ParsedArgs::default();

    if trimmed.starts_with('{') {
        parsed.args = parse_json_arguments(trimmed, &prompt.id)?;
    } else if !trimmed.is_empty() {
        let positional = parse_key_values(trimmed, &mut parsed);
        if !positional.is_empty() {
            bind_positional(positional, prompt, &mut parsed);
        }
    }

    for arg in &prompt.arguments {
        if let Some(default) = &arg.default {
            parsed
                .args
                .entry(arg.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    Ok(parsed)
}

/// Declared required arguments missing from `args`.
pub fn missing_required(prompt: &PromptDefinition, args: &ArgMap) -> Vec<String> {
    prompt
        .arguments
        .iter()
        .filter(|a| a.required && args.get(&a.name).is_none_or(|v| v.trim().is_empty()))
        .map(|a| a.name.clone())
        .collect()
}

fn parse_json_arguments(text: &str, prompt_id: &str) -> Result<ArgMap, ParseError> {
    let value: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(text).map_err(|err| ParseError::InvalidArguments {
            prompt_id: prompt_id.to_string(),
            detail: format!("argument object is not valid JSON: {err}"),
        })?;
    Ok(json_object_to_args(value))
}

/// Flatten a JSON object into string arguments; non-string values keep their JSON text.
pub fn json_object_to_args(object: serde_json::Map<String, serde_json::Value>) -> ArgMap {
    object
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect()
}

/// Consume `key=value` pairs, returning any positional text left over.
fn parse_key_values(text: &str, parsed: &mut ParsedArgs) -> String {
    let mut positional: Vec<&str> = Vec::new();
    let mut pos = 0;

    while pos < text.len() {
        let Some(caps) = KEY_START.captures(&text[pos..]) else {
            positional.push(text[pos..].trim());
            break;
        };
        let key_match = caps.get(1).map(|m| (m.start(), m.end()));
        let Some((key_start, key_end)) = key_match else {
            break;
        };
        let key_start = pos + key_start;
        let key_end = pos + key_end;
        positional.push(text[pos..key_start].trim());
        let key = text[key_start..key_end].to_string();
        let value_start = key_end + 1;

        let (value, next) = read_value(text, value_start);
        if parsed.args.contains_key(&key) {
            parsed
                .warnings
                .push(format!("argument '{key}' given more than once; last value wins"));
        }
        parsed.args.insert(key, value);
        pos = next;
    }

    positional
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read a value starting at `start`; returns the value and the offset after it.
fn read_value(text: &str, start: usize) -> (String, usize) {
    let rest = &text[start..];
    let Some(first) = rest.chars().next() else {
        return (String::new(), text.len());
    };

    if first == '"' || first == '\'' {
        let body_start = start + 1;
        let body = &text[body_start..];
        return match closing_quote(body, first as u8) {
            QuoteEnd::Closed(close) => (unescape(&body[..close], first), body_start + close + 1),
            QuoteEnd::Unterminated(until) => (body[..until].to_string(), body_start + until),
        };
    }

    let end = rest
        .find(char::is_whitespace)
        .map(|i| start + i)
        .unwrap_or(text.len());
    (text[start..end].to_string(), end)
}

fn unescape(value: &str, quote: char) -> String {
    value.replace(&format!("\\{quote}"), &quote.to_string())
}

fn bind_positional(text: String, prompt: &PromptDefinition, parsed: &mut ParsedArgs) {
    let value = unquote(&text).map(str::to_string).unwrap_or(text);
    let target = prompt
        .arguments
        .iter()
        .find(|a| !parsed.args.contains_key(&a.name))
        .map(|a| a.name.clone());
    match target {
        Some(name) => {
            parsed.args.insert(name, value);
        }
        None if prompt.arguments.is_empty() => {
            parsed
                .args
                .insert(DEFAULT_POSITIONAL_ARG.to_string(), value);
        }
        None => {
            parsed.warnings.push(format!(
                "free text ignored for '{}': every declared argument is already set",
                prompt.id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PromptArgument;

    fn prompt(args: &[&str]) -> PromptDefinition {
        PromptDefinition {
            id: "p".to_string(),
            name: String::new(),
            description: String::new(),
            category: "general".to_string(),
            user_message_template: String::new(),
            system_message: None,
            arguments: args
                .iter()
                .map(|name| PromptArgument {
                    name: (*name).to_string(),
                    description: String::new(),
                    required: false,
                    default: None,
                })
                .collect(),
            chain_steps: Vec::new(),
            chain_gates: Vec::new(),
            gates: Default::default(),
            tools: Vec::new(),
            requires_framework: None,
        }
    }

    #[test]
    fn parses_mixed_quote_styles() {
        let parsed = parse_arguments(r#"a="one two" b='three' c=four"#, &prompt(&[])).expect("parse");
        assert_eq!(parsed.args["a"], "one two");
        assert_eq!(parsed.args["b"], "three");
        assert_eq!(parsed.args["c"], "four");
    }

    /// Multi-line markdown with embedded quotes stays in one value.
    #[test]
    fn multiline_value_with_inner_quotes_is_preserved() {
        let body = "content=\"# Title\nShe said \"hi\" here.\n\n- item\" topic=\"x\"";
        let parsed = parse_arguments(body, &prompt(&[])).expect("parse");
        assert_eq!(parsed.args["content"], "# Title\nShe said \"hi\" here.\n\n- item");
        assert_eq!(parsed.args["topic"], "x");
    }

    #[test]
    fn quoted_word_before_closing_quote_stays_in_value() {
        let parsed = parse_arguments(r#"note="use "fast" mode" level='2'"#, &prompt(&[])).expect("parse");
        assert_eq!(parsed.args["note"], r#"use "fast" mode"#);
        assert_eq!(parsed.args["level"], "2");
    }

    #[test]
    fn positional_text_binds_first_declared_argument() {
        let parsed = parse_arguments("explain lifetimes", &prompt(&["topic", "depth"])).expect("parse");
        assert_eq!(parsed.args["topic"], "explain lifetimes");
        assert!(!parsed.args.contains_key("depth"));
    }

    #[test]
    fn positional_text_without_declared_arguments_uses_input() {
        let parsed = parse_arguments("\"hello world\"", &prompt(&[])).expect("parse");
        assert_eq!(parsed.args[DEFAULT_POSITIONAL_ARG], "hello world");
    }

    #[test]
    fn json_object_arguments_are_flattened() {
        let parsed = parse_arguments(r#"{"a": "x", "n": 3}"#, &prompt(&[])).expect("parse");
        assert_eq!(parsed.args["a"], "x");
        assert_eq!(parsed.args["n"], "3");
    }

    #[test]
    fn invalid_json_arguments_are_rejected() {
        let err = parse_arguments("{not json", &prompt(&[])).expect_err("should fail");
        assert!(matches!(err, ParseError::InvalidArguments { .. }));
    }

    #[test]
    fn defaults_fill_missing_arguments() {
        let mut p = prompt(&["tone"]);
        p.arguments[0].default = Some("neutral".to_string());
        p.arguments[0].required = true;
        let parsed = parse_arguments("", &p).expect("parse");
        assert_eq!(parsed.args["tone"], "neutral");
        assert!(missing_required(&p, &parsed.args).is_empty());
    }
}
