//! Parsing of `::` gate clauses.
//!
//! A clause holds one or more items: quoted free-text criteria, named
//! criteria (`name:"text"`), bare references to registered gates, or a
//! `verify:"<command>"` directive followed by its options.

use crate::core::types::{InlineGates, NamedCriterion, ShellVerifyConfig, VerifyPreset};

/// Items parsed from one clause plus diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateClause {
    pub gates: InlineGates,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Quoted(String),
    Named { name: String, value: String },
    Option { key: String, value: String },
    Preset(String),
    Word(String),
}

/// Parse the text after a `::` operator.
pub fn parse_gate_clause(clause: &str, is_known_gate: &dyn Fn(&str) -> bool) -> GateClause {
    let mut out = GateClause::default();
    let clause = clause.trim();
    if clause.is_empty() {
        out.warnings
            .push("empty '::' clause ignored".to_string());
        return out;
    }

    // Unquoted prose is one criterion unless every word names a known gate.
    let has_quotes = clause.contains(['"', '\'']);
    if !has_quotes && !clause.contains(':') {
        let words: Vec<&str> = clause
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|w| !w.is_empty())
            .collect();
        if words.len() > 1 && !words.iter().all(|w| is_known_gate(w)) {
            out.gates.criteria.push(clause.to_string());
            return out;
        }
    }

    let mut verify: Option<VerifyBuilder> = None;
    for token in tokenize(clause) {
        match token {
            Token::Quoted(text) => push_criterion(&mut out, text),
            Token::Named { name, value } if name.eq_ignore_ascii_case("verify") => {
                if verify.is_some() {
                    out.warnings
                        .push("multiple verify directives; the last one wins".to_string());
                }
                if value.trim().is_empty() {
                    out.warnings
                        .push("verify directive has an empty command and was ignored".to_string());
                } else {
                    verify = Some(VerifyBuilder::new(value));
                }
            }
            Token::Named { name, value } if verify.is_some() && is_verify_option(&name) => {
                if let Some(builder) = verify.as_mut() {
                    builder.option(&name, &value, &mut out.warnings);
                }
            }
            Token::Named { name, value } => {
                if value.trim().is_empty() {
                    out.warnings
                        .push(format!("named criterion '{name}' is empty and was ignored"));
                } else {
                    out.gates.named.push(NamedCriterion {
                        name,
                        criteria: value,
                    });
                }
            }
            Token::Option { key, value } => match verify.as_mut() {
                Some(builder) => builder.option(&key, &value, &mut out.warnings),
                None => out
                    .warnings
                    .push(format!("option '{key}:{value}' has no verify directive to apply to")),
            },
            Token::Preset(name) => match (verify.as_mut(), VerifyPreset::parse(&name)) {
                (Some(builder), Some(preset)) => builder.preset = Some(preset),
                (Some(_), None) => out
                    .warnings
                    .push(format!("unknown verify preset ':{name}' (expected fast, full, extended)")),
                (None, _) => out
                    .warnings
                    .push(format!("preset ':{name}' has no verify directive to apply to")),
            },
            Token::Word(word) => {
                if is_known_gate(&word) {
                    out.gates.references.push(word);
                } else {
                    out.warnings.push(format!(
                        "'{word}' is not a registered gate; treated as free-text criteria"
                    ));
                    push_criterion(&mut out, word);
                }
            }
        }
    }

    out.gates.shell_verify = verify.map(VerifyBuilder::build);
    out
}

fn push_criterion(out: &mut GateClause, text: String) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        out.warnings
            .push("empty quoted criterion ignored".to_string());
    } else {
        out.gates.criteria.push(trimmed.to_string());
    }
}

fn tokenize(clause: &str) -> Vec<Token> {
    let chars: Vec<char> = clause.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() || c == ',' {
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let (text, next) = read_quoted(&chars, i);
            tokens.push(Token::Quoted(text));
            i = next;
            continue;
        }
        if c == ':' {
            let (word, next) = read_word(&chars, i + 1);
            tokens.push(Token::Preset(word));
            i = next;
            continue;
        }
        let (word, next) = read_word(&chars, i);
        if word.is_empty() {
            // Stray punctuation becomes part of a free-text criterion.
            let end = chars[i..]
                .iter()
                .position(|c| c.is_whitespace())
                .map(|p| i + p)
                .unwrap_or(chars.len());
            tokens.push(Token::Word(chars[i..end].iter().collect()));
            i = end;
            continue;
        }
        if next < chars.len() && chars[next] == ':' {
            let after = next + 1;
            if after < chars.len() && (chars[after] == '"' || chars[after] == '\'') {
                let (value, end) = read_quoted(&chars, after);
                tokens.push(Token::Named { name: word, value });
                i = end;
            } else {
                let end = chars[after..]
                    .iter()
                    .position(|c| c.is_whitespace() || *c == ',')
                    .map(|p| after + p)
                    .unwrap_or(chars.len());
                let value: String = chars[after..end].iter().collect();
                tokens.push(Token::Option { key: word, value });
                i = end;
            }
            continue;
        }
        tokens.push(Token::Word(word));
        i = next;
    }
    tokens
}

fn read_word(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '-' || chars[end] == '_') {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn read_quoted(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() && chars[i + 1] == quote {
            out.push(quote);
            i += 2;
            continue;
        }
        if c == quote {
            return (out, i + 1);
        }
        out.push(c);
        i += 1;
    }
    (out, chars.len())
}

struct VerifyBuilder {
    command: String,
    preset: Option<VerifyPreset>,
    max: Option<u32>,
    timeout_secs: Option<u64>,
    loop_mode: bool,
    checkpoint: bool,
    rollback: bool,
    dir: Option<String>,
}

impl VerifyBuilder {
    fn new(command: String) -> Self {
        Self {
            command: command.trim().to_string(),
            preset: None,
            max: None,
            timeout_secs: None,
            loop_mode: false,
            checkpoint: false,
            rollback: false,
            dir: None,
        }
    }

    fn option(&mut self, key: &str, value: &str, warnings: &mut Vec<String>) {
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        match key.to_ascii_lowercase().as_str() {
            "loop" => self.loop_mode = parse_flag(value),
            "checkpoint" => self.checkpoint = parse_flag(value),
            "rollback" => self.rollback = parse_flag(value),
            "dir" => self.dir = Some(value.to_string()),
            "max" => match value.parse::<u32>() {
                Ok(n) if n > 0 => self.max = Some(n),
                _ => warnings.push(format!("verify option max:{value} must be a positive integer")),
            },
            "timeout" => match value.parse::<u64>() {
                Ok(n) if n > 0 => self.timeout_secs = Some(n),
                _ => warnings.push(format!(
                    "verify option timeout:{value} must be a positive number of seconds"
                )),
            },
            other => warnings.push(format!("unknown verify option '{other}' ignored")),
        }
    }

    fn build(self) -> ShellVerifyConfig {
        let mut cfg = ShellVerifyConfig::new(self.command);
        if let Some(preset) = self.preset {
            let (max, timeout) = preset.limits();
            cfg.max_iterations = max;
            cfg.timeout = timeout;
            cfg.preset = Some(preset);
        }
        if let Some(max) = self.max {
            cfg.max_iterations = max;
        }
        if let Some(secs) = self.timeout_secs {
            cfg.timeout = secs * 1000;
        }
        cfg.loop_mode = self.loop_mode;
        cfg.checkpoint = self.checkpoint;
        cfg.rollback = self.rollback;
        cfg.working_dir = self.dir;
        cfg
    }
}

fn is_verify_option(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "loop" | "max" | "timeout" | "checkpoint" | "rollback" | "dir"
    )
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1" | "on")
}
