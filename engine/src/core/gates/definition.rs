//! Gate definitions and their pass criteria.
//!
//! Criteria are a closed set of variants. Content, pattern and schema checks
//! can be evaluated automatically; shell verification runs through the
//! verification loop and self-review criteria are judged by the caller.

use serde::{Deserialize, Serialize};

use crate::core::types::ShellVerifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    /// Blocking-capable check that expects a verdict.
    #[default]
    Validation,
    /// Advisory text injected into the prompt.
    Guidance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateCategory {
    Methodology,
    #[default]
    Quality,
    Security,
    Custom,
}

/// Discriminant of [`PassCriterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaType {
    ContentCheck,
    PatternMatch,
    SchemaMatch,
    ShellVerify,
    SelfReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassCriterion {
    ContentCheck {
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        required: Vec<String>,
        #[serde(default)]
        forbidden: Vec<String>,
    },
    PatternMatch {
        pattern: String,
    },
    SchemaMatch {
        schema: serde_json::Value,
    },
    ShellVerify {
        config: ShellVerifyConfig,
    },
    SelfReview {
        criteria: String,
    },
}

impl PassCriterion {
    pub fn criteria_type(&self) -> CriteriaType {
        match self {
            Self::ContentCheck { .. } => CriteriaType::ContentCheck,
            Self::PatternMatch { .. } => CriteriaType::PatternMatch,
            Self::SchemaMatch { .. } => CriteriaType::SchemaMatch,
            Self::ShellVerify { .. } => CriteriaType::ShellVerify,
            Self::SelfReview { .. } => CriteriaType::SelfReview,
        }
    }

    /// One-line description used in guidance and review prompts.
    pub fn describe(&self) -> String {
        match self {
            Self::ContentCheck {
                min_length,
                max_length,
                required,
                forbidden,
            } => {
                let mut parts = Vec::new();
                if let Some(min) = min_length {
                    parts.push(format!("at least {min} characters"));
                }
                if let Some(max) = max_length {
                    parts.push(format!("at most {max} characters"));
                }
                if !required.is_empty() {
                    parts.push(format!("mentions {}", required.join(", ")));
                }
                if !forbidden.is_empty() {
                    parts.push(format!("avoids {}", forbidden.join(", ")));
                }
                if parts.is_empty() {
                    "non-empty output".to_string()
                } else {
                    parts.join("; ")
                }
            }
            Self::PatternMatch { pattern } => format!("output matches /{pattern}/"),
            Self::SchemaMatch { .. } => "output is JSON matching the declared schema".to_string(),
            Self::ShellVerify { config } => format!("`{}` exits with status 0", config.command),
            Self::SelfReview { criteria } => criteria.clone(),
        }
    }
}

/// Restricts automatic activation of a gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateActivation {
    pub prompt_categories: Vec<String>,
    pub frameworks: Vec<String>,
}

impl GateActivation {
    /// Empty lists mean "any".
    pub fn matches(&self, category: &str, framework: Option<&str>) -> bool {
        let category_ok = self.prompt_categories.is_empty()
            || self
                .prompt_categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(category));
        let framework_ok = self.frameworks.is_empty()
            || framework.is_some_and(|f| self.frameworks.iter().any(|x| x.eq_ignore_ascii_case(f)));
        category_ok && framework_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: GateKind,
    #[serde(default)]
    pub category: GateCategory,
    #[serde(default)]
    pub guidance: String,
    #[serde(default)]
    pub criteria: Vec<PassCriterion>,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub activation: GateActivation,
}

impl GateDefinition {
    /// A blocking gate whose criteria must be judged by the caller.
    pub fn requires_review(&self) -> bool {
        self.blocking
            && self.kind == GateKind::Validation
            && self
                .criteria
                .iter()
                .any(|c| !matches!(c, PassCriterion::ShellVerify { .. }))
    }

    pub fn shell_verify(&self) -> Option<&ShellVerifyConfig> {
        self.criteria.iter().find_map(|c| match c {
            PassCriterion::ShellVerify { config } => Some(config),
            _ => None,
        })
    }

    /// Review prompt for this gate: guidance plus each criterion.
    pub fn review_prompt(&self) -> String {
        let mut out = format!("**{}**", self.name);
        if !self.guidance.trim().is_empty() {
            out.push_str(&format!(": {}", self.guidance.trim()));
        }
        for criterion in &self.criteria {
            out.push_str(&format!("\n  - {}", criterion.describe()));
        }
        out
    }
}

/// Result of checking one auto-evaluable criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionOutcome {
    pub gate_id: String,
    pub passed: bool,
    pub message: String,
    pub blocking: bool,
}

/// Evaluate the automatically checkable criteria of `gate` against `output`.
///
/// Shell and self-review criteria are skipped.
pub fn evaluate_gate(gate: &GateDefinition, output: &str) -> Vec<CriterionOutcome> {
    gate.criteria
        .iter()
        .filter_map(|criterion| {
            evaluate_criterion(criterion, output).map(|(passed, message)| CriterionOutcome {
                gate_id: gate.id.clone(),
                passed,
                message,
                blocking: gate.blocking,
            })
        })
        .collect()
}

fn evaluate_criterion(criterion: &PassCriterion, output: &str) -> Option<(bool, String)> {
    match criterion {
        PassCriterion::ContentCheck {
            min_length,
            max_length,
            required,
            forbidden,
        } => {
            let len = output.trim().chars().count();
            let mut problems = Vec::new();
            if let Some(min) = min_length
                && len < *min
            {
                problems.push(format!("length {len} is below {min}"));
            }
            if let Some(max) = max_length
                && len > *max
            {
                problems.push(format!("length {len} exceeds {max}"));
            }
            let lowered = output.to_lowercase();
            for term in required {
                if !lowered.contains(&term.to_lowercase()) {
                    problems.push(format!("missing required term '{term}'"));
                }
            }
            for term in forbidden {
                if lowered.contains(&term.to_lowercase()) {
                    problems.push(format!("contains forbidden term '{term}'"));
                }
            }
            Some(if problems.is_empty() {
                (true, "content check passed".to_string())
            } else {
                (false, problems.join("; "))
            })
        }
        PassCriterion::PatternMatch { pattern } => Some(match regex::Regex::new(pattern) {
            Ok(re) if re.is_match(output) => (true, format!("matches /{pattern}/")),
            Ok(_) => (false, format!("does not match /{pattern}/")),
            Err(err) => (false, format!("invalid pattern /{pattern}/: {err}")),
        }),
        PassCriterion::SchemaMatch { schema } => Some(check_schema(schema, output)),
        PassCriterion::ShellVerify { .. } | PassCriterion::SelfReview { .. } => None,
    }
}

fn check_schema(schema: &serde_json::Value, output: &str) -> (bool, String) {
    let instance: serde_json::Value = match serde_json::from_str(output.trim()) {
        Ok(value) => value,
        Err(err) => return (false, format!("output is not JSON: {err}")),
    };
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(err) => return (false, format!("invalid schema: {err}")),
    };
    let messages: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        (true, "schema matched".to_string())
    } else {
        (false, messages.join("; "))
    }
}
