//! The `prompt_engine` tool call parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::gates::{GateDefinition, self_review_gate, slugify};
use crate::core::review::GateAction;
use crate::core::session::GateScope;
use crate::core::types::ArgMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptEngineRequest {
    pub command: Option<String>,
    pub chain_id: Option<String>,
    pub user_response: Option<String>,
    pub gate_verdict: Option<String>,
    pub gate_action: Option<GateAction>,
    pub force_restart: bool,
    pub gates: Vec<String>,
    pub api_validation: bool,
    pub quality_gates: Vec<String>,
    pub custom_checks: Vec<CustomCheck>,
    pub temporary_gates: Vec<TemporaryGateSpec>,
    pub gate_scope: Option<GateScope>,
    /// Extra template arguments for the first step.
    pub options: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCheck {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryGateSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub blocking: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("either `command` or `chain_id` is required")]
    MissingCommand,

    #[error(
        "`force_restart` cannot be combined with `chain_id`; send the command with `force_restart` to start a new run, or `chain_id` alone to resume"
    )]
    ConflictingResumeOptions,

    #[error("invalid {kind} #{index}: {detail}")]
    InvalidGate {
        kind: &'static str,
        index: usize,
        detail: String,
    },
}

impl CustomCheck {
    pub fn to_definition(&self) -> GateDefinition {
        let criteria = if self.description.trim().is_empty() {
            self.name.clone()
        } else {
            self.description.clone()
        };
        self_review_gate(
            format!("custom-{}", slugify(&self.name)),
            self.name.clone(),
            vec![criteria],
            true,
        )
    }
}

impl TemporaryGateSpec {
    pub fn to_definition(&self) -> GateDefinition {
        let id = self
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| format!("temp-{}", slugify(&self.name)), str::to_string);
        self_review_gate(
            id,
            self.name.clone(),
            self.criteria.clone(),
            self.blocking.unwrap_or(true),
        )
    }
}

impl PromptEngineRequest {
    /// Trim text fields, drop empty ones and reject conflicting options.
    pub fn normalize(&mut self) -> Result<(), RequestError> {
        self.command = non_empty(self.command.take());
        self.chain_id = non_empty(self.chain_id.take()).map(|s| s.trim().to_string());
        self.gate_verdict = non_empty(self.gate_verdict.take()).map(|s| s.trim().to_string());
        self.user_response = non_empty(self.user_response.take());

        if self.force_restart && self.chain_id.is_some() {
            return Err(RequestError::ConflictingResumeOptions);
        }
        if self.command.is_none() && self.chain_id.is_none() {
            return Err(RequestError::MissingCommand);
        }

        for (index, check) in self.custom_checks.iter().enumerate() {
            if check.name.trim().is_empty() {
                return Err(RequestError::InvalidGate {
                    kind: "custom_checks",
                    index,
                    detail: "name is empty".to_string(),
                });
            }
        }
        for (index, spec) in self.temporary_gates.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(RequestError::InvalidGate {
                    kind: "temporary_gates",
                    index,
                    detail: "name is empty".to_string(),
                });
            }
            if spec.criteria.iter().all(|c| c.trim().is_empty()) {
                return Err(RequestError::InvalidGate {
                    kind: "temporary_gates",
                    index,
                    detail: format!("gate '{}' has no criteria", spec.name),
                });
            }
        }

        let mut selected: Vec<String> = Vec::new();
        for id in self.gates.iter().chain(&self.quality_gates) {
            let id = id.trim();
            if !id.is_empty() && !selected.iter().any(|s| s == id) {
                selected.push(id.to_string());
            }
        }
        self.gates = selected;
        self.quality_gates.clear();
        Ok(())
    }

    pub fn scope(&self) -> GateScope {
        self.gate_scope.unwrap_or_default()
    }

    /// Temporary gates and custom checks as definitions.
    pub fn requested_gates(&self) -> Vec<GateDefinition> {
        self.temporary_gates
            .iter()
            .map(TemporaryGateSpec::to_definition)
            .chain(self.custom_checks.iter().map(CustomCheck::to_definition))
            .collect()
    }

    /// `options` rendered as string arguments.
    pub fn option_args(&self) -> ArgMap {
        self.options
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
