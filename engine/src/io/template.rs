//! Template substitution for prompt and chain-step content.
//!
//! Templates are minijinja; variables are the invocation arguments plus the
//! chain outputs captured so far (`previous_step_output`, `step_N_output`) and
//! the plain output of script tools (`tool_<id>`). Undefined variables render
//! as empty strings.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};

use crate::core::types::ArgMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn from_args(args: &ArgMap) -> Self {
        Self {
            values: args.clone(),
        }
    }

    /// Expose captured chain outputs relative to `current_step`.
    pub fn with_step_outputs(mut self, outputs: &BTreeMap<u32, String>, current_step: u32) -> Self {
        for (step, output) in outputs {
            self.values.insert(format!("step_{step}_output"), output.clone());
        }
        if let Some(previous) = current_step.checked_sub(1).and_then(|s| outputs.get(&s)) {
            self.values
                .insert("previous_step_output".to_string(), previous.clone());
        }
        self
    }

    pub fn with_tool_outputs(mut self, outputs: &BTreeMap<String, String>) -> Self {
        for (id, output) in outputs {
            self.values
                .insert(format!("tool_{}", id.replace('-', "_")), output.clone());
        }
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.set_keep_trailing_newline(true);
        Self { env }
    }

    pub fn render(&self, template: &str, vars: &TemplateVars) -> Result<String> {
        self.env
            .render_str(template, &vars.values)
            .context("render prompt template")
    }
}
