//! Script-tool triggering, input validation and result classification.
//!
//! Running the tool is an `io` concern; everything here works on the tool
//! definition and the captured execution record.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ArgMap, ScriptToolDefinition, ScriptTrigger};

pub const DEFAULT_VALIDATION_ERROR: &str = "Validation failed";
/// Step argument that confirms every pending tool of the step.
pub const CONFIRM_ARG: &str = "confirm";

/// Captured result of one script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecution {
    pub success: bool,
    /// Parsed JSON stdout, when stdout was JSON.
    pub output: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScriptExecution {
    pub fn from_process(
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration: Duration,
        timed_out: bool,
    ) -> Self {
        let output = serde_json::from_str::<Value>(stdout.trim()).ok();
        let error = if timed_out {
            Some(format!("timed out after {}ms", duration.as_millis()))
        } else if exit_code != 0 {
            Some(format!("exited with status {exit_code}"))
        } else {
            None
        };
        Self {
            success: exit_code == 0 && !timed_out,
            output,
            stdout,
            stderr,
            exit_code,
            duration_ms: duration.as_millis() as u64,
            error,
        }
    }
}

/// JSON contract for auto-approval flows.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub auto_execute: Option<Value>,
}

/// Arguments as the JSON object sent to the tool on stdin.
pub fn args_to_json(args: &ArgMap) -> Value {
    Value::Object(
        args.iter()
            .map(|(k, v)| {
                let value = serde_json::from_str::<Value>(v)
                    .ok()
                    .filter(|parsed| !parsed.is_string())
                    .unwrap_or_else(|| Value::String(v.clone()));
                (k.clone(), value)
            })
            .collect(),
    )
}

/// Validate tool input against its schema; no schema accepts everything.
pub fn validate_input(tool: &ScriptToolDefinition, input: &Value) -> Result<(), Vec<String>> {
    let Some(schema) = &tool.input_schema else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| vec![format!("invalid input schema for tool '{}': {err}", tool.id)])?;
    let errors: Vec<String> = validator
        .iter_errors(input)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// What the execution stage should do with a tool before running anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPlan {
    Run,
    AwaitConfirmation,
    Skip,
    InvalidInput(Vec<String>),
}

pub fn plan_tool(tool: &ScriptToolDefinition, args: &ArgMap) -> ToolPlan {
    let input = args_to_json(args);
    match tool.trigger {
        ScriptTrigger::Never => return ToolPlan::Skip,
        ScriptTrigger::SchemaMatch => {
            if tool.input_schema.is_none() || validate_input(tool, &input).is_err() {
                return ToolPlan::Skip;
            }
        }
        ScriptTrigger::Always => {
            if let Err(errors) = validate_input(tool, &input) {
                return ToolPlan::InvalidInput(errors);
            }
        }
    }
    let confirmed = args
        .get(CONFIRM_ARG)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if tool.confirm && !tool.auto_approve_on_valid && !confirmed {
        return ToolPlan::AwaitConfirmation;
    }
    ToolPlan::Run
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolDisposition {
    AutoApproved { auto_execute: Option<Value> },
    ValidationFailed(Vec<String>),
    Completed,
    Failed { exit_code: i32, stderr: String },
}

/// Classify a finished run. Auto-approval never defaults to success.
pub fn classify(tool: &ScriptToolDefinition, execution: &ScriptExecution) -> ToolDisposition {
    if tool.auto_approve_on_valid {
        let report = execution
            .output
            .clone()
            .and_then(|v| serde_json::from_value::<ValidationReport>(v).ok());
        return match report {
            Some(report) if report.valid && execution.success => ToolDisposition::AutoApproved {
                auto_execute: report.auto_execute,
            },
            Some(report) if !report.errors.is_empty() => {
                ToolDisposition::ValidationFailed(report.errors)
            }
            _ => ToolDisposition::ValidationFailed(vec![DEFAULT_VALIDATION_ERROR.to_string()]),
        };
    }
    if execution.success {
        ToolDisposition::Completed
    } else {
        ToolDisposition::Failed {
            exit_code: execution.exit_code,
            stderr: execution.error.clone().map_or_else(
                || execution.stderr.clone(),
                |e| format!("{e}\n{}", execution.stderr).trim_end().to_string(),
            ),
        }
    }
}

/// Script results accumulated for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutcomes {
    pub auto_approved_tools: Vec<String>,
    pub confirmation_required: Vec<String>,
    pub validation_errors: Vec<String>,
    pub failures: Vec<String>,
    pub auto_execute: BTreeMap<String, Value>,
    /// Plain stdout per tool, exposed to templates as `tool_<id>`.
    pub tool_outputs: BTreeMap<String, String>,
}

impl ScriptOutcomes {
    pub fn is_empty(&self) -> bool {
        self.auto_approved_tools.is_empty()
            && self.confirmation_required.is_empty()
            && self.validation_errors.is_empty()
            && self.failures.is_empty()
            && self.tool_outputs.is_empty()
    }

    pub fn record(&mut self, tool: &ScriptToolDefinition, execution: &ScriptExecution) {
        self.tool_outputs
            .insert(tool.id.clone(), execution.stdout.trim().to_string());
        match classify(tool, execution) {
            ToolDisposition::AutoApproved { auto_execute } => {
                self.auto_approved_tools.push(tool.id.clone());
                if let Some(payload) = auto_execute {
                    self.auto_execute.insert(tool.id.clone(), payload);
                }
            }
            ToolDisposition::ValidationFailed(errors) => self.validation_errors.extend(errors),
            ToolDisposition::Completed => {}
            ToolDisposition::Failed { exit_code, stderr } => self
                .failures
                .push(format!("{} (exit {exit_code}): {stderr}", tool.id)),
        }
    }

    /// Markdown section appended to step output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.auto_approved_tools.is_empty() {
            out.push_str(&format!(
                "\n**Auto-approved tools:** {}\n",
                self.auto_approved_tools.join(", ")
            ));
        }
        if !self.validation_errors.is_empty() {
            out.push_str("\n**Validation errors:**\n");
            for err in &self.validation_errors {
                out.push_str(&format!("- {err}\n"));
            }
            out.push_str("Fix the inputs above and resend the command.\n");
        }
        if !self.confirmation_required.is_empty() {
            out.push_str(&format!(
                "\n**Confirmation required:** {}. Resend with `confirm=\"true\"` to run.\n",
                self.confirmation_required.join(", ")
            ));
        }
        if !self.failures.is_empty() {
            out.push_str("\n**Tool failures:**\n");
            for failure in &self.failures {
                out.push_str(&format!("- {failure}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(auto: bool) -> ScriptToolDefinition {
        ScriptToolDefinition {
            id: "builder".to_string(),
            name: "builder".to_string(),
            command: vec!["true".to_string()],
            working_dir: None,
            input_schema: None,
            trigger: ScriptTrigger::Always,
            confirm: true,
            auto_approve_on_valid: auto,
            timeout_ms: None,
        }
    }

    fn run(stdout: &str, exit_code: i32) -> ScriptExecution {
        ScriptExecution::from_process(
            exit_code,
            stdout.to_string(),
            String::new(),
            Duration::from_millis(1),
            false,
        )
    }

    #[test]
    fn valid_output_is_auto_approved() {
        let mut outcomes = ScriptOutcomes::default();
        outcomes.record(&tool(true), &run(r#"{"valid":true,"auto_execute":{"action":"save"}}"#, 0));
        assert_eq!(outcomes.auto_approved_tools, vec!["builder"]);
        assert!(outcomes.validation_errors.is_empty());
        assert!(outcomes.confirmation_required.is_empty());
        assert_eq!(outcomes.auto_execute["builder"], json!({"action": "save"}));
    }

    #[test]
    fn invalid_output_surfaces_tool_errors() {
        let mut outcomes = ScriptOutcomes::default();
        outcomes.record(&tool(true), &run(r#"{"valid":false,"errors":["Missing field"]}"#, 0));
        assert_eq!(outcomes.validation_errors, vec!["Missing field"]);
        assert!(outcomes.auto_approved_tools.is_empty());
    }

    #[test]
    fn non_json_output_is_a_validation_failure() {
        let disposition = classify(&tool(true), &run("all good", 0));
        assert_eq!(
            disposition,
            ToolDisposition::ValidationFailed(vec![DEFAULT_VALIDATION_ERROR.to_string()])
        );
        let no_errors = classify(&tool(true), &run(r#"{"valid":false}"#, 0));
        assert_eq!(
            no_errors,
            ToolDisposition::ValidationFailed(vec![DEFAULT_VALIDATION_ERROR.to_string()])
        );
    }

    #[test]
    fn nonzero_exit_is_surfaced() {
        let mut def = tool(false);
        def.confirm = false;
        let mut exec = run("", 3);
        exec.stderr = "boom".to_string();
        match classify(&def, &exec) {
            ToolDisposition::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn confirm_tools_wait_unless_confirmed() {
        let def = tool(false);
        assert_eq!(plan_tool(&def, &ArgMap::new()), ToolPlan::AwaitConfirmation);
        let mut args = ArgMap::new();
        args.insert("confirm".to_string(), "true".to_string());
        assert_eq!(plan_tool(&def, &args), ToolPlan::Run);
        assert_eq!(plan_tool(&tool(true), &ArgMap::new()), ToolPlan::Run);
    }

    #[test]
    fn schema_controls_trigger_and_input() {
        let mut def = tool(true);
        def.input_schema = Some(json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}, "count": {"type": "integer"}}
        }));
        assert!(matches!(plan_tool(&def, &ArgMap::new()), ToolPlan::InvalidInput(_)));

        def.trigger = ScriptTrigger::SchemaMatch;
        assert_eq!(plan_tool(&def, &ArgMap::new()), ToolPlan::Skip);
        let mut args = ArgMap::new();
        args.insert("name".to_string(), "x".to_string());
        args.insert("count".to_string(), "3".to_string());
        assert_eq!(plan_tool(&def, &args), ToolPlan::Run);
    }
}
