//! Test-only builders for prompt definitions, requests and pipelines.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::core::types::{
    ArgMap, ChainStepDefinition, PromptArgument, PromptDefinition, PromptGateConfig,
    ScriptToolDefinition, ScriptTrigger,
};
use crate::io::isolation::{IsolationSpawner, IsolationTask, SpawnOutcome};
use crate::io::scripts::{ScriptExecution, ScriptInvocation, ScriptToolRunner};
use crate::io::shell::{ShellExecutor, ShellRequest, ShellRun};

/// Deterministic single prompt with no declared arguments.
pub fn prompt(id: &str, template: &str) -> PromptDefinition {
    PromptDefinition {
        id: id.to_string(),
        name: String::new(),
        description: format!("{id} prompt"),
        category: "general".to_string(),
        user_message_template: template.to_string(),
        system_message: None,
        arguments: Vec::new(),
        chain_steps: Vec::new(),
        chain_gates: Vec::new(),
        gates: PromptGateConfig::default(),
        tools: Vec::new(),
        requires_framework: None,
    }
}

/// Prompt declaring optional arguments in order.
pub fn prompt_with_args(id: &str, template: &str, args: &[&str]) -> PromptDefinition {
    let mut def = prompt(id, template);
    def.arguments = args
        .iter()
        .map(|name| PromptArgument {
            name: (*name).to_string(),
            description: String::new(),
            required: false,
            default: None,
        })
        .collect();
    def
}

/// Chain prompt whose steps reference `step_ids` in order.
pub fn chain_prompt(id: &str, step_ids: &[&str]) -> PromptDefinition {
    let mut def = prompt(id, "");
    def.chain_steps = step_ids
        .iter()
        .map(|step| ChainStepDefinition {
            prompt_id: (*step).to_string(),
            step_name: None,
            args: ArgMap::new(),
        })
        .collect();
    def
}

/// Script tool that auto-approves on valid output.
pub fn auto_approve_tool(id: &str) -> ScriptToolDefinition {
    ScriptToolDefinition {
        id: id.to_string(),
        name: id.to_string(),
        command: vec!["python3".to_string(), "script.py".to_string()],
        working_dir: None,
        input_schema: None,
        trigger: ScriptTrigger::Always,
        confirm: true,
        auto_approve_on_valid: true,
        timeout_ms: None,
    }
}

/// Shell executor returning scripted exit codes in order (last one repeats).
#[derive(Debug)]
pub struct ScriptedShell {
    exit_codes: Mutex<Vec<i32>>,
    calls: Mutex<Vec<ShellRequest>>,
}

impl ScriptedShell {
    pub fn new(exit_codes: Vec<i32>) -> Arc<Self> {
        Arc::new(Self {
            exit_codes: Mutex::new(exit_codes),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl ShellExecutor for ScriptedShell {
    fn run(&self, request: &ShellRequest) -> Result<ShellRun> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let code = match self.exit_codes.lock() {
            Ok(mut codes) if codes.len() > 1 => codes.remove(0),
            Ok(codes) => codes.first().copied().unwrap_or(0),
            Err(_) => 0,
        };
        Ok(ShellRun {
            exit_code: code,
            stdout: if code == 0 { "ok".to_string() } else { String::new() },
            stderr: if code == 0 {
                String::new()
            } else {
                format!("check failed with {code}")
            },
            duration: Duration::from_millis(5),
            timed_out: false,
        })
    }
}

/// Script runner replying with a fixed stdout payload.
#[derive(Debug)]
pub struct ScriptedRunner {
    stdout: String,
    exit_code: i32,
    invocations: Mutex<Vec<ScriptInvocation>>,
}

impl ScriptedRunner {
    pub fn new(stdout: &str, exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            stdout: stdout.to_string(),
            exit_code,
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().map(|i| i.len()).unwrap_or(0)
    }
}

impl ScriptToolRunner for ScriptedRunner {
    fn execute(&self, invocation: &ScriptInvocation) -> Result<ScriptExecution> {
        if let Ok(mut seen) = self.invocations.lock() {
            seen.push(invocation.clone());
        }
        Ok(ScriptExecution::from_process(
            self.exit_code,
            self.stdout.clone(),
            String::new(),
            Duration::from_millis(3),
            false,
        ))
    }
}

/// Isolation spawner that records tasks without spawning anything.
#[derive(Debug, Default)]
pub struct RecordingSpawner {
    tasks: Mutex<Vec<IsolationTask>>,
}

impl RecordingSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawned(&self) -> Vec<IsolationTask> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl IsolationSpawner for RecordingSpawner {
    fn spawn(&self, task: &IsolationTask) -> Result<SpawnOutcome> {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task.clone());
        }
        Ok(SpawnOutcome {
            exit_code: Some(0),
            timed_out: false,
            summary: "isolated attempt finished".to_string(),
        })
    }
}
