//! Script-tool runtime: runs a tool command with its JSON input on stdin.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, instrument};

pub use crate::core::scripts::ScriptExecution;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptInvocation {
    pub tool_id: String,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub input: Value,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait ScriptToolRunner: Send + Sync {
    fn execute(&self, invocation: &ScriptInvocation) -> Result<ScriptExecution>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessScriptRunner;

impl ScriptToolRunner for ProcessScriptRunner {
    #[instrument(skip_all, fields(tool = %invocation.tool_id))]
    fn execute(&self, invocation: &ScriptInvocation) -> Result<ScriptExecution> {
        let (program, args) = invocation
            .command
            .split_first()
            .ok_or_else(|| anyhow!("tool '{}' has an empty command", invocation.tool_id))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        let input = serde_json::to_vec(&invocation.input).context("serialize tool input")?;
        let output = run_command_with_timeout(
            cmd,
            Some(&input),
            invocation.timeout,
            invocation.output_limit_bytes,
        )
        .with_context(|| format!("run tool '{}'", invocation.tool_id))?;
        debug!(exit_code = output.exit_code(), timed_out = output.timed_out, "tool finished");
        Ok(ScriptExecution::from_process(
            output.exit_code(),
            output.stdout_text(),
            output.stderr_text(),
            output.duration,
            output.timed_out,
        ))
    }
}
