//! Isolated verification attempts in a freshly spawned agent process.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument};

pub use crate::core::verify::IsolationTask;
use crate::core::verify::{SESSION_ENV, SPAWNED_ENV, truncate_chars};
use crate::io::config::{IsolationConfig, write_atomic};
use crate::io::process::run_command_with_timeout;

const SPAWN_OUTPUT_LIMIT_BYTES: usize = 200_000;
const SUMMARY_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Short text reported by the spawned agent.
    pub summary: String,
}

pub trait IsolationSpawner: Send + Sync {
    fn spawn(&self, task: &IsolationTask) -> Result<SpawnOutcome>;
}

/// Whether this process is itself an isolated verifier.
pub fn running_isolated() -> bool {
    std::env::var_os(SPAWNED_ENV).is_some_and(|v| !v.is_empty())
}

/// Spawns the configured agent CLI with the task prompt on stdin.
#[derive(Debug, Clone)]
pub struct CliIsolationSpawner {
    config: IsolationConfig,
    tasks_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct AgentJsonOutput {
    #[serde(default)]
    result: Option<String>,
}

impl CliIsolationSpawner {
    pub fn new(config: IsolationConfig, runtime_dir: &Path) -> Self {
        Self {
            config,
            tasks_dir: runtime_dir.join("tasks"),
        }
    }

    fn build_command(&self, task: &IsolationTask) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("isolation command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(format!("--max-budget-usd={}", self.config.max_budget_usd))
            .arg(format!("--permission-mode={}", self.config.permission_mode))
            .env(SPAWNED_ENV, "1")
            .env(SESSION_ENV, &task.session_id);
        if let Some(dir) = &task.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    fn write_task_file(&self, task: &IsolationTask) -> Result<PathBuf> {
        let path = self
            .tasks_dir
            .join(format!("{}-{}.json", task.session_id, task.iteration));
        let mut buf = serde_json::to_string_pretty(task).context("serialize isolation task")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        Ok(path)
    }
}

impl IsolationSpawner for CliIsolationSpawner {
    #[instrument(skip_all, fields(session_id = %task.session_id, iteration = task.iteration))]
    fn spawn(&self, task: &IsolationTask) -> Result<SpawnOutcome> {
        let task_path = self.write_task_file(task)?;
        debug!(path = %task_path.display(), "isolation task written");

        let prompt = task.render_prompt();
        let cmd = self.build_command(task)?;
        info!("spawning isolated verification attempt");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            Duration::from_secs(self.config.timeout_secs),
            SPAWN_OUTPUT_LIMIT_BYTES,
        )
        .context("spawn isolated verifier")?;

        let stdout = output.stdout_text();
        let text = serde_json::from_str::<AgentJsonOutput>(stdout.trim())
            .ok()
            .and_then(|o| o.result)
            .unwrap_or(stdout);
        let summary = if output.timed_out {
            format!("isolated attempt timed out after {}s", self.config.timeout_secs)
        } else {
            truncate_chars(text.trim(), SUMMARY_CHARS)
        };
        Ok(SpawnOutcome {
            exit_code: (!output.timed_out).then(|| output.exit_code()),
            timed_out: output.timed_out,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::verify::AttemptRecord;

    fn task(session_id: &str) -> IsolationTask {
        IsolationTask {
            session_id: session_id.to_string(),
            original_goal: "make tests pass".to_string(),
            command: "true".to_string(),
            working_dir: None,
            iteration: 4,
            max_iterations: 5,
            last_failure: None,
            history: vec![AttemptRecord {
                number: 1,
                approach: "In-context attempt".to_string(),
                result: "FAIL - exit code 1 (unknown error): boom".to_string(),
                lesson: "boom".to_string(),
            }],
        }
    }

    /// The fake agent echoes its environment marker in the JSON `result` field.
    #[test]
    fn spawned_process_is_marked_and_reads_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = IsolationConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"grep -q "Verification Task" && printf '{"result":"spawned=%s session=%s"}' "$RALPH_SPAWNED" "$RALPH_SESSION_ID""#
                    .to_string(),
                "agent".to_string(),
            ],
            timeout_secs: 10,
            ..IsolationConfig::default()
        };
        let spawner = CliIsolationSpawner::new(config, temp.path());
        let outcome = spawner.spawn(&task("sess-7")).expect("spawn");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.summary, "spawned=1 session=sess-7");
        assert!(temp.path().join("tasks/sess-7-4.json").exists());
    }
}
