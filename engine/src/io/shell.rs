//! Shell verification command execution.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::io::process::{TIMEOUT_EXIT_CODE, run_command_with_timeout};

/// Variables passed through to verification commands; everything else is cleared.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "TMPDIR", "NODE_ENV", "CI"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRequest {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ShellRun {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

pub trait ShellExecutor: Send + Sync {
    fn run(&self, request: &ShellRequest) -> Result<ShellRun>;
}

/// Runs commands through `sh -c` with a hard timeout.
#[derive(Debug, Clone, Default)]
pub struct ProcessShellExecutor;

impl ShellExecutor for ProcessShellExecutor {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &ShellRequest) -> Result<ShellRun> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&request.command).env_clear();
        for key in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let output = match run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                debug!(err = %format!("{err:#}"), "verification command could not run");
                return Ok(ShellRun {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    duration: Duration::ZERO,
                    timed_out: false,
                });
            }
        };

        let stderr = if output.timed_out {
            format!("Command timed out after {}s", request.timeout.as_secs())
        } else {
            output.stderr_text()
        };
        Ok(ShellRun {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr,
            duration: output.duration,
            timed_out: output.timed_out,
        })
    }
}
