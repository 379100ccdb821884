//! `verify-active.json`: the loop-mode verification handed to the stop hook.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::session::VerificationResult;
use crate::core::types::ShellVerifyConfig;
use crate::core::verify::AttemptRecord;
use crate::io::config::write_atomic;

pub const VERIFY_STATE_FILE: &str = "verify-active.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoopProgress {
    /// Attempts already run.
    pub iteration: u32,
    #[serde(default)]
    pub last_result: Option<VerificationResult>,
    /// Approach, result and lesson of every attempt so far.
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyActiveState {
    pub session_id: String,
    pub chain_id: String,
    pub config: ShellVerifyConfig,
    pub state: LoopProgress,
}

pub fn verify_state_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(VERIFY_STATE_FILE)
}

pub fn load_verify_state(runtime_dir: &Path) -> Result<Option<VerifyActiveState>> {
    let path = verify_state_path(runtime_dir);
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let state = serde_json::from_str(&contents)
        .with_context(|| format!("parse verify state {}", path.display()))?;
    Ok(Some(state))
}

pub fn write_verify_state(runtime_dir: &Path, state: &VerifyActiveState) -> Result<()> {
    let path = verify_state_path(runtime_dir);
    debug!(path = %path.display(), iteration = state.state.iteration, "writing verify state");
    let mut buf = serde_json::to_string_pretty(state).context("serialize verify state")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

/// Remove the state file; returns whether one existed.
pub fn clear_verify_state(runtime_dir: &Path) -> Result<bool> {
    let path = verify_state_path(runtime_dir);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "verify state cleared");
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_load_clear() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_verify_state(temp.path()).expect("load").is_none());

        let mut config = ShellVerifyConfig::new("cargo test");
        config.loop_mode = true;
        let state = VerifyActiveState {
            session_id: "sess-1".to_string(),
            chain_id: "chain-fix#1".to_string(),
            config,
            state: LoopProgress {
                iteration: 1,
                last_result: None,
                history: vec![AttemptRecord {
                    number: 1,
                    approach: "Bumped the timeout".to_string(),
                    result: "FAIL - timed out".to_string(),
                    lesson: "The fixture server never starts".to_string(),
                }],
            },
        };
        write_verify_state(temp.path(), &state).expect("write");
        assert_eq!(load_verify_state(temp.path()).expect("load"), Some(state));

        let raw = fs::read_to_string(verify_state_path(temp.path())).expect("read");
        assert!(raw.contains("\"sessionId\": \"sess-1\""));
        assert!(raw.contains("\"loop\": true"));
        assert!(raw.contains("\"lesson\": \"The fixture server never starts\""));

        assert!(clear_verify_state(temp.path()).expect("clear"));
        assert!(!clear_verify_state(temp.path()).expect("clear again"));
    }

    #[test]
    fn state_without_history_still_loads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let raw = r#"{"sessionId": "s", "chainId": "c", "config": {"command": "true", "timeout": 1000, "maxIterations": 3, "loop": true, "checkpoint": false, "rollback": false}, "state": {"iteration": 2}}"#;
        fs::write(verify_state_path(temp.path()), raw).expect("write");
        let state = load_verify_state(temp.path()).expect("load").expect("present");
        assert_eq!(state.state.iteration, 2);
        assert!(state.state.history.is_empty());
    }
}
