//! Stop-hook protocol: hook JSON on stdin, decision JSON on stdout.

use anyhow::{Context, Result};
use engine::verification::{LoopVerdict, ShellVerificationService};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
struct HookInput {
    /// Set by the agent when it is already continuing because of this hook.
    #[serde(default)]
    stop_hook_active: bool,
    /// The agent's final message for this turn, when the host supplies it.
    #[serde(default)]
    last_assistant_message: Option<String>,
}

/// What the hook prints. An absent `decision` lets the agent stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDecision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

impl HookDecision {
    fn allow(message: String) -> Self {
        Self {
            decision: None,
            reason: None,
            system_message: Some(message),
        }
    }

    fn block(reason: String) -> Self {
        Self {
            decision: Some("block"),
            reason: Some(reason),
            system_message: None,
        }
    }
}

/// Handle one stop event. `None` means allow silently.
pub fn on_stop(raw_input: &str, verification: &ShellVerificationService) -> Result<Option<HookDecision>> {
    let input: HookInput = if raw_input.trim().is_empty() {
        HookInput::default()
    } else {
        serde_json::from_str(raw_input).unwrap_or_else(|err| {
            warn!(%err, "unreadable hook input; treating as empty");
            HookInput::default()
        })
    };
    if input.stop_hook_active {
        debug!("stop hook already active; allowing stop");
        return Ok(None);
    }

    let verdict = verification
        .run_loop_iteration(input.last_assistant_message.as_deref())
        .context("run verification iteration")?;
    info!(?verdict, "stop hook verdict");
    Ok(match verdict {
        LoopVerdict::Idle => None,
        LoopVerdict::Exhausted { max_attempts } => Some(HookDecision::allow(format!(
            "[Verify] Max iterations ({max_attempts}) reached. Stopping."
        ))),
        LoopVerdict::Passed { message } => Some(HookDecision::allow(message)),
        LoopVerdict::Failed { feedback } => Some(HookDecision::block(feedback)),
    })
}
