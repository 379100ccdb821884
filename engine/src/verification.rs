//! Shell verification service.
//!
//! Runs the `verify:` check for a pending verification, switching to an
//! isolated spawned attempt once the in-context budget is used up, and keeps
//! the loop-mode state file and git checkpoints in step with the session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::review::{ActionOutcome, GateAction};
use crate::core::session::{ChainSession, PendingShellVerification, VerificationResult};
use crate::core::types::ShellVerifyConfig;
use crate::core::verify::{self, AttemptOutcome, IsolationPolicy, IsolationTask};
use crate::io::config::VerificationConfig;
use crate::io::git::CheckpointStore;
use crate::io::isolation::{IsolationSpawner, running_isolated};
use crate::io::shell::{ShellExecutor, ShellRequest};
use crate::io::verify_state::{
    LoopProgress, VerifyActiveState, clear_verify_state, load_verify_state, write_verify_state,
};

/// Gate id recorded on verifications created from a `verify:` directive.
pub const SHELL_VERIFY_GATE_ID: &str = "shell-verify";

/// Result of one stop-hook iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    /// No loop-mode verification is active.
    Idle,
    /// The budget was already used up; the state file was cleared.
    Exhausted { max_attempts: u32 },
    Passed { message: String },
    Failed { feedback: String },
}

pub struct ShellVerificationService {
    shell: Arc<dyn ShellExecutor>,
    spawner: Arc<dyn IsolationSpawner>,
    checkpoints: Arc<dyn CheckpointStore>,
    policy: IsolationPolicy,
    output_limit_bytes: usize,
    runtime_dir: PathBuf,
    spawned: bool,
}

impl ShellVerificationService {
    pub fn new(
        shell: Arc<dyn ShellExecutor>,
        spawner: Arc<dyn IsolationSpawner>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &VerificationConfig,
        runtime_dir: &Path,
    ) -> Self {
        Self {
            shell,
            spawner,
            checkpoints,
            policy: config.isolation.policy(),
            output_limit_bytes: config.output_limit_bytes,
            runtime_dir: runtime_dir.to_path_buf(),
            spawned: running_isolated(),
        }
    }

    /// Treat this process as a spawned verifier (never isolates again).
    pub fn with_spawned(mut self, spawned: bool) -> Self {
        self.spawned = spawned;
        self
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Attach a verification to `step`: checkpoint first when asked, and hand
    /// loop-mode checks to the stop hook through the state file.
    #[instrument(skip_all, fields(step, command = %config.command))]
    pub fn begin(
        &self,
        session: &ChainSession,
        config: ShellVerifyConfig,
        step: u32,
    ) -> Result<PendingShellVerification> {
        let mut pending = PendingShellVerification::new(SHELL_VERIFY_GATE_ID, config, step);
        if pending.shell_verify.checkpoint {
            let workdir = self.workdir(&pending.shell_verify);
            match self.checkpoints.create(&workdir) {
                Ok(checkpoint) => pending.checkpoint = checkpoint,
                Err(err) => warn!(err = %format!("{err:#}"), "checkpoint failed; continuing without"),
            }
        }
        if pending.shell_verify.loop_mode {
            self.write_loop_state(&session.session_id, &session.chain_id, &pending)?;
        }
        info!(max_attempts = pending.max_attempts, "shell verification pending");
        Ok(pending)
    }

    /// Run one attempt and record it on `pending`.
    ///
    /// Past the isolation threshold the attempt is first handed to a spawned
    /// verifier; the check is then re-run here for ground truth. `notes` is
    /// the agent's response for this attempt, mined for its approach and lesson.
    #[instrument(skip_all, fields(attempt = pending.attempt_count + 1, max = pending.max_attempts))]
    pub fn run_attempt(
        &self,
        session: &ChainSession,
        pending: &mut PendingShellVerification,
        notes: Option<&str>,
    ) -> Result<AttemptOutcome> {
        self.attempt(&session.session_id, &session.chain_id, pending, notes)
    }

    /// One stop-hook iteration over the loop-mode state file.
    ///
    /// The state is advanced on disk; a pass or an exhausted budget clears it.
    #[instrument(skip_all)]
    pub fn run_loop_iteration(&self, notes: Option<&str>) -> Result<LoopVerdict> {
        let Some(state) = self.loop_state()? else {
            return Ok(LoopVerdict::Idle);
        };
        let mut pending =
            PendingShellVerification::new(SHELL_VERIFY_GATE_ID, state.config.clone(), 0);
        pending.attempt_count = state.state.iteration;
        pending.previous_results = state.state.last_result.into_iter().collect();
        pending.history = state.state.history;
        if pending.is_exhausted() {
            self.clear_loop_state()?;
            info!(max = pending.max_attempts, "loop budget exhausted");
            return Ok(LoopVerdict::Exhausted {
                max_attempts: pending.max_attempts,
            });
        }

        let outcome = self.attempt(&state.session_id, &state.chain_id, &mut pending, notes)?;
        Ok(match outcome {
            AttemptOutcome::Passed => LoopVerdict::Passed {
                message: verify::render_passed(&pending),
            },
            AttemptOutcome::Retry => LoopVerdict::Failed {
                feedback: verify::render_bounce_back(&pending),
            },
            AttemptOutcome::Escalated => LoopVerdict::Failed {
                feedback: verify::render_escalation(&pending),
            },
        })
    }

    fn attempt(
        &self,
        session_id: &str,
        chain_id: &str,
        pending: &mut PendingShellVerification,
        notes: Option<&str>,
    ) -> Result<AttemptOutcome> {
        let isolated = self.policy.should_isolate(pending, self.spawned);
        let mut spawn_summary = None;
        if isolated {
            let task = IsolationTask::from_pending(session_id, pending);
            match self.spawner.spawn(&task) {
                Ok(outcome) => {
                    info!(
                        exit_code = ?outcome.exit_code,
                        timed_out = outcome.timed_out,
                        "isolated attempt finished"
                    );
                    spawn_summary = Some(outcome.summary);
                }
                Err(err) => warn!(err = %format!("{err:#}"), "isolated attempt failed to spawn"),
            }
        }

        let mut result = self.execute(&pending.shell_verify)?;
        result.isolated = isolated;
        let notes = spawn_summary.as_deref().or(notes);
        let outcome = verify::record_attempt(pending, result, notes);
        info!(?outcome, "verification attempt recorded");

        if pending.shell_verify.loop_mode {
            match outcome {
                AttemptOutcome::Passed => self.clear_loop_state()?,
                AttemptOutcome::Retry | AttemptOutcome::Escalated => {
                    self.write_loop_state(session_id, chain_id, pending)?;
                }
            }
        }
        Ok(outcome)
    }

    /// Apply a `gate_action` to an exhausted verification. `abort` restores
    /// the checkpoint when rollback was requested.
    pub fn apply_action(
        &self,
        pending: &mut PendingShellVerification,
        action: GateAction,
    ) -> Result<ActionOutcome> {
        let outcome = verify::apply_action(pending, action);
        match outcome {
            ActionOutcome::Reset => {}
            ActionOutcome::Skipped => self.clear_loop_state()?,
            ActionOutcome::Aborted => {
                self.rollback(pending)?;
                self.clear_loop_state()?;
            }
        }
        info!(action = action.as_str(), "verification action applied");
        Ok(outcome)
    }

    /// Run the configured command once.
    pub fn execute(&self, config: &ShellVerifyConfig) -> Result<VerificationResult> {
        let request = ShellRequest {
            command: config.command.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            timeout: Duration::from_millis(config.timeout),
            output_limit_bytes: self.output_limit_bytes,
        };
        let run = self.shell.run(&request)?;
        Ok(VerificationResult {
            passed: run.passed(),
            exit_code: run.exit_code,
            stdout: run.stdout,
            stderr: run.stderr,
            duration_ms: run.duration.as_millis() as u64,
            command: config.command.clone(),
            timed_out: run.timed_out,
            isolated: false,
        })
    }

    pub fn clear_loop_state(&self) -> Result<()> {
        clear_verify_state(&self.runtime_dir)?;
        Ok(())
    }

    /// Loop state for this runtime directory, if any.
    pub fn loop_state(&self) -> Result<Option<VerifyActiveState>> {
        load_verify_state(&self.runtime_dir)
    }

    fn rollback(&self, pending: &PendingShellVerification) -> Result<()> {
        if !pending.shell_verify.rollback {
            return Ok(());
        }
        let Some(checkpoint) = &pending.checkpoint else {
            warn!("rollback requested but no checkpoint was recorded");
            return Ok(());
        };
        let workdir = self.workdir(&pending.shell_verify);
        self.checkpoints.restore(&workdir, checkpoint)?;
        info!(reference = %checkpoint.reference, "worktree rolled back to checkpoint");
        Ok(())
    }

    fn workdir(&self, config: &ShellVerifyConfig) -> PathBuf {
        config
            .working_dir
            .as_ref()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
    }

    fn write_loop_state(
        &self,
        session_id: &str,
        chain_id: &str,
        pending: &PendingShellVerification,
    ) -> Result<()> {
        let state = VerifyActiveState {
            session_id: session_id.to_string(),
            chain_id: chain_id.to_string(),
            config: pending.shell_verify.clone(),
            state: LoopProgress {
                iteration: pending.attempt_count,
                last_result: pending.last_result().cloned(),
                history: pending.history.clone(),
            },
        };
        write_verify_state(&self.runtime_dir, &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::core::session::{Checkpoint, GateScope, SessionBlueprint};
    use crate::core::types::{ArgMap, CommandType, InlineGates, ParseFormat, ParsedCommand};
    use crate::test_support::{RecordingSpawner, ScriptedShell};

    #[derive(Default)]
    struct FakeCheckpoints {
        restored: Mutex<Vec<String>>,
    }

    impl CheckpointStore for FakeCheckpoints {
        fn create(&self, _workdir: &Path) -> Result<Option<Checkpoint>> {
            Ok(Some(Checkpoint {
                reference: "abc123".to_string(),
                untracked: Vec::new(),
            }))
        }

        fn restore(&self, _workdir: &Path, checkpoint: &Checkpoint) -> Result<()> {
            self.restored
                .lock()
                .expect("lock")
                .push(checkpoint.reference.clone());
            Ok(())
        }
    }

    fn session() -> ChainSession {
        let parsed = ParsedCommand {
            command_type: CommandType::Single,
            format: ParseFormat::Symbolic,
            raw: ">>fix".to_string(),
            prompt_id: Some("fix".to_string()),
            args: ArgMap::new(),
            steps: Vec::new(),
            command_gates: InlineGates::default(),
            framework_override: None,
            style: None,
            modifiers: Vec::new(),
            operators: Vec::new(),
            confidence: 1.0,
            warnings: Vec::new(),
            promoted_from_single: false,
            resolved_gate_ids: Vec::new(),
        };
        let blueprint = SessionBlueprint {
            parsed_command: parsed,
            temporary_gates: Vec::new(),
            client_gates: Vec::new(),
            gate_scope: GateScope::Execution,
            api_validation: false,
        };
        ChainSession::new("sess-1".into(), "chain-fix#1".into(), blueprint, ArgMap::new(), 0)
    }

    fn service(
        shell: Arc<ScriptedShell>,
        spawner: Arc<RecordingSpawner>,
        checkpoints: Arc<FakeCheckpoints>,
        dir: &Path,
    ) -> ShellVerificationService {
        ShellVerificationService::new(
            shell,
            spawner,
            checkpoints,
            &VerificationConfig::default(),
            dir,
        )
        .with_spawned(false)
    }

    #[test]
    fn five_failures_escalate_and_retry_resets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shell = ScriptedShell::new(vec![1]);
        let spawner = RecordingSpawner::new();
        let svc = service(shell.clone(), spawner.clone(), Arc::default(), temp.path());
        let session = session();
        let mut pending = svc
            .begin(&session, ShellVerifyConfig::new("cargo test"), 1)
            .expect("begin");

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(svc.run_attempt(&session, &mut pending, None).expect("attempt"));
        }
        assert_eq!(outcomes[..4], [AttemptOutcome::Retry; 4]);
        assert_eq!(outcomes[4], AttemptOutcome::Escalated);
        assert_eq!(shell.call_count(), 5);

        // Attempts 4 and 5 ran past the in-context threshold of 3.
        let tasks = spawner.spawned();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].iteration, 4);
        assert!(pending.previous_results[3].isolated);
        assert!(!pending.previous_results[2].isolated);

        let text = verify::render_escalation(&pending);
        for choice in ["retry", "skip", "abort"] {
            assert!(text.contains(choice), "missing {choice}");
        }

        svc.apply_action(&mut pending, GateAction::Retry).expect("retry");
        assert_eq!(pending.attempt_count, 0);
        assert!(pending.previous_results.is_empty());
    }

    #[test]
    fn attempt_history_reaches_state_file_and_isolated_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spawner = RecordingSpawner::new();
        let svc = service(ScriptedShell::new(vec![1]), spawner.clone(), Arc::default(), temp.path());
        let session = session();
        let mut config = ShellVerifyConfig::new("cargo test");
        config.loop_mode = true;
        let mut pending = svc.begin(&session, config, 1).expect("begin");

        let notes = [
            "I added a missing import. The problem was an unused feature flag.",
            "I updated the fixture paths. It turns out the tests run from the crate root.",
            "",
        ];
        for note in notes {
            svc.run_attempt(&session, &mut pending, Some(note)).expect("attempt");
        }

        let state = svc.loop_state().expect("load").expect("active");
        let lessons: Vec<&str> = state.state.history.iter().map(|r| r.lesson.as_str()).collect();
        assert_eq!(lessons[..2], ["An unused feature flag", "The tests run from the crate root"]);
        assert_eq!(state.state.history[0].approach, "A missing import");
        assert_eq!(state.state.history[2].approach, "In-context attempt");

        svc.run_attempt(&session, &mut pending, None).expect("isolated attempt");
        let tasks = spawner.spawned();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].history.len(), 3);
        let prompt = tasks[0].render_prompt();
        assert!(prompt.contains("Lesson: The tests run from the crate root"), "{prompt}");
        assert_eq!(pending.history[3].approach, "Isolated attempt");
    }

    #[test]
    fn spawned_verifier_never_isolates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spawner = RecordingSpawner::new();
        let svc = service(ScriptedShell::new(vec![1]), spawner.clone(), Arc::default(), temp.path())
            .with_spawned(true);
        let session = session();
        let mut pending = svc
            .begin(&session, ShellVerifyConfig::new("false"), 1)
            .expect("begin");
        for _ in 0..5 {
            svc.run_attempt(&session, &mut pending, None).expect("attempt");
        }
        assert!(spawner.spawned().is_empty());
    }

    #[test]
    fn loop_mode_state_file_follows_the_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let svc = service(
            ScriptedShell::new(vec![1, 0]),
            RecordingSpawner::new(),
            Arc::default(),
            temp.path(),
        );
        let session = session();
        let mut config = ShellVerifyConfig::new("make check");
        config.loop_mode = true;
        let mut pending = svc.begin(&session, config, 1).expect("begin");
        let state = svc.loop_state().expect("load").expect("written");
        assert_eq!(state.session_id, "sess-1");
        assert_eq!(state.state.iteration, 0);

        assert_eq!(
            svc.run_attempt(&session, &mut pending, None).expect("attempt"),
            AttemptOutcome::Retry
        );
        let state = svc.loop_state().expect("load").expect("still active");
        assert_eq!(state.state.iteration, 1);
        assert!(state.state.last_result.is_some_and(|r| !r.passed));

        assert_eq!(
            svc.run_attempt(&session, &mut pending, None).expect("attempt"),
            AttemptOutcome::Passed
        );
        assert!(svc.loop_state().expect("load").is_none());
    }

    #[test]
    fn hook_iterations_advance_the_state_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let svc = service(
            ScriptedShell::new(vec![1, 0]),
            RecordingSpawner::new(),
            Arc::default(),
            temp.path(),
        );
        assert_eq!(svc.run_loop_iteration(None).expect("idle"), LoopVerdict::Idle);

        let mut config = ShellVerifyConfig::new("make check");
        config.loop_mode = true;
        svc.begin(&session(), config, 1).expect("begin");

        let LoopVerdict::Failed { feedback } = svc.run_loop_iteration(None).expect("first") else {
            panic!("first iteration should fail");
        };
        assert!(feedback.contains("Attempt 1/5"), "{feedback}");
        assert_eq!(svc.loop_state().expect("load").map(|s| s.state.iteration), Some(1));

        assert!(matches!(
            svc.run_loop_iteration(None).expect("second"),
            LoopVerdict::Passed { .. }
        ));
        assert!(svc.loop_state().expect("load").is_none());
    }

    #[test]
    fn exhausted_loop_state_is_cleared() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shell = ScriptedShell::new(vec![1]);
        let svc = service(shell.clone(), RecordingSpawner::new(), Arc::default(), temp.path());
        let mut config = ShellVerifyConfig::new("false");
        config.loop_mode = true;
        config.max_iterations = 1;
        svc.begin(&session(), config, 1).expect("begin");

        assert!(matches!(
            svc.run_loop_iteration(None).expect("first"),
            LoopVerdict::Failed { .. }
        ));
        assert_eq!(
            svc.run_loop_iteration(None).expect("second"),
            LoopVerdict::Exhausted { max_attempts: 1 }
        );
        assert_eq!(shell.call_count(), 1);
        assert!(svc.loop_state().expect("load").is_none());
    }

    #[test]
    fn abort_with_rollback_restores_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let checkpoints = Arc::new(FakeCheckpoints::default());
        let svc = service(
            ScriptedShell::new(vec![1]),
            RecordingSpawner::new(),
            checkpoints.clone(),
            temp.path(),
        );
        let session = session();
        let mut config = ShellVerifyConfig::new("false");
        config.checkpoint = true;
        config.rollback = true;
        let mut pending = svc.begin(&session, config, 1).expect("begin");
        assert_eq!(pending.checkpoint.as_ref().map(|c| c.reference.as_str()), Some("abc123"));

        let outcome = svc.apply_action(&mut pending, GateAction::Abort).expect("abort");
        assert_eq!(outcome, ActionOutcome::Aborted);
        assert_eq!(*checkpoints.restored.lock().expect("lock"), vec!["abc123".to_string()]);
    }
}
