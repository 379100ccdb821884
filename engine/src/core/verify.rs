//! Shell verification loop transitions and feedback formatting.
//!
//! Pure bookkeeping over [`PendingShellVerification`]: recording attempts,
//! deciding when to escalate or isolate, and rendering the messages the
//! caller sees. Command execution lives in the verification service.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::review::{ActionOutcome, GateAction, escalation_choices};
use crate::core::session::{PendingShellVerification, VerificationResult};

/// Captured stdout/stderr keep at most this many trailing characters.
pub const OUTPUT_TAIL_CHARS: usize = 5000;
/// Error output quoted in feedback is cut to this many characters.
pub const FEEDBACK_CHARS: usize = 2000;
pub const DEFAULT_ISOLATION_THRESHOLD: u32 = 3;
/// Environment flag marking a spawned isolated verifier.
pub const SPAWNED_ENV: &str = "RALPH_SPAWNED";
pub const SESSION_ENV: &str = "RALPH_SESSION_ID";
/// Attempt records kept per verification, oldest dropped first.
pub const MAX_ATTEMPT_HISTORY: usize = 10;
const INSIGHT_CHARS: usize = 200;
const ERROR_SUMMARY_CHARS: usize = 150;

/// Statements that carry a takeaway, strongest first.
static LESSON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?im)\bI (?:now )?(?:realize|understand|see) (?:that )?([^.\n]+)",
        r"(?im)\b(?:the )?(?:root )?(?:cause|issue|problem|bug) (?:is|was|seems to be) ([^.\n]+)",
        r"(?im)\b(?:the )?(?:solution|fix|answer) (?:is|was|requires) ([^.\n]+)",
        r"(?im)\b(?:this|that) (?:means|indicates|suggests) ([^.\n]+)",
        r"(?im)\b(?:it )?(?:turns out|appears) (?:that )?([^.\n]+)",
        r"(?im)\b(?:noticed|found|discovered) (?:that )?([^.\n]+)",
        r"(?im)\b(?:test|build|lint|check) (?:fails|failed) (?:because|due to|with) ([^.\n]+)",
        r"(?im)^\s*(?:error|warning)(?:\[\w+\])?: ([^\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("lesson regex should compile"))
    .collect()
});

/// Statements describing what was changed.
static APPROACH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?im)\bI (?:tried|attempted|changed|modified|updated|added|removed|fixed|refactored) ([^.\n]+)",
        r"(?im)\b(?:the )?(?:change|fix) (?:I made |was )([^.\n]+)",
        r"(?im)^\s*(?:let me|I'll|I will) ([^.\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("approach regex should compile"))
    .collect()
});

const FILLER_PREFIXES: &[&str] = &["i think ", "i believe ", "it seems ", "perhaps ", "maybe ", "we need to ", "we should "];

/// Outcome of recording one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed,
    Retry,
    Escalated,
}

/// Rough class of a failing check, taken from its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Type,
    Import,
    Test,
    Lint,
    Build,
    Runtime,
    Timeout,
    Permission,
    Unknown,
}

impl FailureKind {
    /// First class whose keywords appear in `output`.
    pub fn classify(output: &str) -> Self {
        const KEYWORDS: &[(FailureKind, &[&str])] = &[
            (FailureKind::Syntax, &["syntaxerror", "syntax error", "unexpected token", "parse error"]),
            (FailureKind::Type, &["typeerror", "type mismatch", "mismatched types"]),
            (FailureKind::Import, &["cannot find module", "module not found", "no module named", "unresolved import"]),
            (FailureKind::Test, &["assertion", "test failed", "expected", "fail"]),
            (FailureKind::Lint, &["lint", "clippy", "prettier", "formatting"]),
            (FailureKind::Build, &["build failed", "could not compile", "compilation error"]),
            (FailureKind::Runtime, &["panicked", "exception", "segfault", "runtime error"]),
            (FailureKind::Timeout, &["timed out", "timeout"]),
            (FailureKind::Permission, &["permission denied", "access denied"]),
        ];
        let lower = output.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map_or(Self::Unknown, |(kind, _)| *kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax error",
            Self::Type => "type error",
            Self::Import => "import error",
            Self::Test => "test failure",
            Self::Lint => "lint error",
            Self::Build => "build error",
            Self::Runtime => "runtime error",
            Self::Timeout => "timeout",
            Self::Permission => "permission error",
            Self::Unknown => "unknown error",
        }
    }
}

/// What one attempt tried, how it ended and what it taught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub number: u32,
    pub approach: String,
    pub result: String,
    pub lesson: String,
}

impl AttemptRecord {
    /// Build a record from the check's result and the agent's own account of
    /// the attempt, when one was given.
    pub fn from_result(number: u32, result: &VerificationResult, notes: Option<&str>) -> Self {
        let notes = notes.filter(|n| !n.trim().is_empty());
        let output = error_output(result);
        let approach = notes.and_then(extract_approach).unwrap_or_else(|| {
            if result.isolated {
                "Isolated attempt".to_string()
            } else {
                "In-context attempt".to_string()
            }
        });
        let outcome = if result.passed {
            "PASS".to_string()
        } else if result.timed_out {
            "FAIL - timed out".to_string()
        } else {
            format!(
                "FAIL - exit code {} ({}): {}",
                result.exit_code,
                FailureKind::classify(output).as_str(),
                summarize_error(output)
            )
        };
        let lesson = if result.passed {
            notes
                .and_then(extract_lesson)
                .unwrap_or_else(|| format!("`{}` passes with this change", result.command))
        } else {
            notes
                .and_then(extract_lesson)
                .or_else(|| extract_lesson(output))
                .unwrap_or_else(|| summarize_error(output))
        };
        Self {
            number,
            approach,
            result: outcome,
            lesson,
        }
    }
}

/// Stderr when the check wrote any, stdout otherwise.
fn error_output(result: &VerificationResult) -> &str {
    if result.stderr.trim().is_empty() {
        &result.stdout
    } else {
        &result.stderr
    }
}

/// Highest-ranked insight stated in `text`.
pub fn extract_lesson(text: &str) -> Option<String> {
    first_capture(&LESSON_PATTERNS, text)
}

/// What the agent says it changed.
pub fn extract_approach(text: &str) -> Option<String> {
    first_capture(&APPROACH_PATTERNS, text)
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| clean_insight(m.as_str()))
            .filter(|insight| insight.chars().count() > 10)
    })
}

fn clean_insight(raw: &str) -> String {
    let mut insight = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    for prefix in FILLER_PREFIXES {
        if insight.len() >= prefix.len()
            && insight.is_char_boundary(prefix.len())
            && insight[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            insight = &insight[prefix.len()..];
        }
    }
    let mut chars = insight.chars();
    let capitalised: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    if capitalised.chars().count() > INSIGHT_CHARS {
        let cut: String = capitalised.chars().take(INSIGHT_CHARS - 3).collect();
        format!("{cut}...")
    } else {
        capitalised
    }
}

/// The most telling line of `output`, shortened.
pub fn summarize_error(output: &str) -> String {
    const INDICATORS: &[&str] = &["error", "fail", "expected", "panicked", "cannot", "not found"];
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let Some(first) = lines.first() else {
        return "no error output".to_string();
    };
    let line = lines
        .iter()
        .find(|l| {
            let lower = l.to_lowercase();
            INDICATORS.iter().any(|i| lower.contains(i))
        })
        .unwrap_or(first);
    if line.chars().count() > ERROR_SUMMARY_CHARS {
        let cut: String = line.chars().take(ERROR_SUMMARY_CHARS - 3).collect();
        format!("{cut}...")
    } else {
        (*line).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    pub enabled: bool,
    pub in_context_threshold: u32,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            in_context_threshold: DEFAULT_ISOLATION_THRESHOLD,
        }
    }
}

impl IsolationPolicy {
    /// Attempts beyond the threshold run isolated, unless this process is itself isolated.
    pub fn should_isolate(&self, pending: &PendingShellVerification, spawned: bool) -> bool {
        self.enabled && !spawned && pending.attempt_count >= self.in_context_threshold
    }
}

/// Keep the last `limit` characters of `text`.
pub fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}

/// Cut `text` to `limit` characters, marking the cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("\n... (truncated)");
    out
}

/// Record a finished attempt and classify it.
///
/// `notes` is the agent's account of what it changed (its response text or
/// an isolated verifier's summary); lessons are drawn from it first.
pub fn record_attempt(
    pending: &mut PendingShellVerification,
    mut result: VerificationResult,
    notes: Option<&str>,
) -> AttemptOutcome {
    result.stdout = tail_chars(&result.stdout, OUTPUT_TAIL_CHARS);
    result.stderr = tail_chars(&result.stderr, OUTPUT_TAIL_CHARS);
    let passed = result.passed;
    let number = pending.history.last().map_or(1, |r| r.number + 1);
    pending
        .history
        .push(AttemptRecord::from_result(number, &result, notes));
    if pending.history.len() > MAX_ATTEMPT_HISTORY {
        let excess = pending.history.len() - MAX_ATTEMPT_HISTORY;
        pending.history.drain(..excess);
    }
    pending.attempt_count += 1;
    pending.previous_results.push(result);
    if passed {
        AttemptOutcome::Passed
    } else if pending.is_exhausted() {
        AttemptOutcome::Escalated
    } else {
        AttemptOutcome::Retry
    }
}

/// Apply a `gate_action` to an exhausted verification.
pub fn apply_action(pending: &mut PendingShellVerification, action: GateAction) -> ActionOutcome {
    match action {
        // The attempt history survives a reset so the next round keeps its lessons.
        GateAction::Retry => {
            pending.attempt_count = 0;
            pending.previous_results.clear();
            ActionOutcome::Reset
        }
        GateAction::Skip => ActionOutcome::Skipped,
        GateAction::Abort => ActionOutcome::Aborted,
    }
}

/// Instructions shown when a verification is first attached to a step.
pub fn render_pending(pending: &PendingShellVerification) -> String {
    let cfg = &pending.shell_verify;
    let mut out = format!(
        "## Shell Verification\n\nWhen the work for step {} is done, resend with `chain_id`; the engine will run:\n\n```\n{}\n```\n\nTimeout: {}s. Attempts allowed: {}.",
        pending.step_number,
        cfg.command,
        cfg.timeout / 1000,
        pending.max_attempts
    );
    if let Some(dir) = &cfg.working_dir {
        out.push_str(&format!(" Working directory: `{dir}`."));
    }
    if cfg.loop_mode {
        out.push_str(" Loop mode is on: the stop hook re-runs the check until it passes.");
    }
    out
}

/// Feedback after a failed attempt that still has budget left.
pub fn render_bounce_back(pending: &PendingShellVerification) -> String {
    let Some(result) = pending.last_result() else {
        return render_pending(pending);
    };
    let error_output = if result.stderr.trim().is_empty() {
        &result.stdout
    } else {
        &result.stderr
    };
    let mut out = format!(
        "## Shell Verification FAILED (Attempt {}/{})\n\n**Command:** `{}`\n**Exit Code:** {}\n",
        pending.attempt_count, pending.max_attempts, result.command, result.exit_code
    );
    if result.timed_out {
        out.push_str(&format!(
            "**Timed out** after {}s\n",
            pending.shell_verify.timeout / 1000
        ));
    }
    if result.isolated {
        out.push_str("**Ran in an isolated context**\n");
    }
    out.push_str(&format!(
        "\n**Error Output:**\n```\n{}\n```\n\nFix the issues above, then resend with `chain_id` to re-run verification.",
        truncate_chars(error_output.trim(), FEEDBACK_CHARS)
    ));
    out
}

pub fn render_escalation(pending: &PendingShellVerification) -> String {
    let last = pending
        .last_result()
        .map(|r| format!("Last exit code: {}", r.exit_code))
        .unwrap_or_default();
    format!(
        "## Shell Verification Escalation\n\n`{}` failed {} consecutive attempt(s) (limit {}). {last}\n\n{}",
        pending.shell_verify.command,
        pending.attempt_count,
        pending.max_attempts,
        escalation_choices("verification")
    )
}

pub fn render_passed(pending: &PendingShellVerification) -> String {
    let attempts = pending.attempt_count;
    format!(
        "## Shell Verification PASSED\n\n`{}` succeeded after {attempts} attempt(s).",
        pending.shell_verify.command
    )
}

/// Serialized hand-off for an isolated verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationTask {
    pub session_id: String,
    pub original_goal: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub last_failure: Option<VerificationResult>,
    pub history: Vec<AttemptRecord>,
}

impl IsolationTask {
    pub fn from_pending(session_id: &str, pending: &PendingShellVerification) -> Self {
        Self {
            session_id: session_id.to_string(),
            original_goal: pending
                .shell_verify
                .original_goal
                .clone()
                .unwrap_or_else(|| format!("Make `{}` pass", pending.shell_verify.command)),
            command: pending.shell_verify.command.clone(),
            working_dir: pending.shell_verify.working_dir.clone(),
            iteration: pending.attempt_count + 1,
            max_iterations: pending.max_attempts,
            last_failure: pending.last_result().cloned(),
            history: pending.history.clone(),
        }
    }

    /// Markdown task prompt for the spawned agent.
    pub fn render_prompt(&self) -> String {
        let mut out = format!(
            "# Verification Task\n\n## Goal\n{}\n\n## Success Criterion\n`{}` must exit with status 0.\n\n## Progress\nAttempt {} of {}.\n",
            self.original_goal, self.command, self.iteration, self.max_iterations
        );
        if let Some(dir) = &self.working_dir {
            out.push_str(&format!("Working directory: `{dir}`\n"));
        }
        if !self.history.is_empty() {
            out.push_str("\n## What Has Been Tried\n");
            for record in &self.history {
                out.push_str(&format!(
                    "\n{}. {}\n   - Result: {}\n   - Lesson: {}\n",
                    record.number, record.approach, record.result, record.lesson
                ));
            }
            if let Some(last) = self.history.last() {
                out.push_str(&format!(
                    "\nStart from the latest lesson: {}. Do not repeat an approach that already failed.\n",
                    last.lesson.trim_end_matches('.')
                ));
            }
        }
        if let Some(last) = &self.last_failure {
            out.push_str(&format!(
                "\n## Last Failure\nExit code {}\n```\n{}\n```\n",
                last.exit_code,
                truncate_chars(last.stderr.trim(), FEEDBACK_CHARS)
            ));
        }
        out.push_str(
            "\n## Instructions\nFix the cause of the failure, run the command yourself to confirm, then stop. Do not change the verification command.\n",
        );
        out
    }
}
