//! Methodology frameworks and the shared active-framework switch.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameworkDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub summary: &'static str,
    pub system_prompt: &'static str,
    /// Ordered phases the response should walk through.
    pub phases: &'static [&'static str],
    /// Methodology gates activated alongside the framework.
    pub gate_ids: &'static [&'static str],
}

impl FrameworkDefinition {
    /// System-prompt block injected ahead of the step content.
    pub fn injection(&self) -> String {
        let mut out = format!("## Methodology: {} ({})\n\n{}\n", self.name, self.id, self.system_prompt);
        if !self.phases.is_empty() {
            out.push('\n');
            for (i, phase) in self.phases.iter().enumerate() {
                out.push_str(&format!("{}. {phase}\n", i + 1));
            }
        }
        out
    }

    /// Shorter per-step reminder used by template guidance enhancement.
    pub fn step_guidance(&self) -> String {
        format!(
            "Apply {} to this step: {}.",
            self.id,
            self.phases.join(" -> ")
        )
    }
}

pub static BUILTIN_FRAMEWORKS: &[FrameworkDefinition] = &[
    FrameworkDefinition {
        id: "CAGEERF",
        name: "Context, Analysis, Goals, Execution, Evaluation, Refinement, Framework",
        summary: "Structured end-to-end methodology for substantial work",
        system_prompt: "Work through the task methodically. Establish context before analysing, state goals before executing, and evaluate the result before refining it.",
        phases: &[
            "Context",
            "Analysis",
            "Goals",
            "Execution",
            "Evaluation",
            "Refinement",
            "Framework",
        ],
        gate_ids: &["framework-compliance"],
    },
    FrameworkDefinition {
        id: "ReACT",
        name: "Reason and Act",
        summary: "Alternating reasoning and action for investigative tasks",
        system_prompt: "Alternate explicit reasoning with concrete actions. After each action, observe the result and adjust the next step.",
        phases: &["Thought", "Action", "Observation", "Reflection"],
        gate_ids: &["framework-compliance"],
    },
    FrameworkDefinition {
        id: "5W1H",
        name: "Who, What, When, Where, Why, How",
        summary: "Question-driven coverage for analysis and requirements",
        system_prompt: "Answer each of the six questions explicitly before drawing conclusions.",
        phases: &["Who", "What", "When", "Where", "Why", "How"],
        gate_ids: &["framework-compliance"],
    },
    FrameworkDefinition {
        id: "SCAMPER",
        name: "Substitute, Combine, Adapt, Modify, Put to another use, Eliminate, Reverse",
        summary: "Creative variation techniques for ideation",
        system_prompt: "Generate alternatives by applying each SCAMPER lens in turn, then pick the strongest ideas.",
        phases: &[
            "Substitute",
            "Combine",
            "Adapt",
            "Modify",
            "Put to another use",
            "Eliminate",
            "Reverse",
        ],
        gate_ids: &["framework-compliance"],
    },
];

/// Case-insensitive lookup over the built-in frameworks.
pub fn find_framework(id: &str) -> Option<&'static FrameworkDefinition> {
    let id = id.trim().trim_start_matches('@');
    BUILTIN_FRAMEWORKS
        .iter()
        .find(|f| f.id.eq_ignore_ascii_case(id))
}

/// How often the methodology prompt is re-injected across chain steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InjectionFrequency {
    #[default]
    Every,
    First,
    Interval,
}

impl InjectionFrequency {
    pub fn should_inject(self, step: u32, interval: u32) -> bool {
        match self {
            Self::Every => true,
            Self::First => step <= 1,
            Self::Interval => step <= 1 || (step - 1) % interval.max(1) == 0,
        }
    }
}

/// Owns the process-wide active framework.
///
/// Overrides are scoped: `switch` returns the previous id and callers restore
/// it when the invocation ends.
#[derive(Debug)]
pub struct FrameworkManager {
    enabled: bool,
    active: Mutex<String>,
}

impl FrameworkManager {
    pub fn new(default_id: &str, enabled: bool) -> Self {
        let active = find_framework(default_id)
            .map(|f| f.id)
            .unwrap_or(BUILTIN_FRAMEWORKS[0].id);
        Self {
            enabled,
            active: Mutex::new(active.to_string()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn active_id(&self) -> String {
        self.active
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn active(&self) -> Option<&'static FrameworkDefinition> {
        find_framework(&self.active_id())
    }

    /// Make `id` active; returns the id that was active before.
    pub fn switch(&self, id: &str) -> Option<String> {
        let framework = find_framework(id)?;
        let mut guard = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = std::mem::replace(&mut *guard, framework.id.to_string());
        debug!(from = %previous, to = framework.id, "active framework switched");
        Some(previous)
    }

    pub fn restore(&self, previous: &str) {
        if self.switch(previous).is_none() {
            warn!(framework = previous, "cannot restore unknown framework");
        }
    }

    pub fn list(&self) -> &'static [FrameworkDefinition] {
        BUILTIN_FRAMEWORKS
    }
}

impl Default for FrameworkManager {
    fn default() -> Self {
        Self::new("CAGEERF", true)
    }
}
