//! Shared deterministic types for the engine core.
//!
//! These types define the contracts between the parser, the planner and the
//! pipeline stages. They are plain data: serializable so a chain session can
//! persist a snapshot of them and re-hydrate on a later invocation.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Argument values keyed by argument name.
pub type ArgMap = BTreeMap<String, String>;

/// A declared argument of a prompt definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// One fixed step of a chain-type prompt definition.
///
/// `args` values are templates rendered against the arguments the chain was
/// invoked with (e.g. `topic = "{{ topic }}"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStepDefinition {
    pub prompt_id: String,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub args: ArgMap,
}

/// Per-prompt gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptGateConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub framework_gates: bool,
}

impl Default for PromptGateConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            framework_gates: true,
        }
    }
}

/// When a script tool attached to a prompt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptTrigger {
    /// Run on every execution of the prompt.
    #[default]
    Always,
    /// Run only when the step arguments satisfy the tool's input schema.
    SchemaMatch,
    /// Never run automatically.
    Never,
}

/// A prompt-scoped script tool executed by the external script runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptToolDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub trigger: ScriptTrigger,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub auto_approve_on_valid: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A prompt definition as exposed by the prompt store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub user_message_template: String,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    #[serde(default)]
    pub chain_steps: Vec<ChainStepDefinition>,
    /// Gates applied to every step when this prompt runs as a chain.
    #[serde(default)]
    pub chain_gates: Vec<String>,
    #[serde(default)]
    pub gates: PromptGateConfig,
    #[serde(default)]
    pub tools: Vec<ScriptToolDefinition>,
    #[serde(default)]
    pub requires_framework: Option<bool>,
}

fn default_category() -> String {
    "general".to_string()
}

impl PromptDefinition {
    pub fn is_chain(&self) -> bool {
        !self.chain_steps.is_empty()
    }

    /// Reference and utility prompts skip methodology injection unless they opt in.
    pub fn needs_framework(&self) -> bool {
        self.requires_framework
            .unwrap_or(!matches!(self.category.as_str(), "reference" | "utility"))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Single,
    Chain,
}

/// Surface form the command text was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseFormat {
    Simple,
    Json,
    Symbolic,
}

/// `%modifier` prefixes that change how much guidance an execution receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModifier {
    /// No framework injection and no gate guidance.
    Clean,
    /// Gate guidance but no framework injection.
    Lean,
    /// Force framework injection even for prompts that do not request it.
    Guided,
    /// Return a framework/gate selection menu instead of executing.
    Judge,
}

impl ExecutionModifier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "clean" => Some(Self::Clean),
            "lean" => Some(Self::Lean),
            "guided" => Some(Self::Guided),
            "judge" => Some(Self::Judge),
            _ => None,
        }
    }
}

/// Verification presets selectable with `:fast`, `:full`, `:extended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyPreset {
    Fast,
    Full,
    Extended,
}

impl VerifyPreset {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "full" => Some(Self::Full),
            "extended" => Some(Self::Extended),
            _ => None,
        }
    }

    /// `(max_iterations, timeout_ms)` for the preset.
    pub fn limits(self) -> (u32, u64) {
        match self {
            Self::Fast => (1, 30_000),
            Self::Full => (5, 300_000),
            Self::Extended => (10, 600_000),
        }
    }
}

pub const DEFAULT_VERIFY_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 300_000;

/// A `verify:"<command>"` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellVerifyConfig {
    pub command: String,
    pub timeout: u64,
    pub max_iterations: u32,
    #[serde(rename = "loop")]
    pub loop_mode: bool,
    pub checkpoint: bool,
    pub rollback: bool,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub preset: Option<VerifyPreset>,
    #[serde(default)]
    pub original_goal: Option<String>,
}

impl ShellVerifyConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_VERIFY_TIMEOUT_MS,
            max_iterations: DEFAULT_VERIFY_MAX_ITERATIONS,
            loop_mode: false,
            checkpoint: false,
            rollback: false,
            working_dir: None,
            preset: None,
            original_goal: None,
        }
    }
}

/// A `name:"criteria"` inline gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCriterion {
    pub name: String,
    pub criteria: String,
}

/// Gates written inline with `::`, attached to a step or to the whole command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineGates {
    /// Free-text criteria (`:: "be terse"`).
    pub criteria: Vec<String>,
    pub named: Vec<NamedCriterion>,
    /// Bare references to registered gate ids (`:: code-quality`).
    pub references: Vec<String>,
    pub shell_verify: Option<ShellVerifyConfig>,
}

impl InlineGates {
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
            && self.named.is_empty()
            && self.references.is_empty()
            && self.shell_verify.is_none()
    }

    pub fn merge(&mut self, other: InlineGates) {
        self.criteria.extend(other.criteria);
        self.named.extend(other.named);
        self.references.extend(other.references);
        if other.shell_verify.is_some() {
            self.shell_verify = other.shell_verify;
        }
    }
}

/// How a step is joined to the step before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepJoin {
    #[default]
    Sequential,
    /// Member of a `&` fan-out group.
    Parallel { group: u32 },
    /// Receives the previous step's output through `|`.
    Pipe,
}

/// Kinds of symbolic operators recognised by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Chain,
    Gate,
    Framework,
    Parallel,
    Pipe,
    Repetition,
    Style,
    Modifier,
}

/// One recognised operator occurrence, kept for diagnostics and planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub kind: OperatorKind,
    pub detail: String,
}

/// One step of a chain command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedStep {
    pub step_number: u32,
    pub prompt_id: String,
    pub args: ArgMap,
    #[serde(default)]
    pub inline_gates: InlineGates,
    #[serde(default)]
    pub join: StepJoin,
    /// Gate ids attached by later stages; the only field stages may annotate.
    #[serde(default)]
    pub resolved_gate_ids: Vec<String>,
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
}

impl ParsedStep {
    pub fn new(step_number: u32, prompt_id: impl Into<String>, args: ArgMap) -> Self {
        Self {
            step_number,
            prompt_id: prompt_id.into(),
            args,
            inline_gates: InlineGates::default(),
            join: StepJoin::Sequential,
            resolved_gate_ids: Vec::new(),
            plan: None,
        }
    }
}

/// Output of the symbolic command parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedCommand {
    pub command_type: CommandType,
    pub format: ParseFormat,
    pub raw: String,
    /// Resolved prompt id for single commands (and the chain prompt when promoted).
    pub prompt_id: Option<String>,
    pub args: ArgMap,
    pub steps: Vec<ParsedStep>,
    /// Criteria attached to the whole command.
    pub command_gates: InlineGates,
    pub framework_override: Option<String>,
    pub style: Option<String>,
    pub modifiers: Vec<ExecutionModifier>,
    pub operators: Vec<Operator>,
    pub confidence: f32,
    pub warnings: Vec<String>,
    pub promoted_from_single: bool,
    #[serde(default)]
    pub resolved_gate_ids: Vec<String>,
}

impl ParsedCommand {
    pub fn total_steps(&self) -> u32 {
        match self.command_type {
            CommandType::Single => 1,
            CommandType::Chain => self.steps.len() as u32,
        }
    }

    /// Steps as a uniform list; a single command is presented as one step.
    pub fn effective_steps(&self) -> Cow<'_, [ParsedStep]> {
        match self.command_type {
            CommandType::Chain => Cow::Borrowed(&self.steps),
            CommandType::Single => {
                let mut step = ParsedStep::new(
                    1,
                    self.prompt_id.clone().unwrap_or_default(),
                    self.args.clone(),
                );
                step.resolved_gate_ids = self.resolved_gate_ids.clone();
                Cow::Owned(vec![step])
            }
        }
    }

    pub fn has_modifier(&self, modifier: ExecutionModifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    /// Base name used for chain identifiers (`chain-<base>#<run>`).
    pub fn chain_base(&self) -> String {
        self.prompt_id
            .clone()
            .or_else(|| self.steps.first().map(|s| s.prompt_id.clone()))
            .unwrap_or_else(|| "adhoc".to_string())
    }

    /// All shell verification directives, command-level first.
    pub fn shell_verify(&self) -> Option<&ShellVerifyConfig> {
        self.command_gates
            .shell_verify
            .as_ref()
            .or_else(|| self.steps.iter().find_map(|s| s.inline_gates.shell_verify.as_ref()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Single,
    Chain,
}

/// Planner output for a single prompt or for a chain (aggregated over steps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub strategy: ExecutionStrategy,
    pub gates: Vec<String>,
    pub requires_framework: bool,
    pub requires_session: bool,
    pub framework_override: Option<String>,
    pub api_validation: bool,
}
