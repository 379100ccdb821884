//! Engine configuration stored as TOML (default `prompt-engine.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::frameworks::{InjectionFrequency, find_framework};
use crate::core::review::DEFAULT_REVIEW_MAX_ATTEMPTS;
use crate::core::types::{DEFAULT_VERIFY_MAX_ITERATIONS, DEFAULT_VERIFY_TIMEOUT_MS};
use crate::core::verify::{DEFAULT_ISOLATION_THRESHOLD, IsolationPolicy, OUTPUT_TAIL_CHARS};

pub const DEFAULT_CONFIG_FILE: &str = "prompt-engine.toml";
/// Environment override for the runtime directory, shared with the stop hook.
pub const RUNTIME_DIR_ENV: &str = "PROMPT_ENGINE_RUNTIME_DIR";

/// Engine configuration (TOML).
///
/// Missing fields fall back to the defaults below, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding prompt definition files (`*.toml`).
    pub prompts_dir: PathBuf,

    /// Directory for session snapshots and the verify-state file.
    pub runtime_dir: PathBuf,

    pub frameworks: FrameworksConfig,
    pub gates: GatesConfig,
    pub verification: VerificationConfig,
    pub scripts: ScriptsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prompts_dir: PathBuf::from("prompts"),
            runtime_dir: PathBuf::from("runtime-state"),
            frameworks: FrameworksConfig::default(),
            gates: GatesConfig::default(),
            verification: VerificationConfig::default(),
            scripts: ScriptsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FrameworksConfig {
    pub enabled: bool,
    pub default: String,
    pub injection: InjectionFrequency,
    /// Re-inject every N steps when `injection = "interval"`.
    pub interval: u32,
}

impl Default for FrameworksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: "CAGEERF".to_string(),
            injection: InjectionFrequency::Every,
            interval: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatesConfig {
    /// Include methodology-category gates in guidance.
    pub methodology_gates: bool,
    pub review_max_attempts: u32,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            methodology_gates: true,
            review_max_attempts: DEFAULT_REVIEW_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub output_limit_bytes: usize,
    pub isolation: IsolationConfig,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_VERIFY_MAX_ITERATIONS,
            timeout_ms: DEFAULT_VERIFY_TIMEOUT_MS,
            output_limit_bytes: OUTPUT_TAIL_CHARS,
            isolation: IsolationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IsolationConfig {
    pub enabled: bool,
    /// Attempts run in the caller's context before isolation kicks in.
    pub in_context_threshold: u32,
    /// Agent CLI used for isolated attempts; the task prompt is appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_budget_usd: f64,
    pub permission_mode: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            in_context_threshold: DEFAULT_ISOLATION_THRESHOLD,
            command: ["claude", "--print", "--output-format", "json"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            timeout_secs: 300,
            max_budget_usd: 1.0,
            permission_mode: "delegate".to_string(),
        }
    }
}

impl IsolationConfig {
    pub fn policy(&self) -> IsolationPolicy {
        IsolationPolicy {
            enabled: self.enabled,
            in_context_threshold: self.in_context_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptsConfig {
    pub timeout_ms: u64,
    pub output_limit_bytes: usize,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            output_limit_bytes: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if find_framework(&self.frameworks.default).is_none() {
            return Err(anyhow!(
                "frameworks.default '{}' is not a known framework",
                self.frameworks.default
            ));
        }
        if self.frameworks.interval == 0 {
            return Err(anyhow!("frameworks.interval must be > 0"));
        }
        if self.gates.review_max_attempts == 0 {
            return Err(anyhow!("gates.review_max_attempts must be > 0"));
        }
        if self.verification.max_attempts == 0 {
            return Err(anyhow!("verification.max_attempts must be > 0"));
        }
        if self.verification.timeout_ms == 0 {
            return Err(anyhow!("verification.timeout_ms must be > 0"));
        }
        if self.verification.output_limit_bytes == 0 {
            return Err(anyhow!("verification.output_limit_bytes must be > 0"));
        }
        let isolation = &self.verification.isolation;
        if isolation.command.is_empty() || isolation.command[0].trim().is_empty() {
            return Err(anyhow!(
                "verification.isolation.command must be a non-empty array"
            ));
        }
        if isolation.timeout_secs == 0 {
            return Err(anyhow!("verification.isolation.timeout_secs must be > 0"));
        }
        if self.scripts.timeout_ms == 0 {
            return Err(anyhow!("scripts.timeout_ms must be > 0"));
        }
        if self.scripts.output_limit_bytes == 0 {
            return Err(anyhow!("scripts.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Resolve relative directories against `base` (the config file's directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        if self.prompts_dir.is_relative() {
            self.prompts_dir = base.join(&self.prompts_dir);
        }
        if self.runtime_dir.is_relative() {
            self.runtime_dir = base.join(&self.runtime_dir);
        }
        self
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load `path`, resolve relative directories against its parent and apply
/// the [`RUNTIME_DIR_ENV`] override.
pub fn load_resolved(path: &Path) -> Result<EngineConfig> {
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let mut cfg = load_config(path)?.resolve_paths(&base);
    if let Some(dir) = std::env::var_os(RUNTIME_DIR_ENV).filter(|d| !d.is_empty()) {
        cfg.runtime_dir = PathBuf::from(dir);
    }
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename over it.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
