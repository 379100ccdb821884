//! Long-lived collaborators shared by every invocation.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::chain_session::ChainSessionService;
use crate::core::catalog::PromptCatalog;
use crate::core::frameworks::FrameworkManager;
use crate::core::gates::{GateLookup, GateRegistry, TemporaryGateRegistry};
use crate::gate_review::GateReviewService;
use crate::io::config::EngineConfig;
use crate::io::git::{CheckpointStore, GitCheckpoints};
use crate::io::isolation::{CliIsolationSpawner, IsolationSpawner};
use crate::io::prompts::{FilePromptStore, PromptStore};
use crate::io::scripts::{ProcessScriptRunner, ScriptToolRunner};
use crate::io::session_store::{FileSessionStore, SessionStore};
use crate::io::shell::{ProcessShellExecutor, ShellExecutor};
use crate::io::template::TemplateRenderer;
use crate::verification::ShellVerificationService;

/// Side-effecting dependencies, swappable in tests.
pub struct Collaborators {
    pub prompts: Arc<dyn PromptStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub shell: Arc<dyn ShellExecutor>,
    pub scripts: Arc<dyn ScriptToolRunner>,
    pub spawner: Arc<dyn IsolationSpawner>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Collaborators {
    /// Filesystem and process-backed collaborators for `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            prompts: Arc::new(FilePromptStore::new(config.prompts_dir.clone())),
            sessions: Arc::new(FileSessionStore::new(&config.runtime_dir)),
            shell: Arc::new(ProcessShellExecutor),
            scripts: Arc::new(ProcessScriptRunner),
            spawner: Arc::new(CliIsolationSpawner::new(
                config.verification.isolation.clone(),
                &config.runtime_dir,
            )),
            checkpoints: Arc::new(GitCheckpoints),
        }
    }
}

pub struct EngineServices {
    pub config: EngineConfig,
    pub catalog: PromptCatalog,
    pub gate_registry: GateRegistry,
    pub temporary_gates: TemporaryGateRegistry,
    pub frameworks: FrameworkManager,
    pub sessions: ChainSessionService,
    pub reviews: GateReviewService,
    pub verification: ShellVerificationService,
    pub scripts: Arc<dyn ScriptToolRunner>,
    pub templates: TemplateRenderer,
}

impl EngineServices {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let prompts = collaborators
            .prompts
            .load_and_convert_prompts()
            .context("load prompt definitions")?;
        info!(prompts = prompts.len(), "prompt catalog loaded");

        let verification = ShellVerificationService::new(
            collaborators.shell,
            collaborators.spawner,
            collaborators.checkpoints,
            &config.verification,
            &config.runtime_dir,
        );
        Ok(Self {
            catalog: PromptCatalog::new(prompts),
            gate_registry: GateRegistry::with_builtins(),
            temporary_gates: TemporaryGateRegistry::new(),
            frameworks: FrameworkManager::new(
                &config.frameworks.default,
                config.frameworks.enabled,
            ),
            sessions: ChainSessionService::new(collaborators.sessions),
            reviews: GateReviewService::new(config.gates.review_max_attempts),
            verification,
            scripts: collaborators.scripts,
            templates: TemplateRenderer::new(),
            config,
        })
    }

    /// Gate lookup over the registry and the given temporary scopes.
    pub fn gate_lookup(&self, scopes: &[String]) -> GateLookup<'_> {
        GateLookup::new(&self.gate_registry, &self.temporary_gates, scopes.to_vec())
    }
}
