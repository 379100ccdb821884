use anyhow::{Result, bail};
use tracing::debug;

use crate::pipeline::context::ExecutionContext;
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Rejects conflicting options before anything is parsed.
pub struct RequestNormalization;

impl Stage for RequestNormalization {
    fn name(&self) -> &'static str {
        "request-normalization"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        ctx.request.normalize()?;
        debug!(
            resume = ctx.request.chain_id.is_some(),
            has_response = ctx.request.user_response.is_some(),
            "request normalized"
        );
        Ok(())
    }
}

pub struct DependencyCheck;

impl Stage for DependencyCheck {
    fn name(&self) -> &'static str {
        "dependency-check"
    }

    fn run(&self, _ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        if services.catalog.is_empty() {
            bail!(
                "no prompt definitions loaded from {}",
                services.config.prompts_dir.display()
            );
        }
        Ok(())
    }
}
