//! The `prompt_engine` execution pipeline.
//!
//! One invocation builds an [`ExecutionContext`] and runs it through a fixed
//! list of stages. Once a stage sets `context.response` the remaining stages
//! are skipped, except those marked [`Stage::always_runs`] (cleanup). Stage
//! errors become error responses; they never escape [`PromptEngine::execute`].

pub mod context;
pub mod error;
pub mod request;
pub mod response;
pub mod services;
pub mod stages;

use anyhow::Result;
use tracing::{debug_span, instrument, warn};

pub use context::ExecutionContext;
pub use request::PromptEngineRequest;
pub use response::ToolResponse;
pub use services::{Collaborators, EngineServices};

pub trait Stage {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()>;

    /// Run even after an earlier stage produced the response.
    fn always_runs(&self) -> bool {
        false
    }
}

pub struct PromptEngine {
    services: EngineServices,
    stages: Vec<Box<dyn Stage>>,
}

impl PromptEngine {
    pub fn new(services: EngineServices) -> Self {
        Self::with_stages(services, stages::default_stages())
    }

    pub fn with_stages(services: EngineServices, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { services, stages }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    #[instrument(skip_all, fields(command = request.command.as_deref(), chain_id = request.chain_id.as_deref()))]
    pub fn execute(&self, request: PromptEngineRequest) -> ToolResponse {
        let mut ctx = ExecutionContext::new(request);
        for stage in &self.stages {
            if ctx.has_response() && !stage.always_runs() {
                continue;
            }
            let span = debug_span!(
                "stage",
                name = stage.name(),
                scope = %ctx.state.lifecycle.scope_id
            );
            let _guard = span.enter();
            if let Err(err) = stage.run(&mut ctx, &self.services) {
                warn!(stage = stage.name(), err = %format!("{err:#}"), "stage failed");
                if !ctx.has_response() {
                    ctx.response = Some(error::error_response(&err));
                }
            }
        }
        ctx.response.unwrap_or_else(|| {
            ToolResponse::error("Internal error: the pipeline finished without a response")
        })
    }
}
