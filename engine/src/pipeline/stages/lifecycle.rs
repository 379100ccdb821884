use anyhow::Result;
use rand::Rng;
use tracing::debug;

use crate::chain_session::now_millis;
use crate::pipeline::context::{CleanupAction, ExecutionContext};
use crate::pipeline::services::EngineServices;
use crate::pipeline::Stage;

/// Assigns the invocation's gate scope and schedules its release.
pub struct ExecutionLifecycle;

impl Stage for ExecutionLifecycle {
    fn name(&self) -> &'static str {
        "execution-lifecycle"
    }

    fn run(&self, ctx: &mut ExecutionContext, _services: &EngineServices) -> Result<()> {
        let suffix: u32 = rand::thread_rng().r#gen();
        let scope_id = format!("exec-{}-{suffix:08x}", now_millis());
        ctx.state
            .lifecycle
            .cleanup
            .push(CleanupAction::ReleaseGateScope(scope_id.clone()));
        debug!(scope = %scope_id, "execution scope opened");
        ctx.state.lifecycle.scope_id = scope_id;
        Ok(())
    }
}

/// Runs the scheduled cleanup actions once, newest first.
pub struct Cleanup;

impl Stage for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn always_runs(&self) -> bool {
        true
    }

    fn run(&self, ctx: &mut ExecutionContext, services: &EngineServices) -> Result<()> {
        let lifecycle = &mut ctx.state.lifecycle;
        if lifecycle.cleaned_up {
            return Ok(());
        }
        lifecycle.cleaned_up = true;
        for action in lifecycle.cleanup.drain(..).rev() {
            match action {
                CleanupAction::ReleaseGateScope(scope) => {
                    let released = services.temporary_gates.cleanup_scope(&scope);
                    debug!(scope = %scope, released, "gate scope released");
                }
                CleanupAction::RestoreFramework(previous) => {
                    services.frameworks.restore(&previous);
                    debug!(framework = %previous, "active framework restored");
                }
            }
        }
        Ok(())
    }
}
