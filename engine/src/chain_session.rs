//! Chain session service: identifier resolution, run numbering and the
//! create/resume decision on top of a [`SessionStore`].

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, instrument};

use crate::core::session::{
    ChainId, ChainReference, ChainSession, PlaceholderSource, SESSION_ID_PREFIX, SessionBlueprint,
    SessionDecision, SessionLifecycle,
};
use crate::core::types::ArgMap;
use crate::io::session_store::SessionStore;

/// A session found for a `chain_id` parameter.
#[derive(Debug, Clone)]
pub struct SessionLookup {
    pub session: ChainSession,
    /// The reference was a session id rather than a chain identifier.
    pub by_session_id: bool,
}

impl SessionLookup {
    pub fn session_hit(&self) -> bool {
        self.by_session_id && self.session.is_active()
    }
}

/// What a response-less resume did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderOutcome {
    Advanced,
    /// The previous step is already a placeholder; stay put.
    Held,
}

#[derive(Clone)]
pub struct ChainSessionService {
    store: Arc<dyn SessionStore>,
}

impl ChainSessionService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Resolve a `chain_id` parameter. Dormant runs are included.
    #[instrument(skip_all, fields(reference = raw))]
    pub fn lookup(&self, raw: &str) -> Result<Option<SessionLookup>> {
        let Some(reference) = ChainReference::parse(raw) else {
            debug!("chain reference not recognised");
            return Ok(None);
        };
        let found = match reference {
            ChainReference::Session(id) => {
                return Ok(self.store.get(&id)?.map(|session| SessionLookup {
                    session,
                    by_session_id: true,
                }));
            }
            ChainReference::Run(chain_id) => self.store.find_by_chain_id(&chain_id.to_string())?,
            ChainReference::Latest(base) => self.latest_run(&base)?,
        };
        Ok(found.map(|session| SessionLookup {
            session,
            by_session_id: false,
        }))
    }

    /// The canonical run of `base`, else its highest-numbered run.
    pub fn latest_run(&self, base: &str) -> Result<Option<ChainSession>> {
        let runs = self.store.runs_for_base(base)?;
        let canonical = runs
            .iter()
            .rev()
            .find(|s| s.lifecycle == SessionLifecycle::Canonical)
            .cloned();
        Ok(canonical.or_else(|| runs.last().cloned()))
    }

    /// Create a new run of `blueprint`'s chain. Earlier canonical runs of the
    /// same base turn dormant.
    #[instrument(skip_all, fields(decision = ?decision))]
    pub fn create(
        &self,
        blueprint: SessionBlueprint,
        original_args: ArgMap,
        decision: SessionDecision,
    ) -> Result<ChainSession> {
        let base = blueprint.parsed_command.chain_base();
        let runs = self.store.runs_for_base(&base)?;
        let next_run = runs
            .iter()
            .filter_map(|s| match ChainReference::parse(&s.chain_id) {
                Some(ChainReference::Run(id)) => Some(id.run),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;
        for mut prior in runs {
            if prior.lifecycle == SessionLifecycle::Canonical {
                prior.lifecycle = SessionLifecycle::Dormant;
                self.store
                    .save(&prior)
                    .with_context(|| format!("mark {} dormant", prior.chain_id))?;
            }
        }

        let now = now_millis();
        let chain_id = ChainId::new(base, next_run).to_string();
        let session = ChainSession::new(new_session_id(), chain_id, blueprint, original_args, now);
        self.store.save(&session)?;
        info!(
            session_id = %session.session_id,
            chain_id = %session.chain_id,
            steps = session.state.total_steps,
            "chain session created"
        );
        Ok(session)
    }

    pub fn save(&self, session: &ChainSession) -> Result<()> {
        self.store
            .save(session)
            .with_context(|| format!("save session {}", session.session_id))
    }

    /// Store a real response for the current step.
    pub fn capture(&self, session: &mut ChainSession, response: &str) {
        let step = session.current_step();
        session.capture_response(step, response, now_millis());
        debug!(step, chars = response.len(), "step response captured");
    }

    /// Advance past the current step; a finished chain turns dormant.
    pub fn advance(&self, session: &mut ChainSession) {
        session.advance(now_millis());
        if session.is_complete() {
            session.lifecycle = SessionLifecycle::Dormant;
            info!(chain_id = %session.chain_id, "chain complete");
        } else {
            debug!(step = session.current_step(), "chain advanced");
        }
    }

    /// Response-less resume: fill the current step with a placeholder and move
    /// on unless the previous step was itself a placeholder.
    pub fn resume_without_response(&self, session: &mut ChainSession) -> PlaceholderOutcome {
        let step = session.current_step();
        session.record_placeholder(step, PlaceholderSource::MissingResponse, now_millis());
        let previous_is_placeholder = step
            .checked_sub(1)
            .and_then(|prev| session.step_state(prev))
            .is_some_and(|s| s.is_placeholder());
        if previous_is_placeholder {
            debug!(step, "previous step is a placeholder; not advancing");
            return PlaceholderOutcome::Held;
        }
        self.advance(session);
        PlaceholderOutcome::Advanced
    }

    /// Accept the current step as-is after a skipped gate or verification.
    pub fn skip_step(&self, session: &mut ChainSession, source: PlaceholderSource) {
        let step = session.current_step();
        session.record_placeholder(step, source, now_millis());
        self.advance(session);
    }

    pub fn abort(&self, session: &mut ChainSession) {
        session.abort(now_millis());
        session.lifecycle = SessionLifecycle::Dormant;
        info!(chain_id = %session.chain_id, "chain aborted");
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `sess-<utc timestamp>-<8 hex>`.
pub fn new_session_id() -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!(
        "{SESSION_ID_PREFIX}{}-{suffix:08x}",
        Utc::now().format("%Y%m%d%H%M%S")
    )
}
