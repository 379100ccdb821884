//! Chain session storage.
//!
//! The store is the single shared map of sessions keyed by session id. Chain
//! identifier lookups scan it; the number of live sessions is small.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::session::{ChainId, ChainReference, ChainSession};
use crate::io::config::write_atomic;

pub trait SessionStore: Send + Sync {
    fn get(&self, session_id: &str) -> Result<Option<ChainSession>>;
    fn save(&self, session: &ChainSession) -> Result<()>;
    fn remove(&self, session_id: &str) -> Result<bool>;
    fn all(&self) -> Result<Vec<ChainSession>>;

    /// Exact chain-id match, dormant runs included.
    fn find_by_chain_id(&self, chain_id: &str) -> Result<Option<ChainSession>> {
        Ok(self.all()?.into_iter().find(|s| s.chain_id == chain_id))
    }

    /// Every run of `base`, ordered by run number.
    fn runs_for_base(&self, base: &str) -> Result<Vec<ChainSession>> {
        let mut runs: Vec<(u32, ChainSession)> = self
            .all()?
            .into_iter()
            .filter_map(|s| match ChainReference::parse(&s.chain_id) {
                Some(ChainReference::Run(ChainId { base: b, run })) if b == base => Some((run, s)),
                _ => None,
            })
            .collect();
        runs.sort_by_key(|(run, _)| *run);
        Ok(runs.into_iter().map(|(_, s)| s).collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, ChainSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ChainSession>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session store lock poisoned"))
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, session_id: &str) -> Result<Option<ChainSession>> {
        Ok(self.lock()?.get(session_id).cloned())
    }

    fn save(&self, session: &ChainSession) -> Result<()> {
        self.lock()?
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(session_id).is_some())
    }

    fn all(&self) -> Result<Vec<ChainSession>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

/// One pretty-printed JSON file per session under `<runtime_dir>/sessions/`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            dir: runtime_dir.join("sessions"),
        }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!("invalid session id '{session_id}'"));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

fn load_session(path: &Path) -> Result<ChainSession> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse session {}", path.display()))
}

impl SessionStore for FileSessionStore {
    fn get(&self, session_id: &str) -> Result<Option<ChainSession>> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        load_session(&path).map(Some)
    }

    fn save(&self, session: &ChainSession) -> Result<()> {
        let path = self.path_for(&session.session_id)?;
        debug!(
            path = %path.display(),
            chain_id = %session.chain_id,
            step = session.state.current_step,
            "writing session"
        );
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    fn remove(&self, session_id: &str) -> Result<bool> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove session {}", path.display())),
        }
    }

    fn all(&self) -> Result<Vec<ChainSession>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))? {
            let path = entry.context("read session entry")?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                sessions.push(load_session(&path)?);
            }
        }
        Ok(sessions)
    }
}
