//! Ordered, priority-aware gate set assembled during planning.
//!
//! For any gate id only the entry from the highest-priority source survives.
//! Equal or lower priority additions are rejected (first in wins at equal
//! priority). Once frozen the set is read-only.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where a gate came from, ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateSource {
    RegistryAuto,
    Methodology,
    ChainLevel,
    PromptConfig,
    TemporaryRequest,
    ClientSelection,
    InlineOperator,
}

impl GateSource {
    pub const fn priority(self) -> u8 {
        match self {
            Self::RegistryAuto => 20,
            Self::Methodology => 40,
            Self::ChainLevel => 50,
            Self::PromptConfig => 60,
            Self::TemporaryRequest => 80,
            Self::ClientSelection => 90,
            Self::InlineOperator => 100,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegistryAuto => "registry-auto",
            Self::Methodology => "methodology",
            Self::ChainLevel => "chain-level",
            Self::PromptConfig => "prompt-config",
            Self::TemporaryRequest => "temporary-request",
            Self::ClientSelection => "client-selection",
            Self::InlineOperator => "inline-operator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateEntry {
    pub id: String,
    pub source: GateSource,
    pub priority: u8,
    /// Milliseconds since the Unix epoch.
    pub added_at: i64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GateAccumulator {
    entries: Vec<GateEntry>,
    frozen: bool,
}

impl GateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &str, source: GateSource) -> bool {
        self.add_with_metadata(id, source, BTreeMap::new())
    }

    /// Add or upgrade a gate. Returns `true` when the set changed.
    pub fn add_with_metadata(
        &mut self,
        id: &str,
        source: GateSource,
        metadata: BTreeMap<String, String>,
    ) -> bool {
        let id = id.trim();
        if self.frozen {
            warn!(gate_id = id, source = source.as_str(), "gate accumulator frozen; add rejected");
            return false;
        }
        if id.is_empty() {
            debug!(source = source.as_str(), "empty gate id rejected");
            return false;
        }

        let entry = GateEntry {
            id: id.to_string(),
            source,
            priority: source.priority(),
            added_at: Utc::now().timestamp_millis(),
            metadata,
        };

        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(existing) if source.priority() > existing.priority => {
                debug!(
                    gate_id = id,
                    from = existing.source.as_str(),
                    to = source.as_str(),
                    "gate source upgraded"
                );
                *existing = entry;
                true
            }
            Some(existing) => {
                debug!(
                    gate_id = id,
                    existing = existing.source.as_str(),
                    rejected = source.as_str(),
                    "gate addition rejected: existing source has equal or higher priority"
                );
                false
            }
            None => {
                self.entries.push(entry);
                true
            }
        }
    }

    /// Add several ids from one source; returns how many changed the set.
    pub fn add_all<I, S>(&mut self, ids: I, source: GateSource) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter(|id| self.add(id.as_ref(), source))
            .count()
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id.trim())
    }

    pub fn get(&self, id: &str) -> Option<&GateEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Gate ids in insertion order.
    pub fn get_all(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn get_by_source(&self, source: GateSource) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn get_entries(&self) -> &[GateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn freeze(&mut self) {
        if !self.frozen {
            debug!(gates = self.entries.len(), "gate accumulator frozen");
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn clear(&mut self) {
        if self.frozen {
            warn!("gate accumulator frozen; clear ignored");
            return;
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_strictly_ordered() {
        let order = [
            GateSource::RegistryAuto,
            GateSource::Methodology,
            GateSource::ChainLevel,
            GateSource::PromptConfig,
            GateSource::TemporaryRequest,
            GateSource::ClientSelection,
            GateSource::InlineOperator,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    /// Lower-priority re-submission after an upgrade never downgrades the source.
    #[test]
    fn highest_priority_source_survives() {
        let mut acc = GateAccumulator::new();
        assert!(acc.add("code-quality", GateSource::RegistryAuto));
        assert!(acc.add("code-quality", GateSource::Methodology));
        assert!(!acc.add("code-quality", GateSource::RegistryAuto));
        assert_eq!(
            acc.get("code-quality").map(|e| e.source),
            Some(GateSource::Methodology)
        );
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn equal_priority_keeps_first_entry() {
        let mut acc = GateAccumulator::new();
        let mut first = BTreeMap::new();
        first.insert("origin".to_string(), "first".to_string());
        assert!(acc.add_with_metadata("g", GateSource::ClientSelection, first));
        assert!(!acc.add("g", GateSource::ClientSelection));
        assert_eq!(acc.get("g").map(|e| e.metadata["origin"].as_str()), Some("first"));
    }

    #[test]
    fn upgrade_keeps_insertion_position() {
        let mut acc = GateAccumulator::new();
        acc.add("a", GateSource::RegistryAuto);
        acc.add("b", GateSource::RegistryAuto);
        acc.add("a", GateSource::InlineOperator);
        assert_eq!(acc.get_all(), vec!["a", "b"]);
        assert_eq!(acc.get_by_source(GateSource::InlineOperator), vec!["a"]);
    }

    #[test]
    fn blank_ids_are_rejected_and_ids_trimmed() {
        let mut acc = GateAccumulator::new();
        assert!(!acc.add("   ", GateSource::InlineOperator));
        assert!(acc.add("  padded ", GateSource::InlineOperator));
        assert!(acc.has("padded"));
    }

    #[test]
    fn add_all_counts_changes() {
        let mut acc = GateAccumulator::new();
        acc.add("x", GateSource::InlineOperator);
        let added = acc.add_all(["x", "y", "z"], GateSource::PromptConfig);
        assert_eq!(added, 2);
    }

    /// After freeze, add and clear leave the state untouched.
    #[test]
    fn frozen_accumulator_is_immutable() {
        let mut acc = GateAccumulator::new();
        acc.add("a", GateSource::RegistryAuto);
        acc.freeze();
        acc.freeze();
        let before = acc.get_entries().to_vec();

        assert!(!acc.add("b", GateSource::InlineOperator));
        assert!(!acc.add("a", GateSource::InlineOperator));
        acc.clear();

        assert!(acc.is_frozen());
        assert_eq!(acc.get_entries(), before.as_slice());
    }

    #[test]
    fn clear_works_before_freeze() {
        let mut acc = GateAccumulator::new();
        acc.add("a", GateSource::RegistryAuto);
        acc.clear();
        assert!(acc.is_empty());
    }
}
