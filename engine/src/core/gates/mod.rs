//! Gate accumulation, definitions, registries and verdict parsing.

pub mod accumulator;
pub mod definition;
pub mod inline;
pub mod registry;
pub mod verdict;

pub use accumulator::{GateAccumulator, GateEntry, GateSource};
pub use definition::{
    CriteriaType, CriterionOutcome, GateActivation, GateCategory, GateDefinition, GateKind,
    PassCriterion, evaluate_gate,
};
pub use inline::{inline_gate_definitions, self_review_gate, slugify};
pub use registry::{GateGuidance, GateLookup, GateRegistry, TemporaryGateRegistry};
pub use verdict::{ParsedVerdict, Verdict, VerdictSource, parse_gate_verdict};
