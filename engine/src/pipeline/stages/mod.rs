//! The nineteen pipeline stages, in execution order.

mod capture;
mod execution;
mod framework;
mod gates;
mod lifecycle;
mod normalize;
mod output;
mod parse;
mod planning;
mod review;
mod session;

use std::collections::BTreeMap;

use crate::gate_review::STEP_METADATA_KEY;
use crate::pipeline::Stage;

pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(normalize::RequestNormalization),
        Box::new(normalize::DependencyCheck),
        Box::new(lifecycle::ExecutionLifecycle),
        Box::new(parse::CommandParsing),
        Box::new(gates::InlineGateExtraction),
        Box::new(parse::OperatorValidation),
        Box::new(planning::ExecutionPlanning),
        Box::new(framework::JudgeDecision),
        Box::new(gates::GateEnhancement),
        Box::new(framework::FrameworkResolution),
        Box::new(session::SessionManagement),
        Box::new(framework::InjectionFrequency),
        Box::new(framework::PromptGuidance),
        Box::new(capture::ResponseCapture),
        Box::new(execution::StepExecution),
        Box::new(review::GateReview),
        Box::new(review::CallToAction),
        Box::new(output::ResponseFormatting),
        Box::new(lifecycle::Cleanup),
    ]
}

/// Accumulator metadata restricting a gate to `step`.
fn step_metadata(step: u32) -> BTreeMap<String, String> {
    BTreeMap::from([(STEP_METADATA_KEY.to_string(), step.to_string())])
}
