//! End-to-end flows through the `prompt_engine` pipeline.
//!
//! Each test drives one [`PromptEngine`] across several invocations with
//! scripted shell, script-tool and isolation collaborators, resuming chains
//! only through the `chain_id` the previous response reported.

use std::sync::Arc;

use engine::core::types::PromptDefinition;
use engine::io::config::EngineConfig;
use engine::io::git::GitCheckpoints;
use engine::io::prompts::StaticPromptStore;
use engine::io::session_store::InMemorySessionStore;
use engine::pipeline::{Collaborators, EngineServices, PromptEngine, PromptEngineRequest, ToolResponse};
use engine::test_support::{
    RecordingSpawner, ScriptedRunner, ScriptedShell, auto_approve_tool, prompt, prompt_with_args,
};
use serde_json::{Value, json};
use tempfile::TempDir;

struct Harness {
    engine: PromptEngine,
    shell: Arc<ScriptedShell>,
    spawner: Arc<RecordingSpawner>,
    runner: Arc<ScriptedRunner>,
    _runtime: TempDir,
}

fn harness(prompts: Vec<PromptDefinition>, exit_codes: Vec<i32>, tool_stdout: &str) -> Harness {
    harness_with(EngineConfig::default(), prompts, exit_codes, tool_stdout)
}

fn harness_with(
    config: EngineConfig,
    prompts: Vec<PromptDefinition>,
    exit_codes: Vec<i32>,
    tool_stdout: &str,
) -> Harness {
    let runtime = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::new(exit_codes);
    let spawner = RecordingSpawner::new();
    let runner = ScriptedRunner::new(tool_stdout, 0);
    let config = EngineConfig {
        runtime_dir: runtime.path().to_path_buf(),
        ..config
    };
    let collaborators = Collaborators {
        prompts: Arc::new(StaticPromptStore::new(prompts)),
        sessions: Arc::new(InMemorySessionStore::new()),
        shell: shell.clone(),
        scripts: runner.clone(),
        spawner: spawner.clone(),
        checkpoints: Arc::new(GitCheckpoints),
    };
    let services = EngineServices::new(config, collaborators).expect("services");
    Harness {
        engine: PromptEngine::new(services),
        shell,
        spawner,
        runner,
        _runtime: runtime,
    }
}

impl Harness {
    fn call(&self, request: Value) -> ToolResponse {
        let request: PromptEngineRequest = serde_json::from_value(request).expect("request");
        self.engine.execute(request)
    }
}

fn text(response: &ToolResponse) -> String {
    response.text_content()
}

fn structured<'a>(response: &'a ToolResponse, key: &str) -> &'a Value {
    response
        .structured_content
        .as_ref()
        .and_then(|v| v.get(key))
        .unwrap_or(&Value::Null)
}

fn chain_id(response: &ToolResponse) -> String {
    structured(response, "chainId")
        .as_str()
        .expect("chainId in structured content")
        .to_string()
}

#[test]
fn single_prompt_renders_without_session() {
    let h = harness(
        vec![prompt_with_args("greet", "Hello {{name}}!", &["name"])],
        vec![0],
        "{}",
    );
    let response = h.call(json!({"command": ">>greet name=\"Ada\""}));

    assert!(!response.is_error, "{}", text(&response));
    let body = text(&response);
    assert!(body.contains("Hello Ada!"), "{body}");
    assert!(!body.contains("Session ID:"), "{body}");
}

#[test]
fn chain_progresses_and_templates_previous_output() {
    let h = harness(
        vec![
            prompt_with_args("outline", "Outline {{topic}}", &["topic"]),
            prompt("draft", "Draft from: {{previous_step_output}}"),
        ],
        vec![0],
        "{}",
    );
    let first = h.call(json!({"command": ">>outline topic=\"rust\" --> >>draft"}));
    let body = text(&first);
    assert!(body.contains("## Step 1/2"), "{body}");
    assert!(body.contains("Outline rust"), "{body}");
    assert!(body.contains("Session ID: sess-"), "{body}");
    let id = chain_id(&first);
    assert_eq!(id, "chain-outline#1");

    let second = h.call(json!({"chain_id": id, "user_response": "1. ownership"}));
    let body = text(&second);
    assert!(body.contains("Draft from: 1. ownership"), "{body}");
    assert!(body.contains("Step 2/2"), "{body}");

    let done = h.call(json!({"chain_id": id, "user_response": "final draft"}));
    let body = text(&done);
    assert!(body.contains("✓ Chain complete (2/2)"), "{body}");
    assert!(body.contains("no `user_response` needed"), "{body}");
    assert_eq!(structured(&done, "status"), "completed");
}

#[test]
fn response_less_resumes_never_advance_twice() {
    let h = harness(
        vec![prompt("a", "A"), prompt("b", "B"), prompt("c", "C")],
        vec![0],
        "{}",
    );
    let id = chain_id(&h.call(json!({"command": ">>a --> >>b --> >>c"})));

    let first = h.call(json!({"chain_id": id}));
    assert_eq!(structured(&first, "currentStep"), 2);

    let second = h.call(json!({"chain_id": id}));
    assert_eq!(structured(&second, "currentStep"), 2);
    assert!(text(&second).contains("stays current"), "{}", text(&second));
}

#[test]
fn unknown_chain_without_command_is_an_error() {
    let h = harness(vec![prompt("a", "A")], vec![0], "{}");
    let response = h.call(json!({"chain_id": "chain-missing#4"}));
    assert!(response.is_error);
}

#[test]
fn verification_escalates_after_five_failures_and_retry_resets() {
    let h = harness(vec![prompt("fix", "Fix the build")], vec![1], "{}");
    let start = h.call(json!({"command": ">>fix :: verify:\"cargo test\""}));
    let body = text(&start);
    assert!(body.contains("## Shell Verification"), "{body}");
    assert!(body.contains("cargo test"), "{body}");
    let id = chain_id(&start);

    for attempt in 1..=4 {
        let response = h.call(json!({"chain_id": id}));
        let body = text(&response);
        assert!(
            body.contains(&format!("FAILED (Attempt {attempt}/5)")),
            "attempt {attempt}: {body}"
        );
    }
    let escalated = h.call(json!({"chain_id": id}));
    let body = text(&escalated);
    assert!(body.contains("Shell Verification Escalation"), "{body}");
    assert!(body.contains("`gate_action`"), "{body}");
    assert_eq!(h.shell.call_count(), 5);
    assert_eq!(h.spawner.spawned().len(), 2);

    let retried = h.call(json!({"chain_id": id, "gate_action": "retry"}));
    let body = text(&retried);
    assert!(body.contains("FAILED (Attempt 1/5)"), "{body}");
    assert_eq!(h.shell.call_count(), 6);
}

#[test]
fn skipping_an_exhausted_verification_completes_the_chain() {
    let h = harness(vec![prompt("fix", "Fix the build")], vec![1], "{}");
    let id = chain_id(&h.call(json!({"command": ">>fix :: verify:\"make check\" max:1"})));

    let escalated = h.call(json!({"chain_id": id}));
    assert!(text(&escalated).contains("Escalation"), "{}", text(&escalated));

    let skipped = h.call(json!({"chain_id": id, "gate_action": "skip"}));
    let body = text(&skipped);
    assert!(body.contains("Verification skipped"), "{body}");
    assert!(body.contains("✓ Chain complete"), "{body}");
}

#[test]
fn passing_verification_advances() {
    let h = harness(vec![prompt("fix", "Fix the build")], vec![1, 0], "{}");
    let id = chain_id(&h.call(json!({"command": ">>fix :: verify:\"cargo test\""})));

    assert!(text(&h.call(json!({"chain_id": id}))).contains("FAILED (Attempt 1/5)"));
    let passed = h.call(json!({"chain_id": id, "user_response": "fixed the test"}));
    let body = text(&passed);
    assert!(body.contains("Shell Verification PASSED"), "{body}");
    assert_eq!(structured(&passed, "status"), "completed");
}

#[test]
fn auto_approved_tool_reports_payload() {
    let mut definition = prompt("deploy", "Deploy {{tool_validate}}");
    definition.tools = vec![auto_approve_tool("validate")];
    let h = harness(
        vec![definition],
        vec![0],
        r#"{"valid": true, "auto_execute": {"action": "ship"}}"#,
    );
    let response = h.call(json!({"command": ">>deploy"}));

    assert!(!response.is_error);
    assert_eq!(h.runner.invocation_count(), 1);
    assert_eq!(structured(&response, "autoApprovedTools"), &json!(["validate"]));
    assert_eq!(structured(&response, "autoExecute")["validate"]["action"], "ship");
    assert!(text(&response).contains("Auto-approved tools"), "{}", text(&response));
}

#[test]
fn invalid_tool_output_blocks_auto_approval() {
    let mut definition = prompt("deploy", "Deploy");
    definition.tools = vec![auto_approve_tool("validate")];
    let h = harness(
        vec![definition],
        vec![0],
        r#"{"valid": false, "errors": ["name is required"]}"#,
    );
    let response = h.call(json!({"command": ">>deploy"}));

    assert!(!response.is_error, "validation failures are guidance, not errors");
    assert_eq!(
        structured(&response, "validationErrors"),
        &json!(["name is required"])
    );
    assert!(structured(&response, "autoApprovedTools").is_null());
    assert!(text(&response).contains("Validation errors"), "{}", text(&response));
}

#[test]
fn non_json_tool_output_is_never_approved() {
    let mut definition = prompt("deploy", "Deploy");
    definition.tools = vec![auto_approve_tool("validate")];
    let h = harness(vec![definition], vec![0], "looks fine to me");
    let response = h.call(json!({"command": ">>deploy"}));

    assert_eq!(
        structured(&response, "validationErrors"),
        &json!(["Validation failed"])
    );
}

#[test]
fn framework_override_is_restored_after_the_call() {
    let h = harness(vec![prompt("plan", "Plan the work")], vec![0], "{}");

    let overridden = h.call(json!({"command": "@react >>plan"}));
    assert_eq!(structured(&overridden, "framework"), "ReACT");
    assert!(text(&overridden).contains("(ReACT)"), "{}", text(&overridden));
    assert_eq!(h.engine.services().frameworks.active_id(), "CAGEERF");

    let plain = h.call(json!({"command": ">>plan"}));
    assert_eq!(structured(&plain, "framework"), "CAGEERF");
    assert_eq!(h.engine.services().frameworks.active_id(), "CAGEERF");
}

#[test]
fn unknown_framework_override_is_rejected() {
    let h = harness(vec![prompt("plan", "Plan the work")], vec![0], "{}");
    let response = h.call(json!({"command": "@nope >>plan"}));
    assert!(response.is_error);
    assert!(text(&response).contains("@CAGEERF"), "{}", text(&response));
}

#[test]
fn inline_criteria_require_a_review_before_advancing() {
    let h = harness(vec![prompt("draft", "Draft"), prompt("polish", "Polish")], vec![0], "{}");
    let start = h.call(json!({"command": ">>draft :: \"cite sources\" --> >>polish"}));
    let id = chain_id(&start);

    let review = h.call(json!({"chain_id": id, "user_response": "my draft"}));
    let body = text(&review);
    assert!(body.contains("Gate Review Required"), "{body}");
    assert!(body.contains("cite sources"), "{body}");
    assert_eq!(structured(&review, "currentStep"), 1);

    let failed = h.call(json!({
        "chain_id": id,
        "gate_verdict": "GATE_REVIEW: FAIL - no citations yet"
    }));
    let body = text(&failed);
    assert!(body.contains("Previous review failed: no citations yet"), "{body}");
    assert_eq!(structured(&failed, "currentStep"), 1);

    let passed = h.call(json!({
        "chain_id": id,
        "user_response": "my draft [1]",
        "gate_verdict": "GATE_REVIEW: PASS - sources cited"
    }));
    let body = text(&passed);
    assert!(body.contains("Gate review passed: sources cited"), "{body}");
    assert!(body.contains("Step 2/2"), "{body}");
}

#[test]
fn bare_verdict_in_free_text_is_not_trusted() {
    let h = harness(vec![prompt("draft", "Draft"), prompt("polish", "Polish")], vec![0], "{}");
    let id = chain_id(&h.call(json!({"command": ">>draft :: \"cite sources\" --> >>polish"})));
    h.call(json!({"chain_id": id, "user_response": "my draft"}));

    let response = h.call(json!({"chain_id": id, "user_response": "PASS - looks good"}));
    assert!(text(&response).contains("Gate Review Required"), "{}", text(&response));
    assert_eq!(structured(&response, "currentStep"), 1);
}

fn planned_gates(response: &ToolResponse) -> Vec<String> {
    structured(response, "gates")
        .as_array()
        .map(|ids| ids.iter().filter_map(|id| id.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[test]
fn methodology_gates_follow_the_config_switch() {
    let prompts = || vec![prompt("outline", "Outline the plan")];

    let h = harness(prompts(), vec![0], "{}");
    let response = h.call(json!({"command": "@ReACT >>outline"}));
    assert!(!response.is_error, "{}", text(&response));
    assert!(planned_gates(&response).contains(&"framework-compliance".to_string()));
    assert!(text(&response).contains("Framework Compliance"), "{}", text(&response));

    let mut config = EngineConfig::default();
    config.gates.methodology_gates = false;
    let h = harness_with(config.clone(), prompts(), vec![0], "{}");
    let response = h.call(json!({"command": "@ReACT >>outline"}));
    assert!(planned_gates(&response).is_empty(), "{:?}", planned_gates(&response));
    assert!(!text(&response).contains("Framework Compliance"));

    let h = harness_with(config, prompts(), vec![0], "{}");
    let response = h.call(json!({"command": "@ReACT >>outline :: framework-compliance"}));
    assert!(planned_gates(&response).contains(&"framework-compliance".to_string()));
}
