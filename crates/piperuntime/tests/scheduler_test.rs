// crates/piperuntime/tests/scheduler_test.rs

use async_trait::async_trait;
use pipecore::{
    ConfigError, ExecutionEvent, ExecutionState, Generator, Handler, HandlerContext, NodeConfig,
    NodeError, Operation, PipeError, StepData, Violation, TRANSIENT_CONTEXT_KEY,
};
use piperuntime::{HandlerRegistry, PipeRuntime, RuntimeConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Minimal stand-in for the native backend: records which predecessors a
/// node saw and echoes raw input into the output.
struct TestBackend;

#[async_trait]
impl Handler for TestBackend {
    fn prefix(&self) -> &str {
        "native::"
    }

    async fn invoke(
        &self,
        reference: &str,
        ctx: HandlerContext<'_>,
        record: &mut StepData,
    ) -> Result<(), NodeError> {
        match self.body(reference) {
            "default_input_handler" => {
                let prior: Vec<Value> = ctx.prior.iter().map(|r| json!(r.node_id)).collect();
                record.input_data.insert("prior".to_string(), Value::Array(prior));
                record
                    .input_data
                    .insert(TRANSIENT_CONTEXT_KEY.to_string(), json!(ctx.all.len()));
            }
            "default_output_handler" => {
                record.output_data.insert("text".to_string(), json!(ctx.input));
            }
            "default_system_prompt_handler" | "default_user_prompt_handler" => {
                record.text = ctx.input.to_string();
            }
            "fail" => {
                return Err(NodeError::Handler {
                    reference: reference.to_string(),
                    message: "boom".to_string(),
                })
            }
            "unconverged" => record.success = false,
            "slow" => tokio::time::sleep(Duration::from_millis(30)).await,
            other => {
                return Err(NodeError::Handler {
                    reference: other.to_string(),
                    message: "unknown test handler".to_string(),
                })
            }
        }
        Ok(())
    }
}

struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: Option<&str>,
    ) -> Result<String, NodeError> {
        Ok(format!("{}|{}|{}", system_prompt, user_prompt, model.unwrap_or("default")))
    }
}

fn create_runtime(max_workers: usize) -> PipeRuntime {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(TestBackend));
    PipeRuntime::with_config(
        Arc::new(registry),
        RuntimeConfig {
            max_workers,
            ..RuntimeConfig::default()
        },
    )
}

fn transform(name: &str) -> NodeConfig {
    NodeConfig::new(name).with_operation(Operation::Transform)
}

fn prior_ids(record: &StepData) -> Vec<String> {
    record
        .input_data
        .get("prior")
        .and_then(|v| v.as_array())
        .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_layers_run_in_dependency_order() {
    let runtime = create_runtime(4);
    let configs = vec![
        transform("A"),
        transform("B"),
        transform("C").with_needs(["A", "B"]),
    ];

    let result = runtime.run(configs, "hello").await.unwrap();

    assert_eq!(result.nodes.len(), 1, "Only the terminal layer is returned");
    let c = result.node("C").unwrap();
    assert_eq!(c.state, ExecutionState::Completed);

    let store = runtime.store();
    let a = store.get("A", &[0]).await.unwrap().unwrap();
    let b = store.get("B", &[0]).await.unwrap().unwrap();
    let c = store.get("C", &[0]).await.unwrap().unwrap();

    assert!(a.end.unwrap() <= c.start.unwrap());
    assert!(b.end.unwrap() <= c.start.unwrap());
    assert_eq!(prior_ids(&c), vec!["A".to_string(), "B".to_string()]);
    assert!(prior_ids(&a).is_empty());
}

#[tokio::test]
async fn test_initial_input_reaches_first_layer_only() {
    let runtime = create_runtime(4);
    let configs = vec![transform("A"), transform("B").with_needs(["A"])];

    runtime.run(configs, "hello").await.unwrap();

    let a = runtime.store().get("A", &[0]).await.unwrap().unwrap();
    let b = runtime.store().get("B", &[0]).await.unwrap().unwrap();
    assert_eq!(a.output_data.get("text"), Some(&json!("hello")));
    assert_eq!(b.output_data.get("text"), Some(&json!("")));
}

#[tokio::test]
async fn test_transient_context_is_not_persisted() {
    let runtime = create_runtime(2);

    runtime.run(vec![transform("A")], "x").await.unwrap();

    let a = runtime.store().get("A", &[0]).await.unwrap().unwrap();
    assert!(!a.input_data.contains_key(TRANSIENT_CONTEXT_KEY));
    assert!(a.input_data.contains_key("prior"));
    assert_eq!(a.iteration_path, vec![0]);
}

#[tokio::test]
async fn test_disabled_and_passthrough_nodes_copy_input() {
    let runtime = create_runtime(2);
    let configs = vec![
        transform("off").with_output_handler("native::fail").disabled(),
        NodeConfig::new("pass").with_operation(Operation::Passthrough),
    ];

    let result = runtime.run(configs, "hello").await.unwrap();

    for id in ["off", "pass"] {
        let node = result.node(id).unwrap();
        assert_eq!(node.state, ExecutionState::Completed, "{} should complete", id);
        assert!(node.record.as_ref().unwrap().end.is_some());

        let stored = runtime.store().get(id, &[0]).await.unwrap().unwrap();
        assert_eq!(stored.output_data, stored.input_data, "{} output must equal input", id);
        assert!(stored.output_data.contains_key("prior"));
        assert!(!stored.output_data.contains_key(TRANSIENT_CONTEXT_KEY));
    }
}

#[tokio::test]
async fn test_passthrough_output_carries_no_transient_context_downstream() {
    let runtime = create_runtime(2);
    let configs = vec![
        transform("A"),
        NodeConfig::new("P").with_operation(Operation::Passthrough).with_needs(["A"]),
        transform("C").with_needs(["P"]),
    ];

    runtime.run(configs, "hello").await.unwrap();

    for id in ["A", "P", "C"] {
        let stored = runtime.store().get(id, &[0]).await.unwrap().unwrap();
        assert!(!stored.input_data.contains_key(TRANSIENT_CONTEXT_KEY), "{} input", id);
        assert!(!stored.output_data.contains_key(TRANSIENT_CONTEXT_KEY), "{} output", id);
    }
    let p = runtime.store().get("P", &[0]).await.unwrap().unwrap();
    assert_eq!(p.output_data, p.input_data);
}

#[tokio::test]
async fn test_allowed_failure_does_not_abort() {
    let runtime = create_runtime(2);
    let configs = vec![
        transform("A").with_output_handler("native::fail").allowing_failure(),
        transform("B").with_needs(["A"]),
    ];

    let result = runtime.run(configs, "hello").await.unwrap();

    assert_eq!(result.node("B").unwrap().state, ExecutionState::Completed);
    let a = runtime.store().get("A", &[0]).await.unwrap().unwrap();
    assert!(a.end.is_some(), "Failed nodes still record an end time");
}

#[tokio::test]
async fn test_allowed_failure_state_is_error_ignored() {
    let runtime = create_runtime(2);
    let configs = vec![transform("A").with_output_handler("native::fail").allowing_failure()];

    let result = runtime.run(configs, "hello").await.unwrap();

    let a = result.node("A").unwrap();
    assert_eq!(a.state, ExecutionState::ErrorIgnored);
    assert!(a.error.as_deref().unwrap().contains("boom"));
}

#[tokio::test]
async fn test_failure_aborts_the_run() {
    let runtime = create_runtime(2);
    let configs = vec![
        transform("A").with_output_handler("native::fail"),
        transform("sibling"),
        transform("B").with_needs(["A", "sibling"]),
    ];

    let err = runtime.run(configs, "hello").await.unwrap_err();

    match err {
        PipeError::Aborted { failed } => assert_eq!(failed, vec!["A".to_string()]),
        other => panic!("Expected abort, got {:?}", other),
    }
    // Siblings in the failing layer still finish and persist.
    assert!(runtime.store().get("sibling", &[0]).await.unwrap().is_some());
    assert!(runtime.store().get("B", &[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_operation_fails_node() {
    let runtime = create_runtime(2);

    let err = runtime.run(vec![NodeConfig::new("bare")], "hello").await.unwrap_err();

    assert!(matches!(err, PipeError::Aborted { .. }));
}

#[tokio::test]
async fn test_graph_container_without_operation_aborts() {
    let runtime = create_runtime(2);
    let configs = vec![
        NodeConfig::new("G").as_graph(0),
        transform("S").with_parent("G"),
    ];

    let err = runtime.run(configs, "hello").await.unwrap_err();

    match err {
        PipeError::Aborted { failed } => assert_eq!(failed, vec!["G".to_string()]),
        other => panic!("Expected abort, got {:?}", other),
    }
    assert!(runtime.store().get("S", &[0, 1]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_subgraph_retries_until_budget_exhausted() {
    let runtime = create_runtime(4);
    let configs = vec![
        NodeConfig::new("G").with_operation(Operation::Passthrough).as_graph(2),
        transform("S").with_parent("G").with_output_handler("native::unconverged"),
    ];

    runtime.run(configs, "hello").await.unwrap();

    let runs = runtime.store().all_by_id("S").await.unwrap();
    assert_eq!(runs.len(), 3, "Initial run plus two retries");
    let paths: Vec<Vec<u32>> = runs.iter().map(|r| r.iteration_path.clone()).collect();
    assert_eq!(paths, vec![vec![0, 1], vec![0, 2], vec![0, 3]]);
}

#[tokio::test]
async fn test_subgraph_without_budget_runs_once() {
    let runtime = create_runtime(4);
    let configs = vec![
        NodeConfig::new("G").with_operation(Operation::Passthrough).as_graph(0),
        transform("S").with_parent("G").with_output_handler("native::unconverged"),
    ];

    runtime.run(configs, "hello").await.unwrap();

    assert_eq!(runtime.store().all_by_id("S").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_subgraph_seeded_with_parent_record() {
    let runtime = create_runtime(4);
    let configs = vec![
        NodeConfig::new("G").with_operation(Operation::Passthrough).as_graph(0),
        transform("first").with_parent("G"),
        transform("second").with_parent("G").with_needs(["first"]),
    ];

    runtime.run(configs, "hello").await.unwrap();

    let first = runtime.store().get("first", &[0, 1]).await.unwrap().unwrap();
    let second = runtime.store().get("second", &[0, 1]).await.unwrap().unwrap();
    assert_eq!(prior_ids(&first), vec!["G".to_string()]);
    assert_eq!(prior_ids(&second), vec!["first".to_string()]);
    assert_eq!(first.parent_id.as_deref(), Some("G"));
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let runtime = create_runtime(1);
    let configs = vec![
        transform("A").with_output_handler("native::slow"),
        transform("B").with_output_handler("native::slow"),
    ];

    runtime.run(configs, "hello").await.unwrap();

    let a = runtime.store().get("A", &[0]).await.unwrap().unwrap();
    let b = runtime.store().get("B", &[0]).await.unwrap().unwrap();
    // Records start when input is prepared, so compare against the later end
    let (first, second) = if a.end <= b.end { (a, b) } else { (b, a) };
    assert!(second.end.unwrap() - first.end.unwrap() >= chrono::Duration::milliseconds(25));
}

#[tokio::test]
async fn test_generate_uses_rendered_prompts() {
    let runtime = create_runtime(2).with_generator(Arc::new(EchoGenerator));
    let configs = vec![NodeConfig::new("gen")
        .with_operation(Operation::Generate)
        .with_prompts("be brief", "say hi")
        .with_model("small")];

    let result = runtime.run(configs, "hello").await.unwrap();

    let record = result.node("gen").unwrap().record.clone().unwrap();
    assert_eq!(record.text, "be brief|say hi|small");
    assert_eq!(record.output_data.get("text"), Some(&json!("be brief|say hi|small")));
}

#[tokio::test]
async fn test_unregistered_handler_is_rejected_before_running() {
    let runtime = create_runtime(2);
    let configs = vec![transform("A").with_output_handler("remote::missing")];

    let err = runtime.run(configs, "hello").await.unwrap_err();

    match err {
        PipeError::Config(ConfigError::Invalid(violations)) => {
            assert!(violations
                .iter()
                .any(|v| matches!(v, Violation::UnknownHandler { .. })));
        }
        other => panic!("Expected config error, got {:?}", other),
    }
    assert!(runtime.store().all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let runtime = create_runtime(2);
    let mut events = runtime.subscribe_events();

    runtime.run(vec![transform("A")], "hello").await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(ExecutionEvent::RunStarted { node_count: 1, .. })));
    assert!(matches!(received.last(), Some(ExecutionEvent::RunCompleted { success: true, .. })));
    assert!(received
        .iter()
        .any(|e| matches!(e, ExecutionEvent::NodeFinished { state: ExecutionState::Completed, .. })));
}
