// crates/pipehandlers/tests/native_test.rs

use pipecore::{DataMap, Handler, HandlerContext, NodeError, StepData, TRANSIENT_CONTEXT_KEY};
use pipehandlers::NativeHandler;
use serde_json::json;

fn record_with_output(node_id: &str, output: serde_json::Value) -> StepData {
    let mut record = StepData::new(node_id, "session");
    if let serde_json::Value::Object(map) = output {
        record.output_data = map;
    }
    record
}

fn context<'a>(prior: &'a [StepData], config: &'a DataMap, input: &'a str) -> HandlerContext<'a> {
    HandlerContext {
        prior,
        all: prior,
        global_config: config,
        input,
    }
}

#[tokio::test]
async fn test_input_handler_with_single_predecessor() {
    let handler = NativeHandler::new();
    let config = DataMap::new();
    let prior = vec![record_with_output("A", json!({ "answer": 42 }))];
    let mut record = StepData::new("B", "session").with_text("hello");

    handler
        .invoke("native::default_input_handler", context(&prior, &config, "hello"), &mut record)
        .await
        .unwrap();

    assert_eq!(record.input_data["input_text"], json!("hello"));
    assert_eq!(record.input_data["data"], json!({ "answer": 42 }));
    assert_eq!(record.input_data["datas"], json!({ "A": { "answer": 42 } }));
    assert!(record.input_data[TRANSIENT_CONTEXT_KEY].is_array());
}

#[tokio::test]
async fn test_input_handler_with_several_predecessors() {
    let handler = NativeHandler::new();
    let config = DataMap::new();
    let prior = vec![
        record_with_output("A", json!({ "x": 1 })),
        record_with_output("B", json!({ "y": 2 })),
    ];
    let mut record = StepData::new("C", "session");

    handler
        .invoke("native::default_input_handler", context(&prior, &config, ""), &mut record)
        .await
        .unwrap();

    assert_eq!(record.input_data["data"], json!({}));
    assert_eq!(record.input_data["datas"], json!({ "A": { "x": 1 }, "B": { "y": 2 } }));
}

#[tokio::test]
async fn test_output_handler_parsing() {
    let handler = NativeHandler::new();
    let config = DataMap::new();
    let mut record = StepData::new("A", "session");

    let cases = [
        (r#"{"ok": true}"#, json!({ "ok": true })),
        ("[1, 2]", json!({ "data": [1, 2] })),
        ("not json", json!({})),
    ];
    for (input, expected) in cases {
        handler
            .invoke("native::default_output_handler", context(&[], &config, input), &mut record)
            .await
            .unwrap();
        assert_eq!(serde_json::Value::Object(record.output_data.clone()), expected, "input {}", input);
    }
}

#[tokio::test]
async fn test_prompt_rendering() {
    let handler = NativeHandler::new();
    let config = DataMap::new();
    let mut record = StepData::new("A", "session");
    record.input_data.insert("input_text".to_string(), json!("hello"));
    record.input_data.insert("data".to_string(), json!({ "name": "world" }));

    handler
        .invoke(
            "native::default_user_prompt_handler",
            context(&[], &config, "Greet {{ data.name }}"),
            &mut record,
        )
        .await
        .unwrap();
    assert_eq!(record.text, "hello\nGreet world");

    handler
        .invoke(
            "native::default_system_prompt_handler",
            context(&[], &config, "Broken {% if %}"),
            &mut record,
        )
        .await
        .unwrap();
    assert_eq!(record.text, "{{input_text}}\nBroken {% if %}");
}

#[tokio::test]
async fn test_custom_callback_and_unknown_name() {
    let handler = NativeHandler::new().with_callback("mark", |ctx: HandlerContext<'_>, record: &mut StepData| {
        record.success = false;
        record.text = ctx.input.to_uppercase();
        Ok(())
    });
    let config = DataMap::new();
    let mut record = StepData::new("A", "session");

    handler
        .invoke("native::mark", context(&[], &config, "loud"), &mut record)
        .await
        .unwrap();
    assert!(!record.success);
    assert_eq!(record.text, "LOUD");
    assert!(handler.names().contains(&"mark".to_string()));

    let err = handler
        .invoke("native::missing", context(&[], &config, ""), &mut record)
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Handler { .. }));
}
