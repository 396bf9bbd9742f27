use async_trait::async_trait;
use minijinja::Environment;
use pipecore::{
    DataMap, Handler, HandlerContext, NodeError, StepData, NATIVE_PREFIX, TRANSIENT_CONTEXT_KEY,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Context key holding the node's raw text input.
pub const INPUT_TEXT_KEY: &str = "input_text";
/// Context key holding the single predecessor's output.
pub const DATA_KEY: &str = "data";
/// Context key holding every predecessor's output keyed by node id.
pub const DATAS_KEY: &str = "datas";

/// Application-supplied native handler body.
pub type Callback =
    Arc<dyn Fn(HandlerContext<'_>, &mut StepData) -> Result<(), NodeError> + Send + Sync>;

/// In-process backend answering `native::` references.
///
/// Ships the four default handlers; applications add their own with
/// [`NativeHandler::with_callback`]. A callback registered under a default
/// name replaces the default.
pub struct NativeHandler {
    callbacks: HashMap<String, Callback>,
}

impl NativeHandler {
    pub fn new() -> Self {
        let mut handler = Self {
            callbacks: HashMap::new(),
        };
        handler.register_callback("default_input_handler", default_input_handler);
        handler.register_callback("default_output_handler", default_output_handler);
        handler.register_callback("default_system_prompt_handler", render_prompt);
        handler.register_callback("default_user_prompt_handler", render_prompt);
        handler
    }

    pub fn with_callback<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(HandlerContext<'_>, &mut StepData) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        self.register_callback(name, callback);
        self
    }

    pub fn register_callback<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(HandlerContext<'_>, &mut StepData) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        let name = name.into();
        let name = name.strip_prefix(NATIVE_PREFIX).unwrap_or(&name).to_string();
        tracing::debug!("Registering native handler: {}", name);
        self.callbacks.insert(name, Arc::new(callback));
    }
}

impl Default for NativeHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for NativeHandler {
    fn prefix(&self) -> &str {
        NATIVE_PREFIX
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.keys().cloned().collect();
        names.sort();
        names
    }

    async fn invoke(
        &self,
        reference: &str,
        ctx: HandlerContext<'_>,
        record: &mut StepData,
    ) -> Result<(), NodeError> {
        let name = self.body(reference);
        let callback = self.callbacks.get(name).ok_or_else(|| NodeError::Handler {
            reference: reference.to_string(),
            message: format!("Native handler {} not registered, aborting!", name),
        })?;
        callback(ctx, record)
    }
}

/// Merge predecessor outputs into the record's input context.
///
/// A single predecessor is also exposed under `data`; every predecessor is
/// listed under `datas`. The stored history is attached under the transient
/// key and never persisted.
pub fn default_input_handler(ctx: HandlerContext<'_>, record: &mut StepData) -> Result<(), NodeError> {
    let mut datas = DataMap::new();
    for prior in ctx.prior {
        datas.insert(prior.node_id.clone(), Value::Object(prior.output_data.clone()));
    }
    let data = match ctx.prior {
        [single] => single.output_data.clone(),
        _ => DataMap::new(),
    };
    let history = serde_json::to_value(ctx.all).map_err(|e| NodeError::Handler {
        reference: "native::default_input_handler".to_string(),
        message: e.to_string(),
    })?;

    let mut input = DataMap::new();
    input.insert(INPUT_TEXT_KEY.to_string(), Value::String(record.text.clone()));
    input.insert(DATA_KEY.to_string(), Value::Object(data));
    input.insert(DATAS_KEY.to_string(), Value::Object(datas));
    input.insert(TRANSIENT_CONTEXT_KEY.to_string(), history);
    record.input_data = input;
    Ok(())
}

/// Parse the handler input as JSON. Non-object values are wrapped under
/// `data`; unparseable input yields an empty map.
pub fn default_output_handler(ctx: HandlerContext<'_>, record: &mut StepData) -> Result<(), NodeError> {
    record.output_data = match serde_json::from_str::<Value>(ctx.input) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut wrapped = DataMap::new();
            wrapped.insert(DATA_KEY.to_string(), other);
            wrapped
        }
        Err(e) => {
            tracing::debug!("Output of {} is not JSON: {}", record.node_id, e);
            DataMap::new()
        }
    };
    Ok(())
}

/// Render a prompt template against the record's input context.
pub fn render_prompt(ctx: HandlerContext<'_>, record: &mut StepData) -> Result<(), NodeError> {
    let template = with_input_text(ctx.input);
    let env = Environment::new();
    record.text = match env.render_str(&template, &record.input_data) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("Failed to render prompt for {}: {}", record.node_id, e);
            template
        }
    };
    Ok(())
}

fn with_input_text(template: &str) -> String {
    let marker = format!("{{{{{}}}}}", INPUT_TEXT_KEY);
    if template.contains(&marker) {
        template.to_string()
    } else {
        format!("{}\n{}", marker, template)
    }
}
