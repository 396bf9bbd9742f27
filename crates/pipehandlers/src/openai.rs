use async_trait::async_trait;
use pipecore::{DataMap, Generator, NodeError};
use serde_json::{json, Value};

/// Generation backend speaking the OpenAI chat-completions protocol.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    /// Extra request body fields, overridden by model and messages
    options: DataMap,
}

impl OpenAiGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            options: DataMap::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    /// Take extra body fields from the `llm_config` object of a pipeline config.
    pub fn with_options(mut self, global_config: &DataMap) -> Self {
        if let Some(Value::Object(options)) = global_config.get("llm_config") {
            self.options = options.clone();
        }
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str, model: Option<&str>) -> Value {
        let mut body = self.options.clone();
        body.insert(
            "model".to_string(),
            Value::String(model.unwrap_or(&self.model).to_string()),
        );
        body.insert(
            "messages".to_string(),
            json!([
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ]),
        );
        Value::Object(body)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: Option<&str>,
    ) -> Result<String, NodeError> {
        let body = self.request_body(system_prompt, user_prompt, model);
        tracing::debug!("POST {} (model {})", self.endpoint(), body["model"]);

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::Generation(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| NodeError::Generation(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(NodeError::Generation(format!(
                "Backend returned {}: {}",
                status, payload
            )));
        }
        extract_content(&payload)
    }
}

fn extract_content(payload: &Value) -> Result<String, NodeError> {
    payload["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| NodeError::Generation(format!("Unexpected response shape: {}", payload)))
}
