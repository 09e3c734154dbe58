// 🔌 Anthropic Messages API client
// Structured output by forcing a single tool whose input schema is the receipt

use crate::extract::{ExtractError, ExtractionRequest, ReceiptExtractor};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";
pub const STATUS_URL: &str = "https://status.anthropic.com";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Best-effort reachability check; callers only log the outcome
    pub async fn is_reachable(&self) -> bool {
        match self.client.get(STATUS_URL).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "status page check failed");
                false
            }
        }
    }
}

/// Messages API body for one extraction request
pub fn build_body(request: &ExtractionRequest) -> Value {
    json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "tools": [{
            "name": request.tool_name,
            "description": "Record the shop and line items read from a supermarket receipt.",
            "input_schema": request.schema,
        }],
        "tool_choice": { "type": "tool", "name": request.tool_name },
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": request.prompt },
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": request.media_type,
                        "data": request.image_base64,
                    }
                }
            ]
        }]
    })
}

/// Pull the forced tool call's input out of a Messages API response
pub fn parse_tool_input(response: &Value, tool_name: &str) -> Result<Value, ExtractError> {
    response["content"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|block| block["type"] == "tool_use" && block["name"] == tool_name)
        .map(|block| block["input"].clone())
        .filter(|input| !input.is_null())
        .ok_or(ExtractError::NoStructuredOutput)
}

#[async_trait]
impl ReceiptExtractor for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, ExtractError> {
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&build_body(request))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "extraction service rejected request");
            return Err(ExtractError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = resp.json().await?;
        if let Some(usage) = json.get("usage") {
            tracing::debug!(
                input_tokens = usage["input_tokens"].as_u64().unwrap_or(0),
                output_tokens = usage["output_tokens"].as_u64().unwrap_or(0),
                "extraction usage"
            );
        }

        parse_tool_input(&json, &request.tool_name)
    }
}
