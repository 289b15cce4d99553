//! Anthropic Messages API with tool use.

use serde_json::{json, Value};

use super::{
    classify_reqwest, classify_status, Completion, CompletionOptions, LlmError, LlmSettings,
    Message, Reply, Role, TokenUsage, ToolCall, ToolSpec,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Provider(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key()?,
        })
    }

    pub async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let body = build_request(&self.model, messages, tools, options);
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, options.timeout))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| classify_reqwest(e, options.timeout))?;

        if !status.is_success() {
            // 529 is the provider's "overloaded"
            return Err(classify_status(status.as_u16(), retry_after.as_deref(), &text));
        }
        parse_response(&text)
    }
}

/// Request body for `POST /v1/messages`. System turns are lifted into the
/// top-level `system` field; tool results travel as user turns.
pub fn build_request(
    model: &str,
    messages: &[Message],
    tools: &[ToolSpec],
    options: &CompletionOptions,
) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| match (m.role, &m.tool_call) {
            (Role::Assistant, Some(call)) => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments,
                }));
                json!({"role": "assistant", "content": blocks})
            }
            (Role::Assistant, None) => json!({"role": "assistant", "content": m.content}),
            (Role::Tool, _) => json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id,
                    "content": m.content,
                }]
            }),
            _ => json!({"role": "user", "content": m.content}),
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature,
        "messages": turns,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
    }
    body
}

pub fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::Malformed(format!("response is not JSON: {}", e)))?;

    let blocks = json["content"]
        .as_array()
        .ok_or_else(|| LlmError::Malformed("missing content array".to_string()))?;

    let usage = TokenUsage {
        prompt_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or(0),
        completion_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0),
    };

    let text = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let reply = match blocks.iter().find(|b| b["type"] == "tool_use") {
        Some(block) => Reply::ToolCall(ToolCall {
            id: block["id"].as_str().unwrap_or_default().to_string(),
            name: block["name"]
                .as_str()
                .ok_or_else(|| LlmError::Malformed("tool_use without a name".to_string()))?
                .to_string(),
            arguments: block.get("input").cloned().unwrap_or(Value::Null),
            reasoning: Some(text).filter(|t| !t.trim().is_empty()),
        }),
        None => Reply::FinalAnswer(text),
    };

    Ok(Completion { reply, usage })
}
