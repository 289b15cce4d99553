//! OpenAI-compatible chat completions with function calling.

use serde_json::{json, Value};

use super::{
    classify_reqwest, classify_status, Completion, CompletionOptions, LlmError, LlmSettings,
    Message, Reply, Role, TokenUsage, ToolCall, ToolSpec,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiClient {
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
            return Err(classify_status(status.as_u16(), retry_after.as_deref(), &text));
        }
        parse_response(&text)
    }
}

fn encode_message(message: &Message) -> Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content}),
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Assistant => match &message.tool_call {
            Some(call) => {
                let content = if message.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(message.content.clone())
                };
                json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": [{
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    }]
                })
            }
            None => json!({"role": "assistant", "content": message.content}),
        },
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
    }
}

/// Request body for `POST /chat/completions`.
pub fn build_request(
    model: &str,
    messages: &[Message],
    tools: &[ToolSpec],
    options: &CompletionOptions,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages.iter().map(encode_message).collect::<Vec<_>>(),
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
    });

    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

/// Normalize a chat completion response.
pub fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::Malformed(format!("response is not JSON: {}", e)))?;

    let message = json["choices"]
        .get(0)
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message".to_string()))?;

    let usage = TokenUsage {
        prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let reply = match message.get("tool_calls").and_then(|c| c.get(0)) {
        Some(call) => {
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| LlmError::Malformed("tool call without a name".to_string()))?;
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(raw_args).map_err(|e| {
                LlmError::Malformed(format!("arguments for '{}' are not JSON: {}", name, e))
            })?;
            Reply::ToolCall(ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: name.to_string(),
                arguments,
                reasoning: content.filter(|c| !c.trim().is_empty()),
            })
        }
        None => Reply::FinalAnswer(content.unwrap_or_default()),
    };

    Ok(Completion { reply, usage })
}
