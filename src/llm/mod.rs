//! Provider-neutral LLM access.
//!
//! The execution loop sends a message history plus the tool list and gets back
//! either a tool call or a final answer, with token usage. Provider HTTP
//! errors are folded into [`LlmError`]; retries are the caller's business.

pub mod anthropic;
pub mod openai;
pub mod scripted;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transport::ToolCapability;

pub use self::anthropic::AnthropicClient;
pub use self::openai::OpenAiClient;
pub use self::scripted::ScriptedLlm;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "scripted")]
    Scripted,
}

/// Model selection and pricing for one run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub model: String,
    /// Override the provider's public endpoint (proxies, compatible servers).
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// USD per 1000 prompt tokens.
    pub input_cost_per_1k: f64,
    /// USD per 1000 completion tokens.
    pub output_cost_per_1k: f64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: None,
            temperature: 0.0,
            max_tokens: 1024,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
        }
    }
}

impl LlmSettings {
    pub fn api_key_var(&self) -> Option<&str> {
        match (&self.api_key_env, self.provider) {
            (Some(var), _) => Some(var.as_str()),
            (None, ProviderKind::OpenAi) => Some("OPENAI_API_KEY"),
            (None, ProviderKind::Anthropic) => Some("ANTHROPIC_API_KEY"),
            (None, ProviderKind::Scripted) => None,
        }
    }

    /// Read the API key from the environment.
    pub fn api_key(&self) -> Result<String, LlmError> {
        let Some(var) = self.api_key_var() else {
            return Ok(String::new());
        };
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(LlmError::Auth(format!("environment variable {} is not set", var))),
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.prompt_tokens as f64 / 1000.0 * self.input_cost_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.output_cost_per_1k
    }

    pub fn options(&self, timeout: Duration) -> CompletionOptions {
        CompletionOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on assistant turns that requested a tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    /// Set on tool-result turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn tool_request(call: ToolCall) -> Self {
        Self {
            role: Role::Assistant,
            content: call.reasoning.clone().unwrap_or_default(),
            tool_call: Some(call),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Function definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolCapability> for ToolSpec {
    fn from(cap: &ToolCapability) -> Self {
        Self {
            name: cap.name.clone(),
            description: cap.description.clone(),
            parameters: cap.input_schema.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Free text the model produced alongside the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    ToolCall(ToolCall),
    FinalAnswer(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reply: Reply,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("malformed model output: {0}")]
    Malformed(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout(_) | LlmError::Unavailable(_)
        )
    }
}

/// Longest provider-requested wait that is honoured as given.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Map a non-success HTTP status to the shared taxonomy.
pub(crate) fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> LlmError {
    let detail = body.chars().take(300).collect::<String>();
    match status {
        401 | 403 => LlmError::Auth(format!("HTTP {}: {}", status, detail)),
        429 => LlmError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map(|after| after.min(MAX_RETRY_AFTER)),
        },
        408 => LlmError::Unavailable(format!("HTTP 408: {}", detail)),
        500..=599 => LlmError::Unavailable(format!("HTTP {}: {}", status, detail)),
        _ => LlmError::Provider(format!("HTTP {}: {}", status, detail)),
    }
}

pub(crate) fn classify_reqwest(err: reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        LlmError::Unavailable(err.to_string())
    } else if err.is_decode() {
        LlmError::Malformed(err.to_string())
    } else {
        LlmError::Provider(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// One of the supported providers, chosen from [`LlmSettings`].
#[derive(Debug, Clone)]
pub enum LlmAdapter {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
    Scripted(ScriptedLlm),
}

impl LlmAdapter {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        match settings.provider {
            ProviderKind::OpenAi => Ok(LlmAdapter::OpenAi(OpenAiClient::new(settings)?)),
            ProviderKind::Anthropic => Ok(LlmAdapter::Anthropic(AnthropicClient::new(settings)?)),
            ProviderKind::Scripted => Ok(LlmAdapter::Scripted(ScriptedLlm::default())),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            LlmAdapter::OpenAi(_) => ProviderKind::OpenAi,
            LlmAdapter::Anthropic(_) => ProviderKind::Anthropic,
            LlmAdapter::Scripted(_) => ProviderKind::Scripted,
        }
    }

    /// Ask the model for its next move. The call is bounded by
    /// `options.timeout`.
    pub async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let call = async {
            match self {
                LlmAdapter::OpenAi(client) => client.complete(messages, tools, options).await,
                LlmAdapter::Anthropic(client) => client.complete(messages, tools, options).await,
                LlmAdapter::Scripted(script) => script.complete(messages, tools).await,
            }
        };

        match tokio::time::timeout(options.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(options.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, None, ""), LlmError::Auth(_)));
        assert_eq!(
            classify_status(429, Some("2"), ""),
            LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(
            classify_status(429, Some("soon"), ""),
            LlmError::RateLimited { retry_after: None }
        );
        assert!(classify_status(503, None, "overloaded").is_transient());
        assert!(!classify_status(400, None, "bad request").is_transient());
    }

    #[test]
    fn test_retry_after_out_of_range() {
        assert_eq!(
            classify_status(429, Some("1e30"), ""),
            LlmError::RateLimited {
                retry_after: Some(MAX_RETRY_AFTER)
            }
        );
        assert_eq!(
            classify_status(429, Some("-1"), ""),
            LlmError::RateLimited { retry_after: None }
        );
        assert_eq!(
            classify_status(429, Some("NaN"), ""),
            LlmError::RateLimited { retry_after: None }
        );
    }

    #[test]
    fn test_cost_uses_per_1k_prices() {
        let settings = LlmSettings {
            input_cost_per_1k: 0.5,
            output_cost_per_1k: 1.5,
            ..LlmSettings::default()
        };
        let usage = TokenUsage {
            prompt_tokens: 2000,
            completion_tokens: 1000,
        };
        assert!((settings.cost(&usage) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_api_key_is_auth_error() {
        let settings = LlmSettings {
            api_key_env: Some("AUDITRUN_TEST_KEY_THAT_IS_NOT_SET".into()),
            ..LlmSettings::default()
        };
        assert!(matches!(settings.api_key(), Err(LlmError::Auth(_))));
        assert!(LlmAdapter::from_settings(&settings).is_err());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: LlmSettings = toml::from_str(
            r#"
provider = "anthropic"
model = "claude-sonnet"
max_tokens = 2048
"#,
        )
        .unwrap();
        assert_eq!(settings.provider, ProviderKind::Anthropic);
        assert_eq!(settings.max_tokens, 2048);
        assert_eq!(settings.api_key_var(), Some("ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn test_adapter_enforces_timeout() {
        let script = ScriptedLlm::default().with_delay(Duration::from_millis(200));
        let adapter = LlmAdapter::Scripted(script);
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 10,
            timeout: Duration::from_millis(20),
        };

        let err = adapter
            .complete(&[Message::user("hi")], &[], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_tool_spec_from_capability() {
        let cap = ToolCapability {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            requires_confirmation: false,
        };
        let spec = ToolSpec::from(&cap);
        assert_eq!(spec.name, "read_file");
        assert_eq!(spec.parameters["properties"]["path"]["type"], "string");
    }
}
