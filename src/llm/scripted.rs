//! Replays a queue of canned replies instead of calling a provider.
//!
//! Used by the test suite and for offline rehearsals of a session. When the
//! queue runs dry the fallback reply is returned on every call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::{Completion, LlmError, Message, Reply, TokenUsage, ToolCall, ToolSpec};

const DEFAULT_FALLBACK: &str =
    r#"{"verdict": "BLOCKED", "confidence": 0.0, "reasoning": "scripted model has no reply queued"}"#;

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<Result<Reply, LlmError>>,
    requests: Vec<Vec<Message>>,
}

#[derive(Debug, Clone)]
pub struct ScriptedLlm {
    state: Arc<Mutex<ScriptState>>,
    fallback: Reply,
    delay: Option<Duration>,
}

impl std::fmt::Debug for ScriptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptState")
            .field("queued", &self.replies.len())
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            fallback: Reply::FinalAnswer(DEFAULT_FALLBACK.to_string()),
            delay: None,
        }
    }
}

impl ScriptedLlm {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        let script = Self::default();
        for reply in replies {
            script.push(reply);
        }
        script
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Reply) {
        self.state().replies.push_back(Ok(reply));
    }

    pub fn push_error(&self, error: LlmError) {
        self.state().replies.push_back(Err(error));
    }

    pub fn push_tool_call(&self, name: &str, arguments: Value) {
        let id = format!("call_{}", self.state().replies.len() + 1);
        self.push(Reply::ToolCall(ToolCall {
            id,
            name: name.to_string(),
            arguments,
            reasoning: None,
        }));
    }

    pub fn push_answer(&self, text: &str) {
        self.push(Reply::FinalAnswer(text.to_string()));
    }

    pub fn remaining(&self) -> usize {
        self.state().replies.len()
    }

    /// Message histories received so far, one per call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.state().requests.clone()
    }

    pub async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<Completion, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut state = self.state();
            state.requests.push(messages.to_vec());
            state.replies.pop_front()
        };
        let reply = next.unwrap_or_else(|| Ok(self.fallback.clone()))?;

        // Rough estimate so cost accounting has something to add up
        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let usage = TokenUsage {
            prompt_tokens: (prompt_chars / 4) as u64,
            completion_tokens: 16,
        };
        Ok(Completion { reply, usage })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
