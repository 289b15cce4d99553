//! Scripted in-process transport.
//!
//! Serves a fixed tool list, returns queued results per tool (falling back to
//! a default), and records every call so tests can assert on what reached the
//! target.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ConnectionState, ToolCapability, ToolTransport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub tool: String,
    pub arguments: Value,
}

#[derive(Default)]
struct Script {
    results: HashMap<String, VecDeque<Result<Value, TransportError>>>,
    list_failures: VecDeque<TransportError>,
    calls: Vec<RecordedCall>,
}

pub struct MockTransport {
    tools: Vec<ToolCapability>,
    default_result: Value,
    script: Mutex<Script>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            default_result: json!({"ok": true}),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn with_tool(mut self, name: &str, description: &str, requires_confirmation: bool) -> Self {
        self.tools.push(ToolCapability {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object"}),
            requires_confirmation,
        });
        self
    }

    pub fn with_default_result(mut self, result: Value) -> Self {
        self.default_result = result;
        self
    }

    /// Queue the next result for `tool`.
    pub fn push_result(&self, tool: &str, result: Result<Value, TransportError>) {
        self.script()
            .results
            .entry(tool.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make the next `tools/list` fail.
    pub fn fail_capabilities(&self, error: TransportError) {
        self.script().list_failures.push_back(error);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script().calls.len()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ToolTransport for MockTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        match method {
            "tools/list" => {
                if let Some(err) = self.script().list_failures.pop_front() {
                    return Err(err);
                }
                Ok(json!({"tools": self.tools}))
            }
            "tools/call" => {
                let tool = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::Protocol("tools/call without name".into()))?
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

                let mut script = self.script();
                script.calls.push(RecordedCall {
                    tool: tool.clone(),
                    arguments,
                });
                script
                    .results
                    .get_mut(&tool)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| Ok(self.default_result.clone()))
            }
            other => Err(TransportError::Remote {
                code: -32601,
                message: format!("method not found: {}", other),
            }),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_results_then_default() {
        let mock = MockTransport::new().with_tool("read_file", "Read a file", false);
        mock.push_result("read_file", Err(TransportError::ConnectionLost));
        mock.push_result("read_file", Ok(json!({"content": "hello"})));

        let args = json!({"path": "/tmp/x"});
        assert_eq!(
            mock.invoke_tool("read_file", args.clone()).await,
            Err(TransportError::ConnectionLost)
        );
        assert_eq!(
            mock.invoke_tool("read_file", args.clone()).await.unwrap()["content"],
            "hello"
        );
        assert_eq!(mock.invoke_tool("read_file", args.clone()).await.unwrap()["ok"], true);

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].arguments, args);
    }

    #[tokio::test]
    async fn test_capabilities_listing() {
        let mock = MockTransport::new()
            .with_tool("read_file", "", false)
            .with_tool("delete_file", "", true);
        mock.fail_capabilities(TransportError::Timeout(std::time::Duration::from_secs(1)));

        assert!(mock.capabilities().await.is_err());
        let caps = mock.capabilities().await.unwrap();
        assert_eq!(caps.len(), 2);
        assert!(caps[1].requires_confirmation);
        assert_eq!(mock.call_count(), 0);
    }
}
