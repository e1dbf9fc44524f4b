//! Action executor: the single entry point that turns a selected action into
//! a result.
//!
//! Known MCP tool names route through the manager (real tool call). A fixed
//! set of built-in reasoning actions is synthesised from the LLM with an
//! action-specific sub-prompt. Anything else still goes to the manager, whose
//! "not found" reply becomes an observable failure the reasoner can recover
//! from.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::llm::{LlmClient, Message};
use crate::manager::McpManager;

/// Built-in reasoning actions resolved by the LLM instead of an MCP server.
pub const BUILTIN_ACTIONS: &[&str] = &[
    "search_information",
    "analyze_data",
    "create_content",
    "request_clarification",
    "synthesize_results",
    "validate_answer",
];

pub fn is_builtin_action(name: &str) -> bool {
    BUILTIN_ACTIONS.contains(&name)
}

/// How an action was dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Resolved to a real MCP tool.
    McpTool,
    /// One of the built-in reasoning actions.
    Builtin,
    /// Looked like a tool but no server owns it.
    Unknown,
}

#[derive(Clone, Debug)]
pub struct ActionResult {
    pub action_name: String,
    pub parameters: Value,
    pub result: Option<Value>,
    pub success: bool,
    pub execution_time: f64,
    pub error_message: Option<String>,
    pub kind: ActionKind,
}

pub struct ActionExecutor {
    manager: Option<Arc<McpManager>>,
    llm: Arc<dyn LlmClient>,
}

impl ActionExecutor {
    pub fn new(manager: Option<Arc<McpManager>>, llm: Arc<dyn LlmClient>) -> Self {
        Self { manager, llm }
    }

    pub async fn execute(&self, action: &str, params: Value) -> ActionResult {
        let started = Instant::now();
        debug!(action, "executing action");

        if is_builtin_action(action) {
            return self.execute_builtin(action, params, started).await;
        }
        if let Some(manager) = &self.manager {
            let known = manager.knows_tool(action);
            return self.execute_via_manager(manager, action, params, started, known).await;
        }
        // No manager wired: treat anything unrecognised as a generic
        // reasoning action so the loop can still make progress.
        self.execute_builtin(action, params, started).await
    }

    async fn execute_via_manager(
        &self,
        manager: &Arc<McpManager>,
        action: &str,
        params: Value,
        started: Instant,
        known: bool,
    ) -> ActionResult {
        let kind = if known {
            ActionKind::McpTool
        } else {
            ActionKind::Unknown
        };
        match manager.call_tool(action, params.clone()).await {
            Ok(payload) => {
                let result = Value::String(payload);
                if known {
                    let success = validate_result(action, &result);
                    ActionResult {
                        action_name: action.to_string(),
                        parameters: params,
                        result: Some(result),
                        success,
                        execution_time: started.elapsed().as_secs_f64(),
                        error_message: None,
                        kind,
                    }
                } else {
                    // The manager's "not found" reply: observable, not a success.
                    let message = result.as_str().unwrap_or_default().to_string();
                    ActionResult {
                        action_name: action.to_string(),
                        parameters: params,
                        result: Some(result),
                        success: false,
                        execution_time: started.elapsed().as_secs_f64(),
                        error_message: Some(message),
                        kind,
                    }
                }
            }
            Err(e) => {
                warn!(action, "tool execution failed: {}", e);
                ActionResult {
                    action_name: action.to_string(),
                    parameters: params,
                    result: None,
                    success: false,
                    execution_time: started.elapsed().as_secs_f64(),
                    error_message: Some(e.to_string()),
                    kind,
                }
            }
        }
    }

    async fn execute_builtin(&self, action: &str, params: Value, started: Instant) -> ActionResult {
        let outcome = match action {
            "search_information" => self.search_action(&params).await,
            "analyze_data" => self.analyze_action(&params).await,
            "create_content" => self.create_action(&params).await,
            _ => self.generic_action(action, &params).await,
        };
        match outcome {
            Ok(result) => {
                let success = validate_result(action, &result);
                ActionResult {
                    action_name: action.to_string(),
                    parameters: params,
                    result: Some(result),
                    success,
                    execution_time: started.elapsed().as_secs_f64(),
                    error_message: None,
                    kind: ActionKind::Builtin,
                }
            }
            Err(message) => ActionResult {
                action_name: action.to_string(),
                parameters: params,
                result: None,
                success: false,
                execution_time: started.elapsed().as_secs_f64(),
                error_message: Some(message),
                kind: ActionKind::Builtin,
            },
        }
    }

    async fn search_action(&self, params: &Value) -> Result<Value, String> {
        let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
        let prompt = format!(
            "Search your knowledge and summarise information about the following query: {}",
            query
        );
        let content = self.ask(&prompt).await?;
        Ok(json!({
            "query": query,
            "results": content,
            "source": "llm_search"
        }))
    }

    async fn analyze_action(&self, params: &Value) -> Result<Value, String> {
        let data = params.get("data").and_then(|v| v.as_str()).unwrap_or("");
        let focus = params
            .get("focus")
            .and_then(|v| v.as_str())
            .unwrap_or("general");
        let prompt = format!(
            "Analyse the following data with a focus on: {}\n\nData: {}",
            focus, data
        );
        let content = self.ask(&prompt).await?;
        Ok(json!({
            "analysis": content,
            "focus": focus,
            "confidence": "medium"
        }))
    }

    async fn create_action(&self, params: &Value) -> Result<Value, String> {
        let content_type = params.get("type").and_then(|v| v.as_str()).unwrap_or("text");
        let specification = params
            .get("specification")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let prompt = format!(
            "Create content of type '{}' following this specification: {}",
            content_type, specification
        );
        let content = self.ask(&prompt).await?;
        Ok(json!({
            "content": content,
            "type": content_type,
            "specification": specification
        }))
    }

    async fn generic_action(&self, action: &str, params: &Value) -> Result<Value, String> {
        let prompt = format!(
            "Perform the following action: {}\nParameters: {}",
            action, params
        );
        let content = self.ask(&prompt).await?;
        Ok(Value::String(content))
    }

    async fn ask(&self, prompt: &str) -> Result<String, String> {
        self.llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(|e| e.to_string())
    }
}

/// Simple post-conditions: non-nil, not an error object, not blank text.
fn validate_result(action: &str, result: &Value) -> bool {
    match result {
        Value::Null => {
            warn!(action, "action returned null result");
            false
        }
        Value::Object(map) if map.get("error").is_some() => {
            warn!(action, "action returned error payload");
            false
        }
        Value::String(s) if s.trim().is_empty() => {
            warn!(action, "action returned empty string");
            false
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolCache;
    use crate::config::{CacheSettings, PoolSettings, ServerSpec};
    use crate::llm::MockLlm;
    use crate::pool::{ConnectionPool, Connector};
    use crate::transport::{ToolDescriptor, TransportConn, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct OneToolConn;

    #[async_trait]
    impl TransportConn for OneToolConn {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
            Ok(vec![ToolDescriptor {
                name: "google_search".into(),
                description: Some("web search".into()),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, _name: &str, _args: Value) -> Result<String, TransportError> {
            Ok("top-5 results: A,B,C,D,E".into())
        }

        async fn close(&self) {}
    }

    struct OneToolConnector;

    #[async_trait]
    impl Connector for OneToolConnector {
        async fn connect(
            &self,
            _spec: &ServerSpec,
        ) -> Result<Arc<dyn TransportConn>, TransportError> {
            Ok(Arc::new(OneToolConn))
        }
    }

    async fn manager() -> Arc<McpManager> {
        let pool = ConnectionPool::new(PoolSettings::default(), Arc::new(OneToolConnector));
        let cache = ToolCache::new(CacheSettings::default());
        let manager = Arc::new(McpManager::new(
            vec![ServerSpec::stdio("web", "fake", vec![])],
            pool,
            cache,
            Duration::from_secs(5),
        ));
        manager.initialize_with_caching().await;
        manager
    }

    #[tokio::test]
    async fn known_tool_routes_through_manager() {
        let llm = Arc::new(MockLlm::always("unused"));
        let executor = ActionExecutor::new(Some(manager().await), llm);
        let result = executor
            .execute("google_search", json!({"query": "news"}))
            .await;
        assert_eq!(result.kind, ActionKind::McpTool);
        assert!(result.success);
        assert!(result
            .result
            .unwrap()
            .as_str()
            .unwrap()
            .contains("top-5 results"));
    }

    /// **Scenario**: an unrecognised tool-like action surfaces the manager's
    /// "not found" reply as an observable failure.
    #[tokio::test]
    async fn unknown_tool_is_observable_failure() {
        let llm = Arc::new(MockLlm::always("unused"));
        let executor = ActionExecutor::new(Some(manager().await), llm);
        let result = executor.execute("nonexistent_tool", json!({})).await;
        assert_eq!(result.kind, ActionKind::Unknown);
        assert!(!result.success);
        let message = result.error_message.unwrap();
        assert!(message.contains("Tool 'nonexistent_tool' not found"));
        assert!(message.contains("google_search"));
    }

    #[tokio::test]
    async fn builtin_search_wraps_llm_answer() {
        let llm = Arc::new(MockLlm::always("summarised knowledge"));
        let executor = ActionExecutor::new(None, llm);
        let result = executor
            .execute("search_information", json!({"query": "rust"}))
            .await;
        assert_eq!(result.kind, ActionKind::Builtin);
        assert!(result.success);
        let payload = result.result.unwrap();
        assert_eq!(payload["query"], "rust");
        assert_eq!(payload["results"], "summarised knowledge");
        assert_eq!(payload["source"], "llm_search");
    }

    #[tokio::test]
    async fn builtin_generic_action_returns_plain_text() {
        let llm = Arc::new(MockLlm::always("validated"));
        let executor = ActionExecutor::new(None, llm);
        let result = executor
            .execute("validate_answer", json!({"criteria": "completeness"}))
            .await;
        assert!(result.success);
        assert_eq!(result.result.unwrap(), Value::String("validated".into()));
    }

    #[tokio::test]
    async fn llm_failure_yields_failed_action_result() {
        let llm = Arc::new(MockLlm::new(vec![]));
        let executor = ActionExecutor::new(None, llm);
        let result = executor.execute("analyze_data", json!({})).await;
        assert!(!result.success);
        assert!(result.error_message.is_some());
    }

    #[test]
    fn validate_result_post_conditions() {
        assert!(!validate_result("a", &Value::Null));
        assert!(!validate_result("a", &json!({"error": "boom"})));
        assert!(!validate_result("a", &Value::String("   ".into())));
        assert!(validate_result("a", &Value::String("ok".into())));
        assert!(validate_result("a", &json!({"results": "data"})));
    }
}
