//! The top-level agent: `run`, `run_stream`, `status`, `shutdown`.
//!
//! The agent is the composition root. It owns the LLM client, the optional
//! MCP manager, the context builder, the reasoning engine and the bounded
//! conversation memory, and wires the needed capabilities downward — no
//! component holds a reference back up.
//!
//! Tool-listing questions ("list tools", "what can you do") bypass the
//! reasoning loop entirely and answer from the cached catalogue.

mod memory;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use stream_event::ProtocolEvent;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::cache::ServerState;
use crate::config::{AgentSettings, TransportKind};
use crate::context::ContextBuilder;
use crate::executor::{ActionExecutor, BUILTIN_ACTIONS};
use crate::llm::LlmClient;
use crate::manager::McpManager;
use crate::reason::{
    AvailableTool, EngineSettings, ReasoningContext, ReasoningEngine, ReasoningResult,
};

pub use memory::{ConversationMemory, ConversationTurn};

static TOOL_QUERY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"list.*tools?",
        r"what tools?",
        r"show.*tools?",
        r"available.*tools?",
        r"mcp.*tools?",
        r"capabilities?",
        r"what.*can.*do",
        r"tools.*have",
        r"functions.*have",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("tool query pattern"))
    .collect()
});

/// Shape of one finished run.
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub answer: String,
    pub reasoning: ReasoningSummary,
    pub tools_used: Vec<String>,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReasoningSummary {
    pub iterations: u32,
    pub confidence: f64,
    pub steps: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerReport {
    pub name: String,
    pub transport: TransportKind,
    pub state: ServerState,
    pub tools_count: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusReport {
    pub servers: Vec<ServerReport>,
    pub tools_count: usize,
    pub cache_age_secs: Option<f64>,
}

pub struct Agent {
    manager: Option<Arc<McpManager>>,
    context_builder: Option<ContextBuilder>,
    engine: ReasoningEngine,
    memory: StdMutex<ConversationMemory>,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        manager: Option<Arc<McpManager>>,
        settings: AgentSettings,
    ) -> Self {
        let executor = Arc::new(ActionExecutor::new(manager.clone(), Arc::clone(&llm)));
        let engine = ReasoningEngine::new(
            Arc::clone(&llm),
            executor,
            EngineSettings {
                max_iterations: settings.max_iterations,
                confidence_threshold: settings.confidence_threshold,
            },
        );
        let context_builder = manager
            .as_ref()
            .map(|m| ContextBuilder::new(Arc::clone(m.cache())));
        let memory = StdMutex::new(ConversationMemory::new(settings.memory_max_context_turns));
        Self {
            manager,
            context_builder,
            engine,
            memory,
        }
    }

    /// One full run: short-circuit for tool queries, otherwise the reasoning
    /// loop. Sub-component failures surface in the envelope, never silently.
    pub async fn run(&self, message: &str) -> RunOutcome {
        self.run_inner(message, None).await
    }

    /// Like [`Agent::run`] with caller-supplied extra context made visible to
    /// the reasoning loop.
    pub async fn run_with_context(
        &self,
        message: &str,
        extra: serde_json::Value,
    ) -> RunOutcome {
        self.run_inner(message, Some(extra)).await
    }

    /// Streaming variant: emits progress events at phase boundaries and
    /// character-streams the final answer.
    pub fn run_stream(self: &Arc<Self>, message: &str) -> ReceiverStream<ProtocolEvent> {
        let (tx, rx) = mpsc::channel(64);
        let agent = Arc::clone(self);
        let message = message.to_string();
        tokio::spawn(async move {
            agent.run_streaming(&message, tx).await;
        });
        ReceiverStream::new(rx)
    }

    pub fn status(&self) -> StatusReport {
        let Some(manager) = &self.manager else {
            return StatusReport::default();
        };
        let cache = manager.cache();
        let mut servers: Vec<ServerReport> = cache
            .all_server_status()
            .into_values()
            .map(|s| ServerReport {
                name: s.name,
                transport: s.transport,
                state: s.state,
                tools_count: s.tools_count,
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        StatusReport {
            servers,
            tools_count: cache.all_tool_names().len(),
            cache_age_secs: cache.cache_age_secs(),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(manager) = &self.manager {
            manager.shutdown().await;
        }
    }

    async fn run_inner(&self, message: &str, extra: Option<serde_json::Value>) -> RunOutcome {
        let started = Instant::now();

        if self.is_tool_query(message) {
            info!("tool query detected; answering from catalogue");
            let answer = self.tool_catalogue();
            self.remember(message, &answer, started.elapsed().as_secs_f64());
            return RunOutcome {
                success: true,
                answer,
                reasoning: ReasoningSummary {
                    iterations: 1,
                    confidence: 1.0,
                    steps: 1,
                },
                tools_used: Vec::new(),
                execution_time: started.elapsed().as_secs_f64(),
                error: None,
            };
        }

        let ctx = self.reasoning_context(message, extra);
        let result = self.engine.run(message, &ctx, None).await;
        self.outcome_from(message, started, &ctx, result)
    }

    async fn run_streaming(&self, message: &str, tx: mpsc::Sender<ProtocolEvent>) {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let _ = tx
            .send(ProtocolEvent::RunStarted {
                run_id,
                goal: message.chars().take(200).collect(),
            })
            .await;

        if self.is_tool_query(message) {
            let answer = self.tool_catalogue();
            let _ = tx
                .send(ProtocolEvent::ToolCatalogue {
                    content: answer.clone(),
                })
                .await;
            self.remember(message, &answer, started.elapsed().as_secs_f64());
            let _ = tx
                .send(ProtocolEvent::RunCompleted {
                    success: true,
                    iterations: 1,
                    confidence: 1.0,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
                .await;
            return;
        }

        let ctx = self.reasoning_context(message, None);
        let result = self.engine.run(message, &ctx, Some(&tx)).await;
        let outcome = self.outcome_from(message, started, &ctx, result);

        for chunk in chunk_text(&outcome.answer, 24) {
            let _ = tx.send(ProtocolEvent::AnswerChunk { content: chunk }).await;
        }
        let _ = tx
            .send(ProtocolEvent::RunCompleted {
                success: outcome.success,
                iterations: outcome.reasoning.iterations,
                confidence: outcome.reasoning.confidence,
                duration_ms: (outcome.execution_time * 1000.0) as u64,
            })
            .await;
    }

    fn outcome_from(
        &self,
        message: &str,
        started: Instant,
        ctx: &ReasoningContext,
        result: ReasoningResult,
    ) -> RunOutcome {
        let answer = if result.final_answer.is_empty() {
            "Task completed".to_string()
        } else {
            result.final_answer.clone()
        };
        self.remember(message, &answer, started.elapsed().as_secs_f64());

        let mcp_names: Vec<&str> = ctx
            .available_tools
            .iter()
            .filter(|t| t.is_mcp())
            .map(|t| t.name.as_str())
            .collect();
        let mut tools_used: Vec<String> = Vec::new();
        for step in &result.steps {
            if let Some(action) = &step.action {
                if mcp_names.contains(&action.as_str()) && !tools_used.contains(action) {
                    tools_used.push(action.clone());
                }
            }
        }

        RunOutcome {
            success: result.success,
            answer,
            reasoning: ReasoningSummary {
                iterations: result.iterations,
                confidence: result.confidence,
                steps: result.steps.len(),
            },
            tools_used,
            execution_time: started.elapsed().as_secs_f64(),
            error: None,
        }
    }

    fn is_tool_query(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        TOOL_QUERY_PATTERNS.iter().any(|p| p.is_match(&lower))
    }

    fn tool_catalogue(&self) -> String {
        if let Some(builder) = &self.context_builder {
            let ctx = builder.build(None);
            if !ctx.available_tools.is_empty() {
                return format!(
                    "Here are the tools currently available:\n\n{}",
                    ctx.context_text
                );
            }
        }
        format!(
            "No MCP tools are currently available. Built-in reasoning actions: {}",
            BUILTIN_ACTIONS.join(", ")
        )
    }

    /// Real MCP tools first, then the built-in fallback when nothing else
    /// exists. Recent conversation is capped at five turns.
    fn reasoning_context(
        &self,
        message: &str,
        extra: Option<serde_json::Value>,
    ) -> ReasoningContext {
        let mut tools: Vec<AvailableTool> = Vec::new();
        if let Some(manager) = &self.manager {
            for (server, list) in manager.cache().all_cached_tools() {
                for tool in list {
                    tools.push(AvailableTool::mcp(tool.name, tool.description, server.clone()));
                }
            }
        }
        if tools.is_empty() {
            for name in BUILTIN_ACTIONS {
                tools.push(AvailableTool::builtin(
                    *name,
                    format!("Built-in reasoning action: {}", name.replace('_', " ")),
                ));
            }
        }

        let recent_conversation = self
            .memory
            .lock()
            .map(|m| {
                m.recent(5)
                    .into_iter()
                    .map(|t| (t.user_input, t.agent_response))
                    .collect()
            })
            .unwrap_or_default();

        ReasoningContext {
            available_tools: tools,
            recent_conversation,
            original_message: message.to_string(),
            extra,
        }
    }

    fn remember(&self, user: &str, agent: &str, execution_time: f64) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.add_exchange(user, agent, execution_time);
        }
    }

    /// Turns recorded so far (diagnostics and tests).
    pub fn conversation_len(&self) -> usize {
        self.memory.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}
