//! # Weft
//!
//! An autonomous agent runtime that couples a bounded **ReAct reasoning loop**
//! to a pool of **MCP (Model Context Protocol) tool servers**. Weft takes a
//! natural-language goal, repeatedly asks an LLM what to do next, dispatches
//! the chosen action to an MCP server (or a built-in reasoning action),
//! observes the result, and decides whether the goal is satisfied.
//!
//! ## Design principles
//!
//! - **Explicit composition**: there are no singletons. The [`Agent`] is the
//!   composition root; every sub-component receives the capabilities it needs
//!   (an [`LlmClient`], an [`McpManager`], a [`ToolCache`]) at construction.
//! - **Phases return values, not exceptions**: each loop phase produces a
//!   [`ReasoningStep`]; failures inside a step become observable strings the
//!   reasoner can react to, never silent fallbacks.
//! - **Warm connections**: a per-server [`ConnectionPool`] keeps transports
//!   alive with idle eviction and periodic health probing.
//! - **Tool knowledge is cached**: per-server manifests and per-tool
//!   performance metrics live in the [`ToolCache`], optionally persisted as an
//!   atomic JSON snapshot, and are projected into a compact prompt context by
//!   the [`ContextBuilder`].
//!
//! ## Main modules
//!
//! - [`transport`]: MCP wire adapters — stdio subprocess, streamable HTTP and
//!   SSE — behind one [`TransportConn`] trait, plus the JSON-RPC framing.
//! - [`pool`]: [`ConnectionPool`] with acquisition, reuse, idle cleanup and
//!   health checks; the [`Connector`] trait is the seam for tests.
//! - [`cache`]: [`ToolCache`], [`ToolInfo`], [`PerformanceMetrics`],
//!   [`ServerStatus`]; optional on-disk snapshot.
//! - [`manager`]: [`McpManager`] — discovery, tool-name routing, timed and
//!   metricised tool invocation.
//! - [`context`]: [`ContextBuilder`] — capability tags, recommendations and
//!   prompt-ready catalogue text.
//! - [`reason`]: [`ReasoningEngine`] — the think / act / observe / reflect
//!   loop with confidence-driven termination.
//! - [`executor`]: [`ActionExecutor`] — routes actions to MCP tools or
//!   built-in LLM-backed reasoning actions.
//! - [`agent`]: [`Agent`] — top-level `run` / `run_stream` / `status` API,
//!   tool-query short-circuit, conversation memory.
//! - [`llm`]: [`LlmClient`] trait with [`MockLlm`] and OpenAI-compatible
//!   [`ChatOpenAI`].
//! - [`config`]: the frozen [`WeftConfig`] handed to the runtime at startup.

pub mod agent;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod llm;
pub mod manager;
pub mod pool;
pub mod reason;
pub mod transport;

pub use agent::{Agent, ReasoningSummary, RunOutcome, ServerReport, StatusReport};
pub use cache::{PerformanceMetrics, ServerState, ServerStatus, ToolCache, ToolInfo};
pub use config::{
    AgentSettings, CacheSettings, ConfigError, LlmSettings, PoolSettings, ServerSpec,
    TransportKind, WeftConfig,
};
pub use context::{AgentToolContext, ContextBuilder, Recommendations, ToolCapability};
pub use error::AgentError;
pub use executor::{ActionExecutor, ActionResult};
pub use llm::{ChatOpenAI, LlmClient, LlmError, Message, MockLlm};
pub use manager::{ManagerError, McpManager};
pub use pool::{ConnectionPool, Connector, PoolError, PoolHandle, TransportConnector};
pub use reason::{
    AvailableTool, ReasoningContext, ReasoningEngine, ReasoningPhase, ReasoningResult,
    ReasoningStep, ToolKind,
};
pub use transport::{ToolDescriptor, TransportConn, TransportError};
