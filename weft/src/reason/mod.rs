//! The ReAct reasoning engine: a bounded think / act / observe / reflect loop
//! with confidence-driven termination.
//!
//! One [`ReasoningStep`] is produced per iteration, carrying everything the
//! iteration did: the thought, the selected action and its result, the
//! observation digest and the reflection. Step ids are strictly increasing
//! and a run records at most `max_iterations` steps plus one synthetic
//! completion step. Phases return values, never control-flow errors.
//!
//! Completion is gated on structural evidence: declaring victory — whether by
//! the LLM's wording or by reflection confidence — requires at least two real
//! tool invocations with at least one success. This stops the model from
//! talking itself into an early exit.

mod select;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use stream_event::ProtocolEvent;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::executor::{ActionExecutor, BUILTIN_ACTIONS};
use crate::llm::{LlmClient, Message};

pub use select::{select_action, SelectedAction};

/// Phrases that signal the model believes the goal is done. Matched
/// case-insensitively; evidence gating still applies.
const COMPLETION_PHRASES: &[&str] = &[
    "goal completely achieved",
    "task fully completed",
    "final answer provided",
    "objective successfully met",
    "all steps completed",
    "finished successfully",
];

/// Confidence-laden words → estimated confidence. Longer words with embedded
/// opposites ("uncertain" contains "certain") come first.
const CONFIDENCE_WORDS: &[(&str, f64)] = &[
    ("uncertain", 0.3),
    ("unclear", 0.2),
    ("confused", 0.1),
    ("certain", 0.9),
    ("confident", 0.8),
    ("sure", 0.8),
    ("likely", 0.7),
    ("probably", 0.6),
    ("maybe", 0.4),
];

const DEFAULT_CONFIDENCE: f64 = 0.4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPhase {
    Thinking,
    Acting,
    Observing,
    Reflecting,
    Completed,
    Failed,
}

impl ReasoningPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Acting => "acting",
            Self::Observing => "observing",
            Self::Reflecting => "reflecting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ReasoningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iteration of the loop; append-only. `phase` records where the
/// iteration ended: `reflecting` for a full cycle, `completed` / `failed`
/// for terminal steps.
#[derive(Clone, Debug, Serialize)]
pub struct ReasoningStep {
    pub step_id: u32,
    pub phase: ReasoningPhase,
    pub thought: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    pub execution_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    pub confidence: f64,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

impl ReasoningStep {
    fn new(step_id: u32, phase: ReasoningPhase, thought: impl Into<String>) -> Self {
        Self {
            step_id,
            phase,
            thought: thought.into(),
            action: None,
            action_params: None,
            tool_result: None,
            execution_success: false,
            execution_error: None,
            observation: None,
            reflection: None,
            confidence: 0.0,
            duration: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Sealed outcome of one run.
#[derive(Clone, Debug, Serialize)]
pub struct ReasoningResult {
    pub goal: String,
    pub success: bool,
    pub steps: Vec<ReasoningStep>,
    pub final_answer: String,
    pub total_duration: f64,
    pub iterations: u32,
    pub confidence: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    Mcp,
    Builtin,
}

/// One entry in the loop's view of what it can call.
#[derive(Clone, Debug)]
pub struct AvailableTool {
    pub name: String,
    pub description: String,
    pub server: Option<String>,
    pub kind: ToolKind,
}

impl AvailableTool {
    pub fn mcp(
        name: impl Into<String>,
        description: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            server: Some(server.into()),
            kind: ToolKind::Mcp,
        }
    }

    pub fn builtin(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            server: None,
            kind: ToolKind::Builtin,
        }
    }

    pub fn is_mcp(&self) -> bool {
        self.kind == ToolKind::Mcp
    }
}

/// Per-run inputs assembled by the agent.
#[derive(Clone, Debug, Default)]
pub struct ReasoningContext {
    pub available_tools: Vec<AvailableTool>,
    /// Recent (user, agent) exchanges, newest last; at most a handful.
    pub recent_conversation: Vec<(String, String)>,
    pub original_message: String,
    pub extra: Option<Value>,
}

#[derive(Clone, Copy, Debug)]
pub struct EngineSettings {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.8,
        }
    }
}

struct ThoughtOutcome {
    thought: String,
    confidence: f64,
    claims_done: bool,
}

pub struct ReasoningEngine {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ActionExecutor>,
    settings: EngineSettings,
}

impl ReasoningEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ActionExecutor>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            llm,
            executor,
            settings,
        }
    }

    /// Drives the loop to completion. Never fails: errors inside phases
    /// become failed observations; running out of iterations yields
    /// `success=false` with a best-effort answer.
    pub async fn run(
        &self,
        goal: &str,
        ctx: &ReasoningContext,
        events: Option<&mpsc::Sender<ProtocolEvent>>,
    ) -> ReasoningResult {
        info!(goal = %truncate(goal, 100), "starting reasoning loop");
        let run_start = Instant::now();

        let mcp_tools: HashMap<String, String> = ctx
            .available_tools
            .iter()
            .filter(|t| t.is_mcp())
            .map(|t| (t.name.clone(), t.server.clone().unwrap_or_default()))
            .collect();

        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut iteration: u32 = 0;
        let mut action_count: usize = 0;
        let mut real_tool_steps: usize = 0;
        let mut real_tool_successes: usize = 0;
        let mut last_observation = String::new();
        let mut completed = false;

        while iteration < self.settings.max_iterations && !completed {
            iteration += 1;
            let step_start = Instant::now();
            let mut step = ReasoningStep::new(iteration, ReasoningPhase::Thinking, String::new());

            // THINKING
            emit(
                events,
                ProtocolEvent::PhaseEnter {
                    phase: ReasoningPhase::Thinking.to_string(),
                    step_id: iteration,
                },
            )
            .await;
            let thought = self
                .thinking_phase(goal, ctx, action_count, &last_observation)
                .await;
            step.thought = thought.thought;
            step.confidence = thought.confidence;
            emit(
                events,
                ProtocolEvent::Thought {
                    step_id: iteration,
                    content: step.thought.clone(),
                    confidence: step.confidence,
                },
            )
            .await;
            if thought.claims_done
                && has_completion_evidence(real_tool_steps, real_tool_successes)
            {
                step.phase = ReasoningPhase::Completed;
                step.duration = step_start.elapsed().as_secs_f64();
                steps.push(step);
                completed = true;
                break;
            }

            // ACTING
            step.phase = ReasoningPhase::Acting;
            emit(
                events,
                ProtocolEvent::PhaseEnter {
                    phase: ReasoningPhase::Acting.to_string(),
                    step_id: iteration,
                },
            )
            .await;
            let selected = select_action(goal, action_count, &ctx.available_tools);
            debug!(action = %selected.name, "selected action");
            emit(
                events,
                ProtocolEvent::Action {
                    step_id: iteration,
                    name: selected.name.clone(),
                    params: selected.params.clone(),
                },
            )
            .await;
            let result = self
                .executor
                .execute(&selected.name, selected.params.clone())
                .await;
            step.action = Some(selected.name.clone());
            step.action_params = Some(selected.params);
            step.tool_result = result.result.as_ref().map(render_result);
            step.execution_success = result.success;
            step.execution_error = result.error_message.clone();
            emit(
                events,
                ProtocolEvent::ToolResult {
                    step_id: iteration,
                    name: selected.name.clone(),
                    success: result.success,
                    summary: truncate(step.tool_result.as_deref().unwrap_or(""), 120),
                },
            )
            .await;
            action_count += 1;
            if mcp_tools.contains_key(&selected.name) {
                real_tool_steps += 1;
                if result.success {
                    real_tool_successes += 1;
                }
            }

            // OBSERVING
            step.phase = ReasoningPhase::Observing;
            emit(
                events,
                ProtocolEvent::PhaseEnter {
                    phase: ReasoningPhase::Observing.to_string(),
                    step_id: iteration,
                },
            )
            .await;
            let observation = observe_action(&step);
            emit(
                events,
                ProtocolEvent::Observation {
                    step_id: iteration,
                    content: observation.clone(),
                },
            )
            .await;
            last_observation = observation.clone();
            step.observation = Some(observation);

            // REFLECTING
            step.phase = ReasoningPhase::Reflecting;
            emit(
                events,
                ProtocolEvent::PhaseEnter {
                    phase: ReasoningPhase::Reflecting.to_string(),
                    step_id: iteration,
                },
            )
            .await;
            let (reflection, reflect_confidence) = reflect_on_progress(
                action_count,
                real_tool_steps,
                real_tool_successes,
                &last_observation,
            );
            emit(
                events,
                ProtocolEvent::Reflection {
                    step_id: iteration,
                    content: reflection.clone(),
                    confidence: reflect_confidence,
                },
            )
            .await;
            step.reflection = Some(reflection);
            step.confidence = reflect_confidence;
            step.duration = step_start.elapsed().as_secs_f64();
            steps.push(step);

            if reflect_confidence >= self.settings.confidence_threshold
                && has_completion_evidence(real_tool_steps, real_tool_successes)
            {
                // The optional synthetic completion step (the "+1").
                let mut done = ReasoningStep::new(
                    iteration + 1,
                    ReasoningPhase::Completed,
                    "Goal achieved with sufficient confidence",
                );
                done.confidence = reflect_confidence;
                steps.push(done);
                completed = true;
            }
        }

        let total_duration = run_start.elapsed().as_secs_f64();
        let success = steps
            .last()
            .map(|s| s.phase == ReasoningPhase::Completed)
            .unwrap_or(false);
        let confidence = steps.last().map(|s| s.confidence).unwrap_or(0.0);
        let final_answer = extract_final_answer(&steps, goal);

        info!(
            success,
            iterations = iteration,
            steps = steps.len(),
            duration = total_duration,
            "reasoning loop finished"
        );

        ReasoningResult {
            goal: goal.to_string(),
            success,
            steps,
            final_answer,
            total_duration,
            iterations: iteration,
            confidence,
        }
    }

    async fn thinking_phase(
        &self,
        goal: &str,
        ctx: &ReasoningContext,
        action_count: usize,
        last_observation: &str,
    ) -> ThoughtOutcome {
        let prompt = thinking_prompt(goal, ctx, action_count, last_observation);
        match self.llm.complete(&[Message::user(prompt)]).await {
            Ok(thought) => ThoughtOutcome {
                claims_done: detects_completion(&thought),
                confidence: estimate_confidence(&thought),
                thought,
            },
            Err(e) => {
                debug!("thinking phase failed: {}", e);
                ThoughtOutcome {
                    thought: format!("Thinking failed: {}", e),
                    confidence: 0.0,
                    claims_done: false,
                }
            }
        }
    }
}

/// Digest of the action result that the next THINKING sees.
fn observe_action(step: &ReasoningStep) -> String {
    match (&step.action, step.execution_success) {
        (Some(name), true) => {
            let mut text = format!("Action '{}' executed successfully. ", name);
            text.push_str(&summarise_result(step.tool_result.as_deref()));
            text
        }
        (Some(name), false) => match &step.execution_error {
            Some(error) => format!("Action '{}' failed: {}", name, error),
            None => format!("Action '{}' produced no usable result", name),
        },
        (None, _) => "No action was taken to observe.".to_string(),
    }
}

fn reflect_on_progress(
    action_count: usize,
    real_tool_steps: usize,
    real_tool_successes: usize,
    last_observation: &str,
) -> (String, f64) {
    if last_observation.is_empty() {
        return ("No observation to reflect upon.".to_string(), 0.1);
    }
    let goal_achieved = action_count >= 3
        && real_tool_successes >= 2
        && real_tool_steps >= 2;
    let confidence = if goal_achieved { 0.9 } else { 0.4 };
    let reflection = format!(
        "Reflecting on observation: {} Goal achievement confidence: {:.1}",
        truncate(last_observation, 100),
        confidence
    );
    (reflection, confidence)
}

fn thinking_prompt(
    goal: &str,
    ctx: &ReasoningContext,
    action_count: usize,
    last_observation: &str,
) -> String {
    let mut tools_info = String::new();
    if !ctx.available_tools.is_empty() {
        tools_info = format!("\nAvailable Tools ({}):\n", ctx.available_tools.len());
        for tool in &ctx.available_tools {
            let origin = tool.server.as_deref().unwrap_or("builtin");
            tools_info.push_str(&format!(
                "  • {}: {} (from {})\n",
                tool.name, tool.description, origin
            ));
        }
    }

    let mut extra_info = String::new();
    if let Some(extra) = &ctx.extra {
        extra_info = format!("\nAdditional context: {}\n", extra);
    }

    let mut history = String::new();
    if !ctx.recent_conversation.is_empty() {
        history.push_str("\nRecent conversation:\n");
        for (user, agent) in ctx.recent_conversation.iter().take(5) {
            history.push_str(&format!(
                "  user: {}\n  agent: {}\n",
                truncate(user, 80),
                truncate(agent, 80)
            ));
        }
    }

    let actions: Vec<&str> = BUILTIN_ACTIONS
        .iter()
        .copied()
        .chain(
            ctx.available_tools
                .iter()
                .filter(|t| t.is_mcp())
                .map(|t| t.name.as_str()),
        )
        .collect();

    format!(
        "You are in the THINKING phase of a ReAct reasoning loop. Your goal is: {goal}\n\
         \n\
         Steps taken so far: {action_count}\n\
         Last observation: {last_observation}\n\
         {tools_info}{extra_info}{history}\
         Available actions: {actions}\n\
         \n\
         Analyze the current situation and determine:\n\
         1. What progress has been made toward the goal?\n\
         2. What is the next logical action to take?\n\
         3. Is the goal already achieved?\n\
         \n\
         If the user is asking about tools or capabilities, refer to the actual \
         available tools listed above.\n\
         \n\
         Respond with your analysis and reasoning.",
        actions = actions.join(", "),
    )
}

fn detects_completion(thought: &str) -> bool {
    let lower = thought.to_lowercase();
    COMPLETION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Invariant: success needs at least two real tool invocations and one
/// success among them.
fn has_completion_evidence(real_tool_steps: usize, real_tool_successes: usize) -> bool {
    real_tool_steps >= 2 && real_tool_successes >= 1
}

fn estimate_confidence(thought: &str) -> f64 {
    let lower = thought.to_lowercase();
    for (word, confidence) in CONFIDENCE_WORDS {
        if lower.contains(word) {
            return *confidence;
        }
    }
    DEFAULT_CONFIDENCE
}

fn extract_final_answer(steps: &[ReasoningStep], goal: &str) -> String {
    for step in steps.iter().rev() {
        if step.phase == ReasoningPhase::Completed && !step.thought.is_empty() {
            return step.thought.clone();
        }
        if let Some(observation) = &step.observation {
            return format!("Based on reasoning: {}", observation);
        }
        if let Some(reflection) = &step.reflection {
            return format!("Final reflection: {}", reflection);
        }
    }
    format!("Completed analysis of: {}", goal)
}

/// Renders an action result value as the step's tool_result string.
fn render_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Short digest of a result for the observation text.
fn summarise_result(result: Option<&str>) -> String {
    match result {
        Some(text) => {
            // JSON object results: prefer a content/output field.
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                match &value {
                    Value::Object(map) => {
                        if let Some(content) = map.get("content").or_else(|| map.get("output")) {
                            let text = content
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| content.to_string());
                            return format!("Result: {}...", truncate(&text, 200));
                        }
                        return format!("Data returned: {} characters", text.len());
                    }
                    Value::Array(items) => return format!("Returned {} items", items.len()),
                    _ => {}
                }
            }
            format!("Result: {}...", truncate(text, 200))
        }
        None => "No result payload".to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

async fn emit(events: Option<&mpsc::Sender<ProtocolEvent>>, event: ProtocolEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}
