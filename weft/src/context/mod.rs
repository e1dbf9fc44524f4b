//! Context builder: projects the tool cache into an agent-facing catalogue.
//!
//! Capability tags come from a fixed name→capability table; they drive prompt
//! presentation and recommendation ranking only, never call routing. The
//! rendered text stays compact (roughly a kilobyte) to leave room for the
//! rest of the prompt budget.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::cache::{ServerState, ServerStatus, ToolCache, ToolInfo};

/// Closed set of coarse tool classifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    FileOperations,
    WebSearch,
    WebContent,
    Weather,
    Reasoning,
    TextProcessing,
    DataAnalysis,
    System,
    Communication,
    Unknown,
}

impl ToolCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileOperations => "file_operations",
            Self::WebSearch => "web_search",
            Self::WebContent => "web_content",
            Self::Weather => "weather",
            Self::Reasoning => "reasoning",
            Self::TextProcessing => "text_processing",
            Self::DataAnalysis => "data_analysis",
            Self::System => "system",
            Self::Communication => "communication",
            Self::Unknown => "unknown",
        }
    }
}

use ToolCapability::*;

/// Well-known tool names → capabilities.
static CAPABILITY_MAP: Lazy<HashMap<&'static str, &'static [ToolCapability]>> = Lazy::new(|| {
    let entries: &[(&str, &[ToolCapability])] = &[
        // File system tools
        ("read_file", &[FileOperations]),
        ("write_file", &[FileOperations]),
        ("list_directory", &[FileOperations, System]),
        ("directory_tree", &[FileOperations, System]),
        ("create_directory", &[FileOperations]),
        ("move_file", &[FileOperations]),
        ("search_files", &[FileOperations, TextProcessing]),
        ("get_file_info", &[FileOperations, System]),
        // Web and search tools
        ("google_search", &[WebSearch]),
        ("get_web_content", &[WebContent, TextProcessing]),
        ("fetch_url", &[WebContent]),
        // Weather tools
        ("get_weather_for_city_at_date", &[Weather]),
        ("get_weekday_from_date", &[DataAnalysis]),
        // Thinking tools
        ("sequentialthinking", &[Reasoning, TextProcessing]),
    ];
    entries.iter().copied().collect()
});

/// Task-hint keywords → capabilities the task probably needs.
static TASK_KEYWORDS: Lazy<Vec<(&'static str, &'static [ToolCapability])>> = Lazy::new(|| {
    vec![
        ("file", &[FileOperations] as &[ToolCapability]),
        ("read", &[FileOperations, TextProcessing]),
        ("write", &[FileOperations]),
        ("search", &[WebSearch, FileOperations]),
        ("web", &[WebSearch, WebContent]),
        ("weather", &[Weather]),
        ("analyze", &[DataAnalysis, Reasoning]),
        ("think", &[Reasoning]),
        ("download", &[WebContent]),
        ("list", &[FileOperations, System]),
        ("create", &[FileOperations]),
    ]
});

/// Capabilities for a tool name; unrecognised names get `unknown`.
pub fn capabilities_for(tool_name: &str) -> &'static [ToolCapability] {
    CAPABILITY_MAP
        .get(tool_name)
        .copied()
        .unwrap_or(&[Unknown])
}

/// The derived category tag stored on [`ToolInfo`]: the primary capability.
pub fn derive_category(tool_name: &str) -> &'static str {
    capabilities_for(tool_name)[0].as_str()
}

/// Tools bucketed by the metric thresholds of the recommendation rules.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Recommendations {
    pub high_performance: Vec<String>,
    pub reliable: Vec<String>,
    pub task_relevant: Vec<String>,
    pub frequently_used: Vec<String>,
}

/// Immutable snapshot handed to one reasoning iteration, then discarded.
#[derive(Clone, Debug)]
pub struct AgentToolContext {
    pub available_tools: Vec<ToolInfo>,
    pub server_status: HashMap<String, ServerStatus>,
    pub capabilities_summary: HashMap<String, Vec<String>>,
    pub recommendations: Recommendations,
    pub context_text: String,
    pub last_updated: DateTime<Utc>,
}

pub struct ContextBuilder {
    cache: std::sync::Arc<ToolCache>,
}

impl ContextBuilder {
    pub fn new(cache: std::sync::Arc<ToolCache>) -> Self {
        Self { cache }
    }

    /// Builds the full context. `task_hint` (usually the user message)
    /// activates the task-relevant recommendation bucket.
    pub fn build(&self, task_hint: Option<&str>) -> AgentToolContext {
        let cached = self.cache.all_cached_tools();
        let all_tools: Vec<ToolInfo> = cached.iter().flat_map(|(_, t)| t.clone()).collect();

        let mut server_status = HashMap::new();
        for (server, _) in &cached {
            if let Some(status) = self.cache.get_server_status(server) {
                server_status.insert(server.clone(), status);
            }
        }

        let capabilities_summary = build_capabilities_summary(&all_tools);
        let recommendations = build_recommendations(&all_tools, task_hint);
        let context_text = render_context_text(
            &cached,
            &server_status,
            &capabilities_summary,
            &recommendations,
            task_hint,
        );

        AgentToolContext {
            available_tools: all_tools,
            server_status,
            capabilities_summary,
            recommendations,
            context_text,
            last_updated: Utc::now(),
        }
    }

    /// One-line summary for terse contexts.
    pub fn compact_summary(&self) -> String {
        let cached = self.cache.all_cached_tools();
        if cached.is_empty() {
            return "No tools available".to_string();
        }
        let tool_count: usize = cached.iter().map(|(_, t)| t.len()).sum();
        let mut capabilities: Vec<&str> = cached
            .iter()
            .flat_map(|(_, tools)| tools.iter())
            .flat_map(|t| capabilities_for(&t.name))
            .map(|c| c.as_str())
            .collect();
        capabilities.sort_unstable();
        capabilities.dedup();
        let shown = capabilities
            .iter()
            .take(4)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} tools across {} servers. Capabilities: {}",
            tool_count,
            cached.len(),
            shown
        )
    }
}

fn build_capabilities_summary(tools: &[ToolInfo]) -> HashMap<String, Vec<String>> {
    let mut summary: HashMap<String, Vec<String>> = HashMap::new();
    for tool in tools {
        for capability in capabilities_for(&tool.name) {
            summary
                .entry(capability.as_str().to_string())
                .or_default()
                .push(tool.name.clone());
        }
    }
    summary
}

fn build_recommendations(tools: &[ToolInfo], task_hint: Option<&str>) -> Recommendations {
    let mut rec = Recommendations::default();
    for tool in tools {
        let m = &tool.performance_metrics;
        if m.total_calls > 0 && m.avg_response_time < 2.0 {
            rec.high_performance.push(tool.name.clone());
        }
        if m.total_calls > 0 && m.success_rate > 0.9 {
            rec.reliable.push(tool.name.clone());
        }
        if m.total_calls > 5 {
            rec.frequently_used.push(tool.name.clone());
        }
    }
    if let Some(hint) = task_hint {
        let wanted = relevant_capabilities(hint);
        for tool in tools {
            if capabilities_for(&tool.name)
                .iter()
                .any(|c| wanted.contains(c))
            {
                rec.task_relevant.push(tool.name.clone());
            }
        }
    }
    rec
}

fn relevant_capabilities(task_hint: &str) -> Vec<ToolCapability> {
    let hint = task_hint.to_lowercase();
    let mut out = Vec::new();
    for (keyword, capabilities) in TASK_KEYWORDS.iter() {
        if hint.contains(keyword) {
            for c in *capabilities {
                if !out.contains(c) {
                    out.push(*c);
                }
            }
        }
    }
    out
}

fn render_context_text(
    tools_by_server: &[(String, Vec<ToolInfo>)],
    server_status: &HashMap<String, ServerStatus>,
    capabilities: &HashMap<String, Vec<String>>,
    recommendations: &Recommendations,
    task_hint: Option<&str>,
) -> String {
    if tools_by_server.is_empty() {
        return "No MCP tools are currently available.".to_string();
    }

    let mut parts = vec!["## Available Tools".to_string()];

    for (server, tools) in tools_by_server {
        let glyph = match server_status.get(server).map(|s| s.state) {
            Some(ServerState::Connected) => "🟢",
            _ => "🔴",
        };
        parts.push(format!("\n### {} {}", glyph, server));
        for tool in tools {
            let m = &tool.performance_metrics;
            let perf = if m.total_calls > 0 {
                let rate = m.success_rate * 100.0;
                if rate >= 95.0 {
                    "⭐"
                } else if rate >= 80.0 {
                    "✅"
                } else {
                    "⚠️"
                }
            } else {
                ""
            };
            let caps: Vec<String> = capabilities_for(&tool.name)
                .iter()
                .take(2)
                .map(|c| c.as_str().replace('_', "-"))
                .collect();
            let cap_str = if caps.is_empty() {
                String::new()
            } else {
                format!(" [{}]", caps.join(", "))
            };
            let description: String = tool.description.chars().take(80).collect();
            parts.push(format!(
                "- **{}**{}: {}{}",
                tool.name, perf, description, cap_str
            ));
        }
    }

    if !capabilities.is_empty() {
        parts.push("\n### Capabilities".to_string());
        let mut keys: Vec<&String> = capabilities.keys().collect();
        keys.sort();
        for key in keys {
            let names = &capabilities[key];
            if names.is_empty() {
                continue;
            }
            let mut shown = names.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
            if names.len() > 3 {
                shown.push_str(&format!(" (+{} more)", names.len() - 3));
            }
            parts.push(format!("- **{}**: {}", key.replace('_', " "), shown));
        }
    }

    if let Some(hint) = task_hint {
        let any = !recommendations.task_relevant.is_empty()
            || !recommendations.reliable.is_empty()
            || !recommendations.high_performance.is_empty();
        if any {
            let hint_short: String = hint.chars().take(60).collect();
            parts.push(format!("\n### Recommended for '{}'", hint_short));
            if !recommendations.task_relevant.is_empty() {
                parts.push(format!(
                    "- **Most Relevant**: {}",
                    join_first(&recommendations.task_relevant, 3)
                ));
            }
            if !recommendations.reliable.is_empty() {
                parts.push(format!(
                    "- **Most Reliable**: {}",
                    join_first(&recommendations.reliable, 3)
                ));
            }
            if !recommendations.high_performance.is_empty() {
                parts.push(format!(
                    "- **Fastest**: {}",
                    join_first(&recommendations.high_performance, 3)
                ));
            }
        }
    }

    parts.push(format!(
        "\n*Last updated: {}*",
        Utc::now().format("%H:%M:%S")
    ));
    parts.join("\n")
}

fn join_first(names: &[String], n: usize) -> String {
    names.iter().take(n).cloned().collect::<Vec<_>>().join(", ")
}
