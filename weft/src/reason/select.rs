//! Deterministic action selection: keyword routing over the goal text.
//!
//! This selector is the reliability floor of the loop. Rules apply top to
//! bottom: an explicitly named tool wins, then web search, file operations,
//! weather, and finally the built-in action sequence by step count. An
//! LLM-driven selector may replace this one day, but the completion-evidence
//! invariants stay either way.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::AvailableTool;

#[derive(Clone, Debug, PartialEq)]
pub struct SelectedAction {
    pub name: String,
    pub params: Value,
}

static EXPLICIT_TOOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\buse\s+([a-zA-Z][a-zA-Z0-9]*_[a-zA-Z0-9_]*)").expect("regex"));
static AFTER_SEARCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)search\s*").expect("regex"));
static CREATE_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)create\s+(\w+\.\w+)").expect("regex"));
static WEATHER_CITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)weather.*?(?:in|for|at)\s+(\w+)").expect("regex"));

const SEARCH_KEYWORDS: &[&str] = &["search", "find", "look", "information", "news", "latest"];
const FILE_KEYWORDS: &[&str] = &["file", "create", "write", "read", "delete"];
const WEATHER_KEYWORDS: &[&str] = &["weather", "temperature", "forecast"];
const WEB_NAME_HINTS: &[&str] = &["google", "web", "http", "internet"];
const SEARCH_NAME_HINTS: &[&str] = &["search", "find", "query"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Picks the next action for the goal, given the actions already taken and
/// the MCP tools currently known.
pub fn select_action(goal: &str, steps_taken: usize, tools: &[AvailableTool]) -> SelectedAction {
    let goal_lower = goal.to_lowercase();
    let mcp_names: Vec<&str> = tools
        .iter()
        .filter(|t| t.is_mcp())
        .map(|t| t.name.as_str())
        .collect();

    // An explicitly named tool ("use some_tool to ...") takes precedence even
    // when no server owns it: the routing layer reports unknown names as an
    // observable failure and the loop recovers.
    if let Some(caps) = EXPLICIT_TOOL.captures(goal) {
        let name = caps[1].to_string();
        return SelectedAction {
            name,
            params: json!({}),
        };
    }

    if contains_any(&goal_lower, SEARCH_KEYWORDS) {
        let web_tools: Vec<&str> = mcp_names
            .iter()
            .copied()
            .filter(|n| contains_any(&n.to_lowercase(), WEB_NAME_HINTS))
            .collect();
        let local_search_tools: Vec<&str> = mcp_names
            .iter()
            .copied()
            .filter(|n| {
                let lower = n.to_lowercase();
                !contains_any(&lower, WEB_NAME_HINTS) && contains_any(&lower, SEARCH_NAME_HINTS)
            })
            .collect();

        if let Some(tool) = web_tools.first() {
            let query = AFTER_SEARCH
                .find(goal)
                .map(|m| goal[m.end()..].trim())
                .filter(|q| !q.is_empty())
                .unwrap_or(goal);
            return SelectedAction {
                name: tool.to_string(),
                params: json!({"query": query}),
            };
        }
        if let Some(tool) = local_search_tools.first() {
            if contains_any(&goal_lower, &["file", "document", "local"]) {
                return SelectedAction {
                    name: tool.to_string(),
                    params: json!({"query": goal}),
                };
            }
        }
    }

    if contains_any(&goal_lower, FILE_KEYWORDS) {
        let wants_write = goal_lower.contains("create") || goal_lower.contains("write");
        let wants_read = goal_lower.contains("read");
        let fs_tools: Vec<&str> = mcp_names
            .iter()
            .copied()
            .filter(|n| contains_any(&n.to_lowercase(), &["file", "write", "read", "create"]))
            .collect();
        let preferred = fs_tools
            .iter()
            .copied()
            .find(|n| {
                let lower = n.to_lowercase();
                (wants_write && (lower.contains("write") || lower.contains("create")))
                    || (wants_read && lower.contains("read"))
            })
            .or_else(|| fs_tools.first().copied());
        if let Some(tool) = preferred {
            if wants_write {
                let path = CREATE_FILENAME
                    .captures(&goal_lower)
                    .map(|c| c[1].to_string())
                    .unwrap_or_else(|| "debug.txt".to_string());
                return SelectedAction {
                    name: tool.to_string(),
                    params: json!({"path": path, "content": "# Created by weft\n"}),
                };
            }
            if wants_read {
                return SelectedAction {
                    name: tool.to_string(),
                    params: json!({"path": "debug.txt"}),
                };
            }
        }
    }

    if contains_any(&goal_lower, WEATHER_KEYWORDS) {
        if let Some(tool) = mcp_names
            .iter()
            .copied()
            .find(|n| n.to_lowercase().contains("weather"))
        {
            let city = WEATHER_CITY
                .captures(&goal_lower)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "Beijing".to_string());
            let date = chrono::Local::now().format("%Y-%m-%d").to_string();
            return SelectedAction {
                name: tool.to_string(),
                params: json!({"city": city, "date": date}),
            };
        }
    }

    // Built-in sequence by step count.
    let (name, params) = match steps_taken {
        0 => ("search_information", json!({"query": goal})),
        1 => ("analyze_data", json!({"focus": "goal_alignment"})),
        2 => ("synthesize_results", json!({"format": "structured"})),
        _ => ("validate_answer", json!({"criteria": "completeness"})),
    };
    SelectedAction {
        name: name.to_string(),
        params,
    }
}
