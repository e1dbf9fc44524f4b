//! Protocol-level event types (type + payload).
//! One variant per observable moment of a run; the envelope (run_id, phase_id,
//! event_id) is applied separately.

use serde::Serialize;
use serde_json::Value;

/// Protocol event: wire shape for one stream event (type + payload).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    RunStarted {
        run_id: String,
        goal: String,
    },
    /// A reasoning phase begins; `phase` is one of thinking / acting / observing / reflecting.
    PhaseEnter {
        phase: String,
        step_id: u32,
    },
    Thought {
        step_id: u32,
        content: String,
        confidence: f64,
    },
    Action {
        step_id: u32,
        name: String,
        params: Value,
    },
    ToolResult {
        step_id: u32,
        name: String,
        success: bool,
        summary: String,
    },
    Observation {
        step_id: u32,
        content: String,
    },
    Reflection {
        step_id: u32,
        content: String,
        confidence: f64,
    },
    /// Catalogue answer for a tool-listing query (bypasses the reasoning loop).
    ToolCatalogue {
        content: String,
    },
    /// A slice of the final answer; concatenating all chunks yields the answer.
    AnswerChunk {
        content: String,
    },
    RunCompleted {
        success: bool,
        iterations: u32,
        confidence: f64,
        duration_ms: u64,
    },
    RunFailed {
        error: String,
    },
}

impl ProtocolEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_type_tag() {
        let ev = ProtocolEvent::PhaseEnter {
            phase: "thinking".into(),
            step_id: 1,
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "phase_enter");
        assert_eq!(v["phase"], "thinking");
        assert_eq!(v["step_id"], 1);
    }

    #[test]
    fn tool_result_carries_success_flag() {
        let ev = ProtocolEvent::ToolResult {
            step_id: 2,
            name: "google_search".into(),
            success: true,
            summary: "top-5 results".into(),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["success"], true);
        assert_eq!(v["name"], "google_search");
    }

    #[test]
    fn run_completed_payload() {
        let ev = ProtocolEvent::RunCompleted {
            success: true,
            iterations: 3,
            confidence: 0.9,
            duration_ms: 1200,
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "run_completed");
        assert_eq!(v["iterations"], 3);
    }
}
