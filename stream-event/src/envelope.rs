//! Envelope (run_id, phase_id, event_id) injected into each serialized event.
//! `EnvelopeState` tracks the current phase span and assigns sequence numbers.

use crate::event::ProtocolEvent;
use serde_json::Value;

/// Envelope fields recommended for each message.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Run ID; constant within one run's stream.
    pub run_id: Option<String>,
    /// Phase span ID for the current span (from phase_enter to the next one).
    pub phase_id: Option<String>,
    /// Per-message sequence number; monotonically increasing within a stream.
    pub event_id: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn with_phase_id(mut self, id: impl Into<String>) -> Self {
        self.phase_id = Some(id.into());
        self
    }

    pub fn with_event_id(mut self, id: u64) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    /// Does not overwrite existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.run_id {
            obj.entry("run_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(ref id) = self.phase_id {
            obj.entry("phase_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(id) = self.event_id {
            obj.entry("event_id")
                .or_insert_with(|| Value::Number(serde_json::Number::from(id)));
        }
    }
}

/// Envelope state for one run: run_id, current phase span id, next event_id.
pub struct EnvelopeState {
    pub run_id: String,
    pub current_phase_id: String,
    pub phase_seq: u64,
    pub next_event_id: u64,
}

impl EnvelopeState {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            current_phase_id: String::new(),
            phase_seq: 0,
            next_event_id: 1,
        }
    }

    /// Injects envelope into the event value and advances state.
    /// On `type == "phase_enter"`, opens a new phase span from the event's `phase`.
    pub fn inject_into(&mut self, value: &mut Value) {
        if value.get("type").and_then(|v| v.as_str()) == Some("phase_enter") {
            let phase = value.get("phase").and_then(|v| v.as_str()).unwrap_or("");
            self.current_phase_id = format!("span-{}-{}", phase, self.phase_seq);
            self.phase_seq += 1;
        }
        let phase_id = if self.current_phase_id.is_empty() {
            "span-0"
        } else {
            self.current_phase_id.as_str()
        };
        let env = Envelope::new()
            .with_run_id(&self.run_id)
            .with_phase_id(phase_id)
            .with_event_id(self.next_event_id);
        self.next_event_id += 1;
        env.inject_into(value);
    }
}

/// Converts a protocol event to JSON and injects the envelope using the given state.
/// Returns the final value (type + payload + run_id, phase_id, event_id).
pub fn to_json(
    event: &ProtocolEvent,
    state: &mut EnvelopeState,
) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}
