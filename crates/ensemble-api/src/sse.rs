//! SSE framing: `ActionEvent` -> named event + JSON data.

use serde_json::Value;

use ensemble_core::event::ActionEvent;

/// One server-sent event, ready for `event:`/`data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

/// Frame an event for the wire. The data body is the event payload
/// alone; the event name travels in the SSE `event:` field.
pub fn frame(event: &ActionEvent) -> SseFrame {
    let name = event.name();
    let data = match serde_json::to_value(event) {
        Ok(Value::Object(mut wrapper)) => wrapper
            .remove("data")
            .map(|d| d.to_string())
            .unwrap_or_else(|| "{}".to_string()),
        _ => "{}".to_string(),
    };
    SseFrame { event: name, data }
}
