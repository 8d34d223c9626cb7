//! Classification of agent stdout lines into protocol events and free text.

use crate::session::StreamEvent;

/// Prefix marking a structured event line on the agent's stdout.
pub const EVENT_SENTINEL: &str = "RALPH_EVENT:";

#[derive(Debug)]
pub enum OutputLine {
    /// `RALPH_EVENT:{"type":...,"issueId":...,"payload":...}`
    Event(StreamEvent),
    /// Sentinel present but the JSON behind it did not decode.
    Malformed { raw: String, error: String },
    /// Anything else: diagnostics, or relayed agent stream-json.
    Text(String),
}

pub fn classify(line: &str) -> OutputLine {
    let Some(body) = line.trim_start().strip_prefix(EVENT_SENTINEL) else {
        return OutputLine::Text(line.to_string());
    };
    match serde_json::from_str::<StreamEvent>(body.trim()) {
        Ok(event) => OutputLine::Event(event),
        Err(e) => OutputLine::Malformed {
            raw: line.to_string(),
            error: e.to_string(),
        },
    }
}

/// Whether a free-text line looks like agent stream-json worth parsing.
pub fn is_agent_json(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}
