//! Incremental parser from agent output lines to session activities.
//!
//! The parser is pure: all carried context lives in [`ParseState`], which the
//! caller threads from one call to the next. Garbled or unexpected input never
//! fails; it degrades to a plain `message` activity.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    AgentLine, ContentBlock, ELLIPSIS, is_recognized_tool, summarize_tool_input, truncate_str,
};
use crate::session::models::{Activity, ActivityStatus, ActivityType, ExecutionMetrics};

/// Longest `message` activity: 200 characters of assistant text plus the
/// ellipsis.
const MESSAGE_PREVIEW_CHARS: usize = 200 + ELLIPSIS.len();

/// Cap for a single iteration's reported duration (one year).
const MAX_DURATION_MS: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

/// Raw tool input shown when it cannot be summarized.
const TOOL_INPUT_PREVIEW_CHARS: usize = 100;

/// Parser context carried between lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseState {
    pub current_tool: Option<String>,
    /// Accumulated `partial_json` fragments for the active tool.
    pub current_tool_input: String,
    pub tool_started_at: Option<DateTime<Utc>>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
}

impl ParseState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            ..Default::default()
        }
    }

    fn clear_tool(&mut self) {
        self.current_tool = None;
        self.current_tool_input.clear();
        self.tool_started_at = None;
    }
}

/// Result of parsing one line.
///
/// A line yields at most one activity of its own. When it closes a streamed
/// tool call, the finished tool activity comes first.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub activities: Vec<Activity>,
    pub metrics: Option<ExecutionMetrics>,
    pub state: ParseState,
}

/// Result of parsing a batch of lines.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub activities: Vec<Activity>,
    /// Only the most recent snapshot; it already carries the running totals.
    pub metrics: Option<ExecutionMetrics>,
}

pub fn parse_line(line: &str, state: ParseState) -> ParseOutput {
    let mut state = state;
    let mut activities = Vec::new();
    let mut metrics = None;

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParseOutput {
            activities,
            metrics,
            state,
        };
    }

    let parsed = decode(trimmed);

    if let Some(AgentLine::ContentBlockDelta { delta }) = &parsed {
        if state.current_tool.is_some()
            && let Some(fragment) = &delta.partial_json
        {
            state.current_tool_input.push_str(fragment);
        }
        return ParseOutput {
            activities,
            metrics,
            state,
        };
    }

    if let Some(finished) = flush_tool(&mut state) {
        activities.push(finished);
    }

    match parsed {
        None => {
            activities.push(
                Activity::new(ActivityType::Message, line.trim_end_matches(['\r', '\n']))
                    .with_status(ActivityStatus::Success),
            );
        }
        Some(AgentLine::Assistant { message }) => {
            if let Some(ContentBlock::Text { text }) = message.content.first()
                && !text.trim().is_empty()
            {
                activities.push(
                    Activity::new(ActivityType::Message, truncate_str(text.trim(), MESSAGE_PREVIEW_CHARS))
                        .with_status(ActivityStatus::Success),
                );
            }
        }
        Some(AgentLine::ContentBlockStart { content_block }) => {
            if let ContentBlock::ToolUse { name, input, .. } = content_block
                && is_recognized_tool(&name)
            {
                state.clear_tool();
                if input.as_object().is_some_and(|o| !o.is_empty()) {
                    state.current_tool_input = input.to_string();
                }
                state.tool_started_at = Some(Utc::now());
                activities.push(
                    Activity::new(ActivityType::Tool, format!("Starting {}...", name))
                        .with_tool(name.clone())
                        .with_status(ActivityStatus::Pending),
                );
                state.current_tool = Some(name);
            }
        }
        Some(AgentLine::ContentBlockDelta { .. }) => {}
        Some(AgentLine::Result {
            result,
            is_error,
            cost_usd,
            total_cost_usd,
            duration_ms,
        }) => {
            let nested = result.as_object();
            let nested_f64 = |key: &str| nested.and_then(|o| o.get(key)).and_then(Value::as_f64);

            let cost = nested_f64("cost_usd")
                .or(cost_usd)
                .or(total_cost_usd)
                .unwrap_or(0.0);
            let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
            let duration = nested_f64("duration_ms")
                .or(duration_ms)
                .map(|d| d.clamp(0.0, MAX_DURATION_MS).round() as u64)
                .unwrap_or(0);
            let failed = is_error
                || nested
                    .and_then(|o| o.get("is_error"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

            state.iteration = state.iteration.saturating_add(1);
            state.total_cost_usd += cost;
            state.total_duration_ms = state.total_duration_ms.saturating_add(duration);

            let progress = if state.max_iterations > 0 {
                format!("{}/{}", state.iteration, state.max_iterations)
            } else {
                state.iteration.to_string()
            };
            let outcome = if failed { "failed" } else { "complete" };
            let details = format!(
                "Iteration {} {} - Cost: ${:.4}, Duration: {:.1}s",
                progress,
                outcome,
                cost,
                duration as f64 / 1000.0
            );
            let status = if failed {
                ActivityStatus::Error
            } else {
                ActivityStatus::Success
            };
            activities.push(
                Activity::new(ActivityType::Result, details)
                    .with_status(status)
                    .with_duration(duration),
            );
            metrics = Some(ExecutionMetrics {
                iteration: state.iteration,
                max_iterations: state.max_iterations,
                cost_usd: cost,
                duration_ms: duration,
                total_cost_usd: state.total_cost_usd,
                total_duration_ms: state.total_duration_ms,
            });
            state.clear_tool();
        }
        Some(AgentLine::Error { error, message }) => {
            let text = message
                .or_else(|| {
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .or_else(|| error.as_str().map(str::to_string))
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "Unknown error".to_string());
            activities.push(Activity::new(ActivityType::Error, text).with_status(ActivityStatus::Error));
        }
        Some(AgentLine::System { subtype }) => {
            let details = match subtype {
                Some(subtype) => format!("System: {}", subtype),
                None => "System event".to_string(),
            };
            activities.push(Activity::new(ActivityType::System, details).with_status(ActivityStatus::Success));
        }
        Some(AgentLine::Unknown) => {}
    }

    ParseOutput {
        activities,
        metrics,
        state,
    }
}

/// Fold [`parse_line`] over `lines`, starting from a fresh state.
pub fn parse_lines<S: AsRef<str>>(lines: &[S], max_iterations: u32) -> ParsedBatch {
    let mut state = ParseState::new(max_iterations);
    let mut batch = ParsedBatch::default();
    for line in lines {
        let output = parse_line(line.as_ref(), state);
        batch.activities.extend(output.activities);
        if output.metrics.is_some() {
            batch.metrics = output.metrics;
        }
        state = output.state;
    }
    batch
}

/// Typed view of a line, or `None` when the line is not a typed JSON object
/// of a shape we understand.
fn decode(trimmed: &str) -> Option<AgentLine> {
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    if !value.get("type").is_some_and(Value::is_string) {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn flush_tool(state: &mut ParseState) -> Option<Activity> {
    let tool = state.current_tool.clone()?;
    if state.current_tool_input.is_empty() {
        return None;
    }

    let summary = serde_json::from_str::<Value>(&state.current_tool_input)
        .ok()
        .and_then(|input| summarize_tool_input(&tool, &input))
        .unwrap_or_else(|| truncate_str(&state.current_tool_input, TOOL_INPUT_PREVIEW_CHARS));

    let mut activity = Activity::new(ActivityType::Tool, summary)
        .with_tool(tool)
        .with_status(ActivityStatus::Success);
    if let Some(started) = state.tool_started_at {
        let elapsed = (Utc::now() - started).num_milliseconds().max(0) as u64;
        activity = activity.with_duration(elapsed);
    }
    state.clear_tool();
    Some(activity)
}
