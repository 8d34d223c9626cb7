use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Tool,
    Message,
    Result,
    Error,
    System,
    Push,
    Ci,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Message => "message",
            Self::Result => "result",
            Self::Error => "error",
            Self::System => "system",
            Self::Push => "push",
            Self::Ci => "ci",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// One displayable unit of agent behaviour. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    #[serde(default = "new_activity_id")]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActivityStatus>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

fn new_activity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Activity {
    pub fn new(activity_type: ActivityType, details: impl Into<String>) -> Self {
        Self {
            id: new_activity_id(),
            timestamp: Utc::now(),
            activity_type,
            tool: None,
            details: Some(details.into()),
            status: None,
            duration: None,
        }
    }

    pub fn with_status(mut self, status: ActivityStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = Some(duration_ms);
        self
    }
}

/// Cost and timing snapshot taken at the end of an iteration. Replaces the
/// previous snapshot rather than merging with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub iteration: u32,
    pub max_iterations: u32,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Plan,
    #[default]
    Build,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Build => write!(f, "build"),
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(Self::Plan),
            "build" => Ok(Self::Build),
            _ => Err(format!("Invalid mode '{}'. Valid values: plan, build", s)),
        }
    }
}

/// Values handed to the agent process for a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub auto_push: bool,
}

pub fn default_model() -> String {
    "sonnet".to_string()
}

pub fn default_max_iterations() -> u32 {
    10
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::default(),
            model: default_model(),
            max_iterations: default_max_iterations(),
            auto_push: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Status only moves forward, and a terminal verdict is final.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Live processing state for one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSession {
    pub issue_id: String,
    pub options: ProcessingOptions,
    pub activities: VecDeque<Activity>,
    pub metrics: Option<ExecutionMetrics>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Distinguishes a session from a later one created for the same issue.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl ProcessingSession {
    pub fn new(issue_id: &str, options: ProcessingOptions) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            options,
            activities: VecDeque::new(),
            metrics: None,
            status: SessionStatus::Pending,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            generation: 0,
        }
    }

    /// Append an activity, evicting from the head once `limit` is exceeded.
    pub fn push_activity(&mut self, activity: Activity, limit: usize) {
        self.activities.push_back(activity);
        while self.activities.len() > limit {
            self.activities.pop_front();
        }
    }

    /// Move to `next` if that is a forward transition. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            issue_id: self.issue_id.clone(),
            status: self.status,
            activity_count: self.activities.len(),
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub issue_id: String,
    pub status: SessionStatus,
    pub activity_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    #[serde(default = "default_error_message")]
    pub message: String,
}

fn default_error_message() -> String {
    "Processing failed".to_string()
}

/// What happened, tagged as `{"type": ..., "payload": ...}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum StreamEventKind {
    Activity(Activity),
    Metrics(ExecutionMetrics),
    Complete(CompletePayload),
    Error(ErrorPayload),
}

/// Unit of pub/sub delivery. Every event names the issue it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub issue_id: String,
    #[serde(flatten)]
    pub kind: StreamEventKind,
}

impl StreamEvent {
    pub fn activity(issue_id: &str, activity: Activity) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            kind: StreamEventKind::Activity(activity),
        }
    }

    pub fn metrics(issue_id: &str, metrics: ExecutionMetrics) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            kind: StreamEventKind::Metrics(metrics),
        }
    }

    pub fn complete(issue_id: &str, message: Option<String>) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            kind: StreamEventKind::Complete(CompletePayload { message }),
        }
    }

    pub fn error(issue_id: &str, message: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            kind: StreamEventKind::Error(ErrorPayload {
                message: message.into(),
            }),
        }
    }

    /// True for activity events of type `system`, which do not identify the
    /// issue the agent is currently working on.
    pub fn is_system(&self) -> bool {
        matches!(
            &self.kind,
            StreamEventKind::Activity(a) if a.activity_type == ActivityType::System
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Processing));
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Failed));
        assert!(SessionStatus::Processing.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Processing.can_transition_to(SessionStatus::Pending));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn test_push_activity_evicts_from_head() {
        let mut session = ProcessingSession::new("SEC-1", ProcessingOptions::default());
        for i in 0..5 {
            session.push_activity(Activity::new(ActivityType::Message, format!("m{}", i)), 3);
        }
        let details: Vec<_> = session
            .activities
            .iter()
            .map(|a| a.details.clone().unwrap_or_default())
            .collect();
        assert_eq!(details, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_stream_event_wire_shape() {
        let event = StreamEvent::error("SEC-7", "boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["issueId"], "SEC-7");
        assert_eq!(json["payload"]["message"], "boom");
    }

    #[test]
    fn test_stream_event_accepts_sparse_activity_payload() {
        let json = r#"{"type":"activity","issueId":"ERR-2","payload":{"type":"push","details":"Pushed branch"}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.issue_id, "ERR-2");
        match event.kind {
            StreamEventKind::Activity(a) => {
                assert_eq!(a.activity_type, ActivityType::Push);
                assert!(!a.id.is_empty());
            }
            other => panic!("Expected activity, got {:?}", other),
        }
    }

    #[test]
    fn test_processing_options_defaults_from_empty_json() {
        let options: ProcessingOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ProcessingOptions::default());
        assert_eq!(options.mode, ProcessingMode::Build);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("PLAN".parse::<ProcessingMode>().unwrap(), ProcessingMode::Plan);
        assert!("deploy".parse::<ProcessingMode>().is_err());
    }
}
