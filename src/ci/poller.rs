//! Bounded CI polling for a single commit.
//!
//! Each attempt fetches the check runs for the commit, classifies them and
//! publishes a [`CiPollResult`] on a watch channel. Polling stops at the first
//! terminal status or once the attempt budget is spent. When failures are
//! found and auto-fix is on, the fix trigger runs once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::CiError;

/// Conclusions that count as a failed check.
const FAILED_CONCLUSIONS: &[&str] = &[
    "failure",
    "timed_out",
    "action_required",
    "cancelled",
    "startup_failure",
];

/// One CI check for a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRun {
    pub name: String,
    /// `queued`, `in_progress` or `completed`.
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default, alias = "html_url", skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
}

impl CheckRun {
    pub fn state(&self) -> CheckState {
        if self.status != "completed" {
            return CheckState::Running;
        }
        match self.conclusion.as_deref() {
            Some(c) if FAILED_CONCLUSIONS.contains(&c) => CheckState::Failed,
            Some("success") => CheckState::Passed,
            _ => CheckState::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Failed,
    Running,
    Passed,
    /// neutral, skipped, stale, or a completed run without a conclusion.
    Other,
}

/// Overall status of a commit's checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    /// No check runs reported yet.
    #[default]
    Pending,
    Running,
    Failure,
    Mixed,
    Success,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failure => "failure",
            Self::Mixed => "mixed",
            Self::Success => "success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failure | Self::Mixed | Self::Success)
    }
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check runs grouped by state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub failed: Vec<CheckRun>,
    pub running: Vec<CheckRun>,
    pub passed: Vec<CheckRun>,
    pub other: Vec<CheckRun>,
}

impl CheckSummary {
    pub fn from_runs(runs: Vec<CheckRun>) -> Self {
        let mut summary = Self::default();
        for run in runs {
            match run.state() {
                CheckState::Failed => summary.failed.push(run),
                CheckState::Running => summary.running.push(run),
                CheckState::Passed => summary.passed.push(run),
                CheckState::Other => summary.other.push(run),
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.failed.len() + self.running.len() + self.passed.len() + self.other.len()
    }

    /// Precedence: failure, then running, then mixed, then success.
    pub fn status(&self) -> CiStatus {
        if self.total() == 0 {
            CiStatus::Pending
        } else if !self.failed.is_empty() {
            CiStatus::Failure
        } else if !self.running.is_empty() {
            CiStatus::Running
        } else if !self.passed.is_empty() && !self.other.is_empty() {
            CiStatus::Mixed
        } else {
            CiStatus::Success
        }
    }
}

/// Latest known CI state for a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiPollResult {
    pub sha: String,
    pub status: CiStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub checks: CheckSummary,
    pub checked_at: DateTime<Utc>,
    /// No further attempts will be made.
    pub done: bool,
    pub fix_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CiPollResult {
    pub fn initial(sha: &str, max_attempts: u32) -> Self {
        Self {
            sha: sha.to_string(),
            status: CiStatus::Pending,
            attempt: 0,
            max_attempts,
            checks: CheckSummary::default(),
            checked_at: Utc::now(),
            done: false,
            fix_triggered: false,
            error: None,
        }
    }

    /// Polling ended without a terminal status.
    pub fn exhausted(&self) -> bool {
        self.done && !self.status.is_terminal()
    }
}

/// Where check runs come from.
#[async_trait]
pub trait CiStatusSource: Send + Sync {
    async fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>, CiError>;
}

/// Invoked once per poll when checks fail and auto-fix is on.
#[async_trait]
pub trait FixTrigger: Send + Sync {
    async fn trigger(&self, sha: &str, failed: &[CheckRun]) -> Result<(), CiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub auto_fix: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 40,
            auto_fix: false,
        }
    }
}

/// A poll running in the background.
pub struct PollHandle {
    pub updates: watch::Receiver<CiPollResult>,
    pub task: JoinHandle<CiPollResult>,
}

#[derive(Clone)]
pub struct CiPoller {
    source: Arc<dyn CiStatusSource>,
    fix: Option<Arc<dyn FixTrigger>>,
    config: PollConfig,
}

impl CiPoller {
    pub fn new(source: Arc<dyn CiStatusSource>, config: PollConfig) -> Self {
        Self {
            source,
            fix: None,
            config,
        }
    }

    pub fn with_fix_trigger(mut self, fix: Arc<dyn FixTrigger>) -> Self {
        self.fix = Some(fix);
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start polling `sha` on a background task.
    pub fn spawn(&self, sha: &str, auto_fix: bool) -> Result<PollHandle, CiError> {
        let sha = validate_sha(sha)?;
        let (tx, rx) = watch::channel(CiPollResult::initial(&sha, self.config.max_attempts));
        let poller = self.clone();
        let task = tokio::spawn(async move { poller.poll(&sha, auto_fix, &tx).await });
        Ok(PollHandle { updates: rx, task })
    }

    /// Poll until a terminal status or the attempt budget runs out, publishing
    /// every intermediate result. Returns the final result.
    pub async fn poll(
        &self,
        sha: &str,
        auto_fix: bool,
        updates: &watch::Sender<CiPollResult>,
    ) -> CiPollResult {
        let max_attempts = self.config.max_attempts;
        let mut result = CiPollResult::initial(sha, max_attempts);

        if max_attempts == 0 {
            result.done = true;
            updates.send_replace(result.clone());
            return result;
        }

        for attempt in 1..=max_attempts {
            result.attempt = attempt;
            result.checked_at = Utc::now();

            match self.source.check_runs(sha).await {
                Ok(runs) => {
                    result.checks = CheckSummary::from_runs(runs);
                    result.status = result.checks.status();
                    result.error = None;
                    tracing::debug!(
                        sha = %sha,
                        attempt,
                        status = %result.status,
                        checks = result.checks.total(),
                        "CI status fetched"
                    );
                }
                Err(e) => {
                    tracing::warn!(sha = %sha, attempt, error = %e, "CI status fetch failed");
                    result.error = Some(e.to_string());
                }
            }

            if result.status.is_terminal() || attempt == max_attempts {
                result.done = true;
                break;
            }
            updates.send_replace(result.clone());
            tokio::time::sleep(self.config.interval).await;
        }

        if result.status == CiStatus::Failure && auto_fix {
            result.fix_triggered = self.trigger_fix(sha, &result.checks.failed).await;
        }

        tracing::info!(
            sha = %sha,
            status = %result.status,
            attempts = result.attempt,
            fix_triggered = result.fix_triggered,
            "CI polling finished"
        );
        updates.send_replace(result.clone());
        result
    }

    async fn trigger_fix(&self, sha: &str, failed: &[CheckRun]) -> bool {
        let Some(fix) = &self.fix else {
            tracing::warn!(sha = %sha, "CI failed with auto-fix enabled, but no fix trigger is configured");
            return false;
        };
        match fix.trigger(sha, failed).await {
            Ok(()) => {
                tracing::info!(sha = %sha, failed = failed.len(), "CI fix triggered");
                true
            }
            Err(e) => {
                tracing::error!(sha = %sha, error = %e, "CI fix trigger failed");
                false
            }
        }
    }
}

/// Accept 7 to 40 hex characters, normalized to lowercase.
pub fn validate_sha(sha: &str) -> Result<String, CiError> {
    let sha = sha.trim();
    let valid = (7..=40).contains(&sha.len()) && sha.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(sha.to_ascii_lowercase())
    } else {
        Err(CiError::InvalidSha(sha.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn run(name: &str, status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: name.to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
            html_url: None,
        }
    }

    /// Returns scripted responses in order, repeating the last one.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<CheckRun>, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<CheckRun>, String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CiStatusSource for ScriptedSource {
        async fn check_runs(&self, _sha: &str) -> Result<Vec<CheckRun>, CiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            };
            next.map_err(|e| CiError::Other(anyhow::anyhow!(e)))
        }
    }

    #[derive(Default)]
    struct RecordingFix {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl FixTrigger for RecordingFix {
        async fn trigger(&self, _sha: &str, failed: &[CheckRun]) -> Result<(), CiError> {
            self.calls
                .lock()
                .unwrap()
                .push(failed.iter().map(|r| r.name.clone()).collect());
            Ok(())
        }
    }

    fn fast_config(max_attempts: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            max_attempts,
            auto_fix: false,
        }
    }

    #[test]
    fn test_check_state_classification() {
        assert_eq!(run("a", "queued", None).state(), CheckState::Running);
        assert_eq!(run("a", "in_progress", None).state(), CheckState::Running);
        assert_eq!(run("a", "completed", Some("success")).state(), CheckState::Passed);
        for c in FAILED_CONCLUSIONS {
            assert_eq!(run("a", "completed", Some(c)).state(), CheckState::Failed);
        }
        assert_eq!(run("a", "completed", Some("skipped")).state(), CheckState::Other);
        assert_eq!(run("a", "completed", Some("neutral")).state(), CheckState::Other);
        assert_eq!(run("a", "completed", None).state(), CheckState::Other);
    }

    #[test]
    fn test_overall_status_precedence() {
        let status = |runs: Vec<CheckRun>| CheckSummary::from_runs(runs).status();

        assert_eq!(status(vec![]), CiStatus::Pending);
        assert_eq!(
            status(vec![
                run("build", "in_progress", None),
                run("lint", "completed", Some("failure")),
            ]),
            CiStatus::Failure
        );
        assert_eq!(
            status(vec![
                run("build", "in_progress", None),
                run("lint", "completed", Some("success")),
            ]),
            CiStatus::Running
        );
        assert_eq!(
            status(vec![
                run("build", "completed", Some("success")),
                run("docs", "completed", Some("skipped")),
            ]),
            CiStatus::Mixed
        );
        assert_eq!(
            status(vec![
                run("build", "completed", Some("success")),
                run("test", "completed", Some("success")),
            ]),
            CiStatus::Success
        );
    }

    #[test]
    fn test_validate_sha() {
        assert_eq!(validate_sha("ABCDEF1").unwrap(), "abcdef1");
        assert!(validate_sha(SHA).is_ok());
        assert!(matches!(validate_sha("abc"), Err(CiError::InvalidSha(_))));
        assert!(validate_sha("not-a-sha!").is_err());
    }

    #[tokio::test]
    async fn test_poll_until_success() {
        let source = ScriptedSource::new(vec![
            Ok(vec![]),
            Ok(vec![run("build", "in_progress", None)]),
            Ok(vec![run("build", "completed", Some("success"))]),
        ]);
        let poller = CiPoller::new(source.clone(), fast_config(10));
        let (tx, rx) = watch::channel(CiPollResult::initial(SHA, 10));

        let result = poller.poll(SHA, false, &tx).await;

        assert_eq!(result.status, CiStatus::Success);
        assert_eq!(result.attempt, 3);
        assert!(result.done);
        assert!(!result.exhausted());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*rx.borrow(), result);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_max_attempts() {
        let source = ScriptedSource::new(vec![Ok(vec![run("build", "queued", None)])]);
        let poller = CiPoller::new(source.clone(), fast_config(3));
        let (tx, _rx) = watch::channel(CiPollResult::initial(SHA, 3));

        let result = poller.poll(SHA, false, &tx).await;

        assert_eq!(result.status, CiStatus::Running);
        assert!(result.exhausted());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_reported_and_retried() {
        let source = ScriptedSource::new(vec![
            Err("rate limited".to_string()),
            Ok(vec![run("build", "completed", Some("success"))]),
        ]);
        let poller = CiPoller::new(source, fast_config(5));
        let (tx, _rx) = watch::channel(CiPollResult::initial(SHA, 5));

        let result = poller.poll(SHA, false, &tx).await;
        assert_eq!(result.status, CiStatus::Success);
        assert_eq!(result.error, None);
        assert_eq!(result.attempt, 2);
    }

    #[tokio::test]
    async fn test_failure_triggers_fix_once() {
        let source = ScriptedSource::new(vec![Ok(vec![
            run("build", "completed", Some("success")),
            run("test", "completed", Some("failure")),
            run("e2e", "completed", Some("timed_out")),
        ])]);
        let fix = Arc::new(RecordingFix::default());
        let poller = CiPoller::new(source, fast_config(5)).with_fix_trigger(fix.clone());
        let (tx, _rx) = watch::channel(CiPollResult::initial(SHA, 5));

        let result = poller.poll(SHA, true, &tx).await;

        assert_eq!(result.status, CiStatus::Failure);
        assert!(result.fix_triggered);
        let calls = fix.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["test", "e2e"]);
    }

    #[tokio::test]
    async fn test_failure_without_auto_fix_does_not_trigger() {
        let source = ScriptedSource::new(vec![Ok(vec![run("test", "completed", Some("failure"))])]);
        let fix = Arc::new(RecordingFix::default());
        let poller = CiPoller::new(source, fast_config(5)).with_fix_trigger(fix.clone());
        let (tx, _rx) = watch::channel(CiPollResult::initial(SHA, 5));

        let result = poller.poll(SHA, false, &tx).await;
        assert!(!result.fix_triggered);
        assert!(fix.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_publishes_final_result() {
        let source = ScriptedSource::new(vec![Ok(vec![run("build", "completed", Some("success"))])]);
        let poller = CiPoller::new(source, fast_config(5));

        let handle = poller.spawn(SHA, false).unwrap();
        let result = handle.task.await.unwrap();
        assert_eq!(result.status, CiStatus::Success);
        assert_eq!(handle.updates.borrow().status, CiStatus::Success);
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_sha() {
        let source = ScriptedSource::new(vec![Ok(vec![])]);
        let poller = CiPoller::new(source, fast_config(1));
        assert!(matches!(poller.spawn("xyz", false), Err(CiError::InvalidSha(_))));
    }

    #[test]
    fn test_check_run_deserializes_github_shape() {
        let json = r#"{"id":1,"name":"build","status":"completed","conclusion":"success","html_url":"https://github.com/a/b/runs/1"}"#;
        let run: CheckRun = serde_json::from_str(json).unwrap();
        assert_eq!(run.state(), CheckState::Passed);
        assert_eq!(run.html_url.as_deref(), Some("https://github.com/a/b/runs/1"));
    }
}
