//! Runs the agent CLI for a batch of issues and relays its output into the
//! session registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::line_buffer::LineBuffer;
use super::protocol::{OutputLine, classify, is_agent_json};
use crate::errors::OrchestratorError;
use crate::session::{
    Activity, ActivityStatus, ActivityType, ProcessingOptions, SessionRegistry, StreamEvent,
};
use crate::stream::{ParseState, parse_line};

/// Message recorded on every session of a cancelled batch.
pub const CANCELLED_MESSAGE: &str = "Processing cancelled";

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Time a cancelled agent gets between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Callback receiving every non-protocol line the agent prints.
pub type LogFn = dyn Fn(&str) + Send + Sync;

/// Callback invoked once when a batch ends, however it ends.
pub type CompleteFn = Box<dyn FnOnce(BatchOutcome) + Send>;

/// How to launch the agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    /// Arguments placed before the per-batch flags.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// How long a cancelled agent may take to exit after SIGTERM.
    pub kill_grace: Duration,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Per-batch flags, in the order the agent expects them.
    pub fn batch_args(issue_ids: &[String], options: &ProcessingOptions) -> Vec<String> {
        let mut args = vec![
            "--issues".to_string(),
            issue_ids.join(","),
            "--mode".to_string(),
            options.mode.to_string(),
            "--model".to_string(),
            options.model.clone(),
            "--max-iterations".to_string(),
            options.max_iterations.to_string(),
        ];
        if options.auto_push {
            args.push("--auto-push".to_string());
        }
        args
    }

    fn command(&self, issue_ids: &[String], options: &ProcessingOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(Self::batch_args(issue_ids, options))
            .env("RALPH_ISSUE_IDS", issue_ids.join(","))
            .env("RALPH_MODE", options.mode.to_string())
            .env("RALPH_MODEL", &options.model)
            .env("RALPH_MAX_ITERATIONS", options.max_iterations.to_string())
            .env("RALPH_AUTO_PUSH", if options.auto_push { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::new("ralph")
    }
}

/// Optional hooks for a batch run.
#[derive(Default)]
pub struct BatchCallbacks {
    pub on_log: Option<Arc<LogFn>>,
    pub on_complete: Option<CompleteFn>,
}

impl BatchCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_log<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_log = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(BatchOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }
}

/// Final result of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    pub error: Option<String>,
}

impl BatchOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            cancelled: false,
            error: Some(error.into()),
        }
    }
}

/// State shared between a running batch and its handle.
struct BatchControl {
    id: Uuid,
    issue_ids: Vec<String>,
    registry: SessionRegistry,
    finished: AtomicBool,
    cancelled: AtomicBool,
    kill: Notify,
}

impl BatchControl {
    /// Mark every issue of the batch terminal. Only the first caller wins.
    fn finish(&self, success: bool, message: Option<&str>) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        for issue_id in &self.issue_ids {
            self.registry.complete_processing(issue_id, success, message);
        }
        true
    }

    fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        if !self.finish(false, Some(CANCELLED_MESSAGE)) {
            return false;
        }
        tracing::info!(batch_id = %self.id, "Batch cancelled");
        self.kill.notify_one();
        true
    }
}

#[derive(Clone)]
pub struct BatchCanceller {
    control: Arc<BatchControl>,
}

impl BatchCanceller {
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }
}

/// Handle to a running (or finished) batch.
pub struct BatchHandle {
    control: Arc<BatchControl>,
    task: JoinHandle<BatchOutcome>,
}

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    pub fn issue_ids(&self) -> &[String] {
        &self.control.issue_ids
    }

    /// Whether the sessions of this batch have already received their verdict.
    pub fn is_finished(&self) -> bool {
        self.control.finished.load(Ordering::SeqCst)
    }

    /// Cancel the batch: every session fails immediately with
    /// [`CANCELLED_MESSAGE`] and the agent process is killed. Returns `false`
    /// if the batch had already finished.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// A detached cancel switch, usable after the handle is consumed by
    /// [`BatchHandle::wait`].
    pub fn canceller(&self) -> BatchCanceller {
        BatchCanceller {
            control: Arc::clone(&self.control),
        }
    }

    /// Wait for the agent process to be reaped and return the outcome.
    pub async fn wait(self) -> BatchOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => BatchOutcome::failed(format!("Batch task failed: {}", e)),
        }
    }
}

/// Launches agent batches against a shared registry.
#[derive(Clone)]
pub struct IssueProcessor {
    registry: SessionRegistry,
    agent: AgentCommand,
}

impl IssueProcessor {
    pub fn new(registry: SessionRegistry, agent: AgentCommand) -> Self {
        Self { registry, agent }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn agent(&self) -> &AgentCommand {
        &self.agent
    }

    /// Start processing `issue_ids` with one agent process.
    ///
    /// Sessions are created and announced before this returns. The process
    /// runs on a spawned task, so this must be called from within a Tokio
    /// runtime.
    pub fn process_issues(
        &self,
        issue_ids: Vec<String>,
        options: ProcessingOptions,
        callbacks: BatchCallbacks,
    ) -> BatchHandle {
        let control = Arc::new(BatchControl {
            id: Uuid::new_v4(),
            issue_ids,
            registry: self.registry.clone(),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            kill: Notify::new(),
        });
        let BatchCallbacks {
            on_log,
            on_complete,
        } = callbacks;

        if control.issue_ids.is_empty() {
            control.finished.store(true, Ordering::SeqCst);
            return finished_handle(
                control,
                BatchOutcome::failed(OrchestratorError::EmptyBatch.to_string()),
                on_complete,
            );
        }

        for issue_id in &control.issue_ids {
            self.registry.start_processing(issue_id, options.clone());
        }

        let mut cmd = self.agent.command(&control.issue_ids, &options);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = OrchestratorError::SpawnFailed {
                    program: self.agent.program.clone(),
                    source,
                };
                tracing::error!(batch_id = %control.id, error = %err, "Agent spawn failed");
                control.finish(false, Some(&err.to_string()));
                return finished_handle(control, BatchOutcome::failed(err.to_string()), on_complete);
            }
        };

        tracing::info!(
            batch_id = %control.id,
            pid = ?child.id(),
            issues = %control.issue_ids.join(","),
            mode = %options.mode,
            "Agent process started"
        );

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let err = OrchestratorError::MissingPipe("stdout/stderr");
            control.finish(false, Some(&err.to_string()));
            return finished_handle(control, BatchOutcome::failed(err.to_string()), on_complete);
        };

        let relay = Relay {
            registry: self.registry.clone(),
            cursor: control.issue_ids[0].clone(),
            parse_states: HashMap::new(),
            max_iterations: options.max_iterations,
            on_log,
        };
        let task = tokio::spawn(run_batch(
            child,
            stdout,
            stderr,
            relay,
            Arc::clone(&control),
            self.agent.kill_grace,
            on_complete,
        ));
        BatchHandle { control, task }
    }
}

fn finished_handle(
    control: Arc<BatchControl>,
    outcome: BatchOutcome,
    on_complete: Option<CompleteFn>,
) -> BatchHandle {
    if let Some(on_complete) = on_complete {
        on_complete(outcome.clone());
    }
    let task = tokio::spawn(async move { outcome });
    BatchHandle { control, task }
}

/// Routes decoded output to the registry and the log callback.
struct Relay {
    registry: SessionRegistry,
    /// Issue the agent is currently working on; free text is attributed here.
    cursor: String,
    parse_states: HashMap<String, ParseState>,
    max_iterations: u32,
    on_log: Option<Arc<LogFn>>,
}

impl Relay {
    fn log(&self, line: &str) {
        tracing::debug!(target: "ralph_bridge::agent", issue_id = %self.cursor, "{}", line);
        if let Some(on_log) = &self.on_log {
            on_log(line);
        }
    }

    fn stdout_line(&mut self, line: String) {
        match classify(&line) {
            OutputLine::Event(event) => {
                if !event.is_system() && event.issue_id != self.cursor {
                    tracing::debug!(from = %self.cursor, to = %event.issue_id, "Agent switched issue");
                    self.cursor = event.issue_id.clone();
                }
                self.registry.emit_event(event);
            }
            OutputLine::Malformed { raw, error } => {
                tracing::warn!(error = %error, "Malformed protocol event");
                self.log(&raw);
            }
            OutputLine::Text(text) => {
                if text.trim().is_empty() {
                    return;
                }
                self.log(&text);
                if is_agent_json(&text) {
                    self.parse_agent_json(&text);
                }
            }
        }
    }

    fn parse_agent_json(&mut self, text: &str) {
        let state = self
            .parse_states
            .remove(&self.cursor)
            .unwrap_or_else(|| ParseState::new(self.max_iterations));
        let output = parse_line(text, state);
        self.parse_states.insert(self.cursor.clone(), output.state);
        for activity in output.activities {
            self.registry
                .emit_event(StreamEvent::activity(&self.cursor, activity));
        }
        if let Some(metrics) = output.metrics {
            self.registry
                .emit_event(StreamEvent::metrics(&self.cursor, metrics));
        }
    }

    fn stderr_line(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        self.log(&format!("[stderr] {}", line));
        let activity = Activity::new(ActivityType::Error, line).with_status(ActivityStatus::Error);
        self.registry
            .emit_event(StreamEvent::activity(&self.cursor, activity));
    }
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Ask the agent to exit with SIGTERM. Returns `false` if the signal could
/// not be delivered.
#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: `pid` is our own child and has not been reaped, so it cannot
    // have been recycled for another process.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// SIGTERM, then SIGKILL if the agent is still running after `grace`.
async fn terminate(child: &mut Child, grace: Duration, batch_id: Uuid) -> std::io::Result<ExitStatus> {
    if send_sigterm(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                tracing::warn!(batch_id = %batch_id, grace_ms = grace.as_millis() as u64, "Agent ignored SIGTERM, killing");
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(batch_id = %batch_id, error = %e, "Failed to kill agent process");
    }
    child.wait().await
}

async fn run_batch(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    mut relay: Relay,
    control: Arc<BatchControl>,
    kill_grace: Duration,
    on_complete: Option<CompleteFn>,
) -> BatchOutcome {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut out_buffer = LineBuffer::new();
    let mut err_buffer = LineBuffer::new();
    let mut out_chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut err_chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut kill_requested = false;

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = control.kill.notified() => {
                // Grandchildren may still hold the pipes open.
                kill_requested = true;
                break;
            }
            read = read_chunk(&mut stdout, &mut out_chunk), if stdout.is_some() => match read {
                Ok(0) => {
                    if let Some(tail) = out_buffer.finish() {
                        relay.stdout_line(tail);
                    }
                    stdout = None;
                }
                Ok(n) => {
                    for line in out_buffer.push(&out_chunk[..n]) {
                        relay.stdout_line(line);
                    }
                }
                Err(e) => {
                    tracing::warn!(batch_id = %control.id, error = %e, "Error reading agent stdout");
                    if let Some(tail) = out_buffer.finish() {
                        relay.stdout_line(tail);
                    }
                    stdout = None;
                }
            },
            read = read_chunk(&mut stderr, &mut err_chunk), if stderr.is_some() => match read {
                Ok(0) => {
                    if let Some(tail) = err_buffer.finish() {
                        relay.stderr_line(tail);
                    }
                    stderr = None;
                }
                Ok(n) => {
                    for line in err_buffer.push(&err_chunk[..n]) {
                        relay.stderr_line(line);
                    }
                }
                Err(e) => {
                    tracing::warn!(batch_id = %control.id, error = %e, "Error reading agent stderr");
                    if let Some(tail) = err_buffer.finish() {
                        relay.stderr_line(tail);
                    }
                    stderr = None;
                }
            },
        }
    }

    let status = if kill_requested {
        terminate(&mut child, kill_grace, control.id).await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = control.kill.notified() => terminate(&mut child, kill_grace, control.id).await,
        }
    };

    let mut outcome = outcome_from_status(status);
    if !control.finish(outcome.success, outcome.error.as_deref())
        && control.cancelled.load(Ordering::SeqCst)
    {
        outcome.success = false;
        outcome.cancelled = true;
        outcome.error = Some(CANCELLED_MESSAGE.to_string());
    }
    tracing::info!(
        batch_id = %control.id,
        success = outcome.success,
        exit_code = ?outcome.exit_code,
        cancelled = outcome.cancelled,
        "Agent process exited"
    );
    if let Some(on_complete) = on_complete {
        on_complete(outcome.clone());
    }
    outcome
}

fn outcome_from_status(status: std::io::Result<ExitStatus>) -> BatchOutcome {
    let (success, exit_code, error) = match status {
        Ok(status) if status.success() => (true, status.code(), None),
        Ok(status) => {
            let err = match status.code() {
                Some(code) => OrchestratorError::NonZeroExit(code),
                None => OrchestratorError::Killed,
            };
            (false, status.code(), Some(err.to_string()))
        }
        Err(e) => (false, None, Some(OrchestratorError::WaitFailed(e).to_string())),
    };
    BatchOutcome {
        success,
        exit_code,
        cancelled: false,
        error,
    }
}
