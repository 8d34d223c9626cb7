use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;

use super::models::{
    Activity, ActivityStatus, ActivityType, ProcessingOptions, ProcessingSession, SessionStatus,
    SessionSummary, StreamEvent, StreamEventKind,
};

/// Callback invoked for every event published on an issue. Returning `Err`
/// only affects this subscriber; delivery to the others continues.
pub type SubscriberFn = dyn Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync;

/// Tunables for the session registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of activities retained per session.
    pub history_limit: usize,
    /// How long a terminal session lingers before it is removed.
    pub cleanup_delay: Duration,
    /// Capacity of the bounded channel behind each channel subscriber.
    pub subscriber_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_limit: 500,
            cleanup_delay: Duration::from_secs(300),
            subscriber_buffer: 256,
        }
    }
}

struct Subscriber {
    id: u64,
    callback: Arc<SubscriberFn>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, ProcessingSession>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_subscriber_id: u64,
    next_generation: u64,
}

struct Inner {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the maps half-written,
        // so keep serving from the poisoned state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_subscriber(&self, issue_id: &str, subscriber_id: u64) {
        let mut state = self.lock_state();
        let now_empty = match state.subscribers.get_mut(issue_id) {
            Some(subs) => {
                subs.retain(|s| s.id != subscriber_id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.subscribers.remove(issue_id);
        }
    }
}

/// In-memory sessions and the publish/subscribe fabric, keyed by issue id.
///
/// Cloning is cheap and every clone shares the same state. The lock is never
/// held while subscriber callbacks run, so callbacks may call back into the
/// registry. Events for one issue reach subscribers in the order the single
/// publishing task emits them.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Create a fresh pending session, replacing any previous session for
    /// the same issue.
    pub fn create_session(&self, issue_id: &str, options: ProcessingOptions) -> ProcessingSession {
        let mut state = self.inner.lock_state();
        state.next_generation += 1;
        let mut session = ProcessingSession::new(issue_id, options);
        session.generation = state.next_generation;
        state.sessions.insert(issue_id.to_string(), session.clone());
        tracing::debug!(issue_id = %issue_id, "Session created");
        session
    }

    /// Create a session, mark it processing and publish the opening activity
    /// so every viewer sees the same first event.
    pub fn start_processing(&self, issue_id: &str, options: ProcessingOptions) {
        let details = format!(
            "Starting {} mode with {} (max {} iterations)",
            options.mode, options.model, options.max_iterations
        );
        self.create_session(issue_id, options);
        {
            let mut state = self.inner.lock_state();
            if let Some(session) = state.sessions.get_mut(issue_id) {
                session.advance(SessionStatus::Processing);
            }
        }
        tracing::info!(issue_id = %issue_id, "Processing started");
        self.emit_event(StreamEvent::activity(
            issue_id,
            Activity::new(ActivityType::System, details).with_status(ActivityStatus::Running),
        ));
    }

    /// The single write path: update the session projection, if any, then
    /// deliver the event to every subscriber of the issue. A session that
    /// becomes terminal here is scheduled for cleanup.
    pub fn emit_event(&self, event: StreamEvent) {
        self.publish(&event, false);
    }

    /// Apply and deliver `event`. With `verdict`, nothing happens when the
    /// session is already terminal; the check and the transition share one
    /// lock so two verdicts can never both be published.
    fn publish(&self, event: &StreamEvent, verdict: bool) -> bool {
        let (callbacks, cleanup_generation) = {
            let mut state = self.inner.lock_state();
            let mut cleanup_generation = None;
            if let Some(session) = state.sessions.get_mut(&event.issue_id) {
                if verdict && session.status.is_terminal() {
                    tracing::debug!(
                        issue_id = %event.issue_id,
                        status = session.status.as_str(),
                        "Session already terminal, keeping existing verdict"
                    );
                    return false;
                }
                if apply_event(session, &event.kind, self.inner.config.history_limit) {
                    cleanup_generation = Some(session.generation);
                }
            }
            let callbacks: Vec<Arc<SubscriberFn>> = state
                .subscribers
                .get(&event.issue_id)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default();
            (callbacks, cleanup_generation)
        };

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(issue_id = %event.issue_id, error = %e, "Subscriber failed to handle event");
                }
                Err(_) => {
                    tracing::error!(issue_id = %event.issue_id, "Subscriber panicked while handling event");
                }
            }
        }

        if let Some(generation) = cleanup_generation {
            self.spawn_cleanup(&event.issue_id, generation, self.inner.config.cleanup_delay);
        }
        true
    }

    /// Register a callback for an issue. The returned guard removes it when
    /// dropped or when [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, issue_id: &str, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.inner.lock_state();
        self.register(&mut state, issue_id, Arc::new(callback))
    }

    /// Subscribe through a bounded channel. When the receiver falls behind
    /// and the channel is full, the event is dropped for this subscriber only.
    pub fn subscribe_channel(&self, issue_id: &str) -> (Subscription, mpsc::Receiver<StreamEvent>) {
        let (_, subscription, rx) = self.subscribe_channel_inner(issue_id, false);
        (subscription, rx)
    }

    /// Take a snapshot of the session and register a channel subscriber under
    /// the same lock, so the live stream picks up exactly where the snapshot
    /// ends.
    pub fn snapshot_and_subscribe(
        &self,
        issue_id: &str,
    ) -> (Option<ProcessingSession>, Subscription, mpsc::Receiver<StreamEvent>) {
        self.subscribe_channel_inner(issue_id, true)
    }

    fn subscribe_channel_inner(
        &self,
        issue_id: &str,
        with_snapshot: bool,
    ) -> (Option<ProcessingSession>, Subscription, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        let callback: Arc<SubscriberFn> = Arc::new(move |event: &StreamEvent| {
            tx.try_send(event.clone()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => anyhow!("subscriber channel full, event dropped"),
                mpsc::error::TrySendError::Closed(_) => anyhow!("subscriber channel closed"),
            })
        });

        let mut state = self.inner.lock_state();
        let snapshot = if with_snapshot {
            state.sessions.get(issue_id).cloned()
        } else {
            None
        };
        let subscription = self.register(&mut state, issue_id, callback);
        (snapshot, subscription, rx)
    }

    fn register(
        &self,
        state: &mut RegistryState,
        issue_id: &str,
        callback: Arc<SubscriberFn>,
    ) -> Subscription {
        state.next_subscriber_id += 1;
        let id = state.next_subscriber_id;
        state
            .subscribers
            .entry(issue_id.to_string())
            .or_default()
            .push(Subscriber { id, callback });
        tracing::debug!(issue_id = %issue_id, subscriber = id, "Subscriber added");
        Subscription {
            registry: Arc::downgrade(&self.inner),
            issue_id: issue_id.to_string(),
            id,
            active: true,
        }
    }

    /// Record the batch verdict for an issue and publish the terminal event.
    /// Returns `false` without publishing anything when the session already
    /// reached a terminal status.
    pub fn complete_processing(&self, issue_id: &str, success: bool, message: Option<&str>) -> bool {
        let event = if success {
            StreamEvent::complete(issue_id, message.map(str::to_string))
        } else {
            StreamEvent::error(issue_id, message.unwrap_or("Processing failed"))
        };
        if !self.publish(&event, true) {
            return false;
        }
        if success {
            tracing::info!(issue_id = %issue_id, "Processing completed");
        } else {
            tracing::warn!(issue_id = %issue_id, error = message.unwrap_or("Processing failed"), "Processing failed");
        }
        true
    }

    /// Remove the session after `delay`, but only if it is still terminal and
    /// has not been replaced by a newer session in the meantime.
    pub fn schedule_cleanup(&self, issue_id: &str, delay: Duration) {
        let generation = {
            let state = self.inner.lock_state();
            match state.sessions.get(issue_id) {
                Some(session) => session.generation,
                None => return,
            }
        };
        self.spawn_cleanup(issue_id, generation, delay);
    }

    fn spawn_cleanup(&self, issue_id: &str, generation: u64, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(issue_id = %issue_id, "No async runtime available, session cleanup skipped");
            return;
        };

        let registry = Arc::downgrade(&self.inner);
        let issue_id = issue_id.to_string();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = registry.upgrade() else {
                return;
            };
            let mut state = inner.lock_state();
            let expired = matches!(
                state.sessions.get(&issue_id),
                Some(s) if s.status.is_terminal() && s.generation == generation
            );
            if expired {
                state.sessions.remove(&issue_id);
                tracing::debug!(issue_id = %issue_id, "Session cleaned up");
            }
        });
    }

    pub fn get_session(&self, issue_id: &str) -> Option<ProcessingSession> {
        self.inner.lock_state().sessions.get(issue_id).cloned()
    }

    pub fn remove_session(&self, issue_id: &str) -> bool {
        self.inner.lock_state().sessions.remove(issue_id).is_some()
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let state = self.inner.lock_state();
        let mut summaries: Vec<_> = state.sessions.values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    pub fn subscriber_count(&self, issue_id: &str) -> usize {
        self.inner
            .lock_state()
            .subscribers
            .get(issue_id)
            .map_or(0, Vec::len)
    }

    /// Whether any subscriber set exists for the issue.
    pub fn has_subscribers(&self, issue_id: &str) -> bool {
        self.inner.lock_state().subscribers.contains_key(issue_id)
    }
}

/// Returns whether the event moved the session into a terminal status.
fn apply_event(session: &mut ProcessingSession, kind: &StreamEventKind, history_limit: usize) -> bool {
    match kind {
        // Recorded even on terminal sessions: a process that ignored the
        // kill signal may still be talking.
        StreamEventKind::Activity(activity) => {
            session.push_activity(activity.clone(), history_limit);
            false
        }
        StreamEventKind::Metrics(metrics) => {
            session.metrics = Some(metrics.clone());
            false
        }
        StreamEventKind::Complete(_) => session.advance(SessionStatus::Completed),
        StreamEventKind::Error(payload) => {
            let advanced = session.advance(SessionStatus::Failed);
            if advanced {
                session.error = Some(payload.message.clone());
            }
            advanced
        }
    }
}

/// Handle for a registered subscriber.
pub struct Subscription {
    registry: Weak<Inner>,
    issue_id: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn issue_id(&self) -> &str {
        &self.issue_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.registry.upgrade() {
            inner.remove_subscriber(&self.issue_id, self.id);
            tracing::debug!(issue_id = %self.issue_id, subscriber = self.id, "Subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
