//! Server-sent event stream for one issue: history replay, then live events.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};

use crate::session::{ProcessingSession, SessionRegistry, SessionStatus, StreamEvent};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Rebuild the event sequence that produced a session's current state.
pub fn replay_events(session: &ProcessingSession) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = session
        .activities
        .iter()
        .map(|a| StreamEvent::activity(&session.issue_id, a.clone()))
        .collect();
    if let Some(metrics) = &session.metrics {
        events.push(StreamEvent::metrics(&session.issue_id, metrics.clone()));
    }
    match session.status {
        SessionStatus::Completed => events.push(StreamEvent::complete(&session.issue_id, None)),
        SessionStatus::Failed => events.push(StreamEvent::error(
            &session.issue_id,
            session.error.as_deref().unwrap_or("Processing failed"),
        )),
        SessionStatus::Pending | SessionStatus::Processing => {}
    }
    events
}

fn to_sse(event: &StreamEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::error!(issue_id = %event.issue_id, error = %e, "Failed to encode SSE event");
            Event::default().comment("encode error")
        }
    }
}

/// Subscribe to `issue_id` and stream its events. The subscription is dropped
/// with the stream, so a client disconnect unsubscribes.
pub fn session_stream(
    registry: &SessionRegistry,
    issue_id: &str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let (snapshot, subscription, rx) = registry.snapshot_and_subscribe(issue_id);
    let replay = snapshot.as_ref().map(replay_events).unwrap_or_default();
    tracing::debug!(
        issue_id = %issue_id,
        replayed = replay.len(),
        subscribers = registry.subscriber_count(issue_id),
        "SSE client connected"
    );

    let live = stream::unfold((subscription, rx), |(subscription, mut rx)| async move {
        let event = rx.recv().await?;
        Some((event, (subscription, rx)))
    });

    let events = stream::iter(replay)
        .chain(live)
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
