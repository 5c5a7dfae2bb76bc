use crate::Alert;
use std::io::Write;
use tokio::sync::mpsc;

/// Event is emitted for each alert transition, tagged with the kind of transition.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub tag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: time::OffsetDateTime,
    pub record: Alert,
}

impl Event {
    pub fn new(tag: impl Into<String>, record: Alert) -> Self {
        Self {
            tag: tag.into(),
            time: time::OffsetDateTime::now_utc(),
            record,
        }
    }
}

/// Sink is the downstream pipeline receiving emitted Events.
///
/// `emit` is called from request handlers when identities aren't tracked,
/// and otherwise from the single task forwarding lifecycle transitions.
/// A slow `emit` delays responses or queues further transitions, so it
/// should not block for long.
pub trait Sink: Send + Sync + 'static {
    fn emit(&self, event: Event);
}

impl Sink for mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        if let Err(mpsc::error::SendError(event)) = self.send(event) {
            tracing::warn!(tag = %event.tag, "dropping event because its receiver is gone");
        }
    }
}

/// StdoutSink writes Events to stdout as newline-delimited JSON.
///
/// Each event is a blocking write of one whole line. If stdout is a pipe
/// whose reader stalls, `emit` blocks the calling thread until it drains.
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn emit(&self, event: Event) {
        let mut buf = serde_json::to_vec(&event).expect("Event always serializes");
        buf.push(b'\n');

        // Best-effort. A single write of the whole line keeps concurrent events from interleaving.
        if let Err(error) = std::io::stdout().lock().write_all(&buf) {
            tracing::warn!(%error, tag = %event.tag, "failed to write event to stdout");
        }
    }
}
