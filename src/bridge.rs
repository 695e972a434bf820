//! Event bridge to the UI process.
//!
//! Inside the crate, outward events are the tagged [`NotifyEvent`] variant;
//! the colon-delimited string the UI process parses is produced only at the
//! boundary by [`NotifyEvent::to_wire`]. The wire contract is
//! `"<hostname>:<topic>:<payload-or-status-code>"`, split on the first two
//! colons — the payload itself may contain colons.

use crate::types::FailureKind;
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// What an outward event carries.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyKind {
    /// A broker message body.
    Message(Bytes),
    /// The host's connection failed.
    ConnectionFailed,
    /// The host's broker port refused the connection.
    ConnectionRefused,
}

/// One outward event for the UI process.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyEvent {
    pub host_id: String,
    pub topic: String,
    pub kind: NotifyKind,
}

impl NotifyEvent {
    /// A received broker message.
    pub fn message(host_id: impl Into<String>, topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            host_id: host_id.into(),
            topic: topic.into(),
            kind: NotifyKind::Message(payload),
        }
    }

    /// A connection-failure signal for a topic the UI is waiting on.
    pub fn failure(
        host_id: impl Into<String>,
        topic: impl Into<String>,
        kind: FailureKind,
    ) -> Self {
        let kind = match kind {
            FailureKind::ConnectionRefused => NotifyKind::ConnectionRefused,
            FailureKind::ConnectionFailed => NotifyKind::ConnectionFailed,
        };
        Self {
            host_id: host_id.into(),
            topic: topic.into(),
            kind,
        }
    }

    /// Serialize to the wire string the UI process parses.
    pub fn to_wire(&self) -> String {
        let tail = match &self.kind {
            NotifyKind::Message(payload) => String::from_utf8_lossy(payload).into_owned(),
            NotifyKind::ConnectionFailed => FailureKind::ConnectionFailed.status_code().to_string(),
            NotifyKind::ConnectionRefused => {
                FailureKind::ConnectionRefused.status_code().to_string()
            }
        };
        format!("{}:{}:{}", self.host_id, self.topic, tail)
    }
}

/// Sender half of the outward pipe. Cheap to clone; one receiver per hub.
#[derive(Clone)]
pub struct EventBridge {
    tx: UnboundedSender<NotifyEvent>,
}

impl EventBridge {
    /// Create the bridge and the receiver the UI side consumes.
    pub fn new() -> (Self, UnboundedReceiver<NotifyEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push one event outward. Dropped receivers are not an error: the host
    /// application may already be shutting down.
    pub fn notify(&self, event: NotifyEvent) {
        if self.tx.send(event).is_err() {
            debug!("notify receiver dropped, discarding event");
        }
    }
}

/// Adapt the outward receiver into a `Stream` for consumers that want one.
pub fn event_stream(rx: UnboundedReceiver<NotifyEvent>) -> UnboundedReceiverStream<NotifyEvent> {
    UnboundedReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let event = NotifyEvent::message("10.0.0.5", "robot-server/runs", Bytes::from("{\"id\":1}"));
        assert_eq!(event.to_wire(), "10.0.0.5:robot-server/runs:{\"id\":1}");
    }

    #[test]
    fn test_payload_may_contain_colons() {
        let event = NotifyEvent::message("10.0.0.5", "runs", Bytes::from("12:34:56"));
        let wire = event.to_wire();
        assert_eq!(wire, "10.0.0.5:runs:12:34:56");

        // Consumers split on the first two colons only.
        let mut parts = wire.splitn(3, ':');
        assert_eq!(parts.next(), Some("10.0.0.5"));
        assert_eq!(parts.next(), Some("runs"));
        assert_eq!(parts.next(), Some("12:34:56"));
    }

    #[test]
    fn test_failure_wire_codes() {
        assert_eq!(
            NotifyEvent::failure("10.0.0.5", "runs", FailureKind::ConnectionFailed).to_wire(),
            "10.0.0.5:runs:ECONNFAILED"
        );
        assert_eq!(
            NotifyEvent::failure("10.0.0.5", "runs", FailureKind::ConnectionRefused).to_wire(),
            "10.0.0.5:runs:ECONNREFUSED"
        );
    }

    #[test]
    fn test_bridge_delivers_in_order() {
        let (bridge, mut rx) = EventBridge::new();
        bridge.notify(NotifyEvent::message("h", "a", Bytes::from("1")));
        bridge.notify(NotifyEvent::message("h", "b", Bytes::from("2")));

        assert_eq!(rx.try_recv().unwrap().to_wire(), "h:a:1");
        assert_eq!(rx.try_recv().unwrap().to_wire(), "h:b:2");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_not_fatal() {
        let (bridge, rx) = EventBridge::new();
        drop(rx);
        bridge.notify(NotifyEvent::message("h", "a", Bytes::from("1")));
    }
}
