//! Common types shared by the store, the lifecycle manager, and the bridge.

use bytes::Bytes;
use std::fmt;

/// Classification of a transport-level connection failure.
///
/// `ConnectionRefused` is reported once per failure episode, then demoted to
/// `ConnectionFailed` on subsequent reads (see
/// [`ConnectionStore::get_failed_connection_status`](crate::ConnectionStore::get_failed_connection_status)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The broker port actively refused the connection.
    ConnectionRefused,
    /// Any other connect or transport error.
    ConnectionFailed,
}

impl FailureKind {
    /// Classify a transport error from its message text.
    pub fn classify(error_text: &str) -> Self {
        if error_text.contains("Connection refused") || error_text.contains("ECONNREFUSED") {
            FailureKind::ConnectionRefused
        } else {
            FailureKind::ConnectionFailed
        }
    }

    /// The status code carried on the outward wire for this failure.
    pub fn status_code(&self) -> &'static str {
        match self {
            FailureKind::ConnectionRefused => "ECONNREFUSED",
            FailureKind::ConnectionFailed => "ECONNFAILED",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_code())
    }
}

/// Event emitted by a broker connection's event loop.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// CONNACK received; the transport is up.
    Connected,
    /// The broker acknowledged a subscribe for `topic`.
    SubAck { topic: String },
    /// The broker acknowledged an unsubscribe for `topic`.
    UnsubAck { topic: String },
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },
    /// Broker-initiated disconnect with a reason code.
    Disconnect { reason: String },
    /// Transport error (connect failure or mid-connection).
    Error { detail: String },
    /// The event loop exited; no further events follow for this connection.
    Closed,
}

/// A [`BrokerEvent`] tagged with the host it came from.
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub host_id: String,
    pub event: BrokerEvent,
}

impl HostEvent {
    pub fn new(host_id: impl Into<String>, event: BrokerEvent) -> Self {
        Self {
            host_id: host_id.into(),
            event,
        }
    }
}
