//! Error types for the notification connection manager.

use std::time::Duration;
use thiserror::Error;

/// Error type for connection and subscription operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A store entry or client handle already exists for the host.
    #[error("store: host {0} already has a connection entry")]
    AlreadyConnected(String),

    /// The host has no store entry.
    #[error("store: no entry for host {0}")]
    NotFound(String),

    /// Subscribe/unsubscribe attempted against a host with no connection.
    #[error("notify: host {0} is not connected")]
    HostNotConnected(String),

    /// Connection error.
    #[error("broker: connection error: {0}")]
    Connection(String),

    /// Subscribe error.
    #[error("broker: subscribe error: {0}")]
    Subscribe(String),

    /// Bulk teardown overran its bound.
    #[error("shutdown: teardown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    /// Client error from rumqttc.
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::v5::ClientError),
}

/// Result type for connection and subscription operations.
pub type Result<T> = std::result::Result<T, Error>;
