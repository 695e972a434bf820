//! Inbound UI actions.
//!
//! The host process forwards subscribe/unsubscribe requests as JSON actions
//! of the form `{ "type": "NOTIFY_SUBSCRIBE", "payload": { "topic": ... } }`.
//! The `host` field is optional: the desktop variant targets a fixed local
//! address configured on the hub, the multi-robot variant names the robot's
//! own IP.

use serde::{Deserialize, Serialize};

/// A subscribe or unsubscribe request from the UI process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Action {
    #[serde(rename = "NOTIFY_SUBSCRIBE")]
    Subscribe {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    #[serde(rename = "NOTIFY_UNSUBSCRIBE")]
    Unsubscribe {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
}

impl Action {
    /// The topic this action refers to.
    pub fn topic(&self) -> &str {
        match self {
            Action::Subscribe { topic, .. } | Action::Unsubscribe { topic, .. } => topic,
        }
    }

    /// The explicit target host, if the action carries one.
    pub fn host(&self) -> Option<&str> {
        match self {
            Action::Subscribe { host, .. } | Action::Unsubscribe { host, .. } => host.as_deref(),
        }
    }
}
