//! Notification connection manager for a fleet of MQTT-connected robots.
//!
//! Maintains one broker connection per discovered robot host, tracks
//! per-host/per-topic subscription state, and bridges broker traffic into a
//! single outward event stream for the host UI process:
//! - Lazy subscriptions: the network is touched only on the first listener
//!   in and the last listener out
//! - One live connection per robot, even when discovery reports the same
//!   robot under several IPs
//! - Connection failures classified and surfaced as events, never as panics
//!
//! # Example
//!
//! ```no_run
//! use fleet_notify::{Action, DiscoveredRobot, NotifyConfig, NotifyHub};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (hub, mut events) = NotifyHub::new(NotifyConfig::default());
//!
//!     // One discovery tick: connect to otie's broker.
//!     hub.update_robots(&[DiscoveredRobot::new("otie", "10.0.0.5").healthy()])
//!         .await;
//!
//!     // The UI wants run updates from that robot.
//!     hub.handle_action(Action::Subscribe {
//!         topic: "robot-server/runs".to_string(),
//!         host: Some("10.0.0.5".to_string()),
//!     })
//!     .await;
//!
//!     if let Some(event) = events.recv().await {
//!         println!("{}", event.to_wire());
//!     }
//!
//!     hub.close_all_connections().await?;
//!     Ok(())
//! }
//! ```

mod action;
mod bridge;
mod broker;
mod discovery;
mod error;
mod hub;
mod lifecycle;
mod store;
mod subscription;
#[cfg(test)]
mod tests;
mod types;

pub use action::Action;
pub use bridge::{event_stream, EventBridge, NotifyEvent, NotifyKind};
pub use broker::{BrokerLink, Connector, Dialer, MqttConnector, MqttLink};
pub use discovery::{reachable_names, DiscoveredRobot, Health, HealthStatus};
pub use error::{Error, Result};
pub use hub::{NotifyConfig, NotifyHub};
pub use lifecycle::LifecycleManager;
pub use store::{ConnectionStore, SubStatus, UnsubStatus};
pub use subscription::SubscriptionManager;
pub use types::{BrokerEvent, FailureKind, HostEvent};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        Action, BrokerEvent, BrokerLink, Connector, ConnectionStore, DiscoveredRobot, Error,
        FailureKind, HostEvent, NotifyConfig, NotifyEvent, NotifyHub, NotifyKind, Result,
    };
}
