//! Notify hub.
//!
//! Top-level facade owning the connection store, the lifecycle and
//! subscription managers, and the event pump that feeds broker events into
//! them. The host process hands it discovery ticks and UI actions, and
//! consumes the outward [`NotifyEvent`] receiver.

use crate::action::Action;
use crate::bridge::{EventBridge, NotifyEvent};
use crate::broker::{Connector, Dialer, MqttConnector};
use crate::discovery::DiscoveredRobot;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;
use crate::store::ConnectionStore;
use crate::subscription::SubscriptionManager;
use crate::types::{BrokerEvent, FailureKind, HostEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Broker port on every host.
    pub port: u16,
    /// Keep-alive interval for broker connections.
    pub keep_alive: Duration,
    /// Transport re-poll delay after an error.
    pub reconnect_delay: Duration,
    /// Bound on each initial connect.
    pub connect_timeout: Duration,
    /// Bound on `close_all_connections`.
    pub shutdown_timeout: Duration,
    /// Target for actions that carry no explicit host (the fixed
    /// local-address variant). Multi-robot deployments leave this unset and
    /// name hosts in each action.
    pub default_host: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            port: 1883,
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
            default_host: None,
        }
    }
}

impl NotifyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the bound on `close_all_connections`.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the fixed target host for actions without one.
    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = Some(host.into());
        self
    }

    fn dialer(&self) -> Dialer {
        Dialer::new()
            .with_port(self.port)
            .with_keep_alive(self.keep_alive)
            .with_reconnect_delay(self.reconnect_delay)
            .with_connect_timeout(self.connect_timeout)
    }
}

/// Connection manager facade. Create one per process; drop it (or call
/// [`NotifyHub::close_all_connections`]) at shutdown.
pub struct NotifyHub {
    store: Arc<ConnectionStore>,
    lifecycle: Arc<LifecycleManager>,
    subscriptions: Arc<SubscriptionManager>,
    bridge: EventBridge,
    config: NotifyConfig,
    cancel: CancellationToken,
}

impl NotifyHub {
    /// Create a hub over the real MQTT transport.
    pub fn new(config: NotifyConfig) -> (Self, UnboundedReceiver<NotifyEvent>) {
        let connector = Arc::new(MqttConnector::new(config.dialer()));
        Self::with_connector(connector, config)
    }

    /// Create a hub over a caller-supplied transport.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: NotifyConfig,
    ) -> (Self, UnboundedReceiver<NotifyEvent>) {
        let store = Arc::new(ConnectionStore::new());
        let (bridge, notify_rx) = EventBridge::new();
        let (events_tx, mut events_rx) = unbounded_channel::<HostEvent>();

        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            connector,
            events_tx,
            bridge.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(store.clone()));
        let cancel = CancellationToken::new();

        let pump_lifecycle = lifecycle.clone();
        let pump_subscriptions = subscriptions.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    incoming = events_rx.recv() => match incoming {
                        Some(HostEvent { host_id, event }) => {
                            if matches!(event, BrokerEvent::Closed) {
                                pump_subscriptions.clear_host(&host_id);
                            }
                            pump_lifecycle.on_event(&host_id, event).await;
                        }
                        None => break,
                    }
                }
            }
            debug!("event pump exiting");
        });

        (
            Self {
                store,
                lifecycle,
                subscriptions,
                bridge,
                config,
                cancel,
            },
            notify_rx,
        )
    }

    /// The connection store, for introspection.
    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }

    /// Apply one discovery tick: connect newly reachable hosts, alias
    /// duplicate IPs, and tear down robots that dropped out of the feed.
    pub async fn update_robots(&self, robots: &[DiscoveredRobot]) {
        self.lifecycle.update_robots(robots).await;
        self.lifecycle.clean_up_unreachable_robots(robots).await;
    }

    /// Tear down robots the feed no longer reports as reachable.
    pub async fn clean_up_unreachable_robots(&self, robots: &[DiscoveredRobot]) {
        self.lifecycle.clean_up_unreachable_robots(robots).await;
    }

    /// Handle one UI action. Failures never propagate: a subscribe against
    /// an unreachable host surfaces as a failure event on the outward pipe,
    /// everything else is logged.
    pub async fn handle_action(&self, action: Action) {
        match action {
            Action::Subscribe { topic, host } => {
                let Some(host) = host.or_else(|| self.config.default_host.clone()) else {
                    warn!("subscribe action for {} has no target host", topic);
                    return;
                };
                if let Err(e) = self.subscriptions.subscribe(&host, &topic).await {
                    debug!("subscribe to {}:{} failed: {}", host, topic, e);
                    let kind = self
                        .store
                        .get_failed_connection_status(&host)
                        .ok()
                        .flatten()
                        .unwrap_or(FailureKind::ConnectionFailed);
                    self.bridge.notify(NotifyEvent::failure(&host, &topic, kind));
                }
            }
            Action::Unsubscribe { topic, host } => {
                let Some(host) = host.or_else(|| self.config.default_host.clone()) else {
                    warn!("unsubscribe action for {} has no target host", topic);
                    return;
                };
                if let Err(e) = self.subscriptions.unsubscribe(&host, &topic).await {
                    debug!("unsubscribe from {}:{} ignored: {}", host, topic, e);
                }
            }
        }
    }

    /// Force-end every connection in parallel, bounded by the configured
    /// shutdown timeout. A timeout is reported as an error so the caller
    /// knows teardown was not clean.
    pub async fn close_all_connections(&self) -> Result<()> {
        let mut links = self.store.clients();
        links.extend(self.lifecycle.drain_pending());
        debug!("closing {} broker connections", links.len());

        let teardown = futures::future::join_all(links.iter().map(|link| link.end(true)));
        let finished = tokio::time::timeout(self.config.shutdown_timeout, teardown).await;

        self.cancel.cancel();

        match finished {
            Ok(_) => {
                for robot in self.store.robot_names() {
                    let _ = self.store.delete_all_ips_for_robot(&robot);
                }
                Ok(())
            }
            Err(_) => Err(Error::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }
}

impl Drop for NotifyHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
