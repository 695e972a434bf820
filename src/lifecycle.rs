//! Connection lifecycle manager.
//!
//! Reconciles the discovery feed against the store: newly reachable hosts
//! get a connection, second IPs for an already-tracked robot alias to the
//! existing entry instead of opening a second socket, and hosts that drop
//! out of the feed are torn down. Broker events drive the per-host state
//! transitions (attach on CONNACK, roll back a failed connect, force-close
//! on transport errors, final cleanup on close).

use crate::bridge::{EventBridge, NotifyEvent};
use crate::broker::{BrokerLink, Connector};
use crate::discovery::{reachable_names, DiscoveredRobot};
use crate::store::{ConnectionStore, SubStatus, UnsubStatus};
use crate::types::{BrokerEvent, FailureKind, HostEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

pub struct LifecycleManager {
    store: Arc<ConnectionStore>,
    connector: Arc<dyn Connector>,
    events_tx: UnboundedSender<HostEvent>,
    bridge: EventBridge,
    /// Links dialed but not yet acknowledged by the broker. Parked here so
    /// the store only ever holds clients that completed their CONNACK.
    pending: Mutex<HashMap<String, Arc<dyn BrokerLink>>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<ConnectionStore>,
        connector: Arc<dyn Connector>,
        events_tx: UnboundedSender<HostEvent>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            store,
            connector,
            events_tx,
            bridge,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to every newly reachable host in the feed.
    ///
    /// A second IP for an already-tracked robot is aliased to the existing
    /// entry; only the first-seen IP per robot name gets a real connection.
    pub async fn update_robots(&self, robots: &[DiscoveredRobot]) {
        for robot in robots.iter().filter(|r| r.is_reachable()) {
            if self.store.robot_name_of(&robot.ip).is_some() {
                continue;
            }

            if !self
                .store
                .get_associated_ips_from_robot_name(&robot.name)
                .is_empty()
            {
                match self
                    .store
                    .associate_ip_with_existing_host(&robot.ip, &robot.name)
                {
                    Ok(()) => debug!(
                        "aliased {} to existing connection for {}",
                        robot.ip, robot.name
                    ),
                    Err(e) => warn!("could not alias {}: {}", robot.ip, e),
                }
                continue;
            }

            // Entry goes in before the connect call so a second discovery
            // tick cannot race a duplicate connect to the same robot.
            if let Err(e) = self.store.set_pending_connection(&robot.ip, &robot.name) {
                debug!("skipping {}: {}", robot.ip, e);
                continue;
            }

            info!("connecting to {} at {}", robot.name, robot.ip);
            match self
                .connector
                .connect(&robot.ip, self.events_tx.clone())
                .await
            {
                Ok(link) => {
                    self.pending.lock().insert(robot.ip.clone(), link);
                }
                Err(e) => {
                    warn!("connect dispatch to {} failed: {}", robot.ip, e);
                    let _ = self.store.set_failed_connection(&robot.ip, &e.to_string());
                    let _ = self.store.delete_all_ips_for_host(&robot.ip);
                }
            }
        }
    }

    /// Tear down every robot the feed no longer reports as reachable.
    pub async fn clean_up_unreachable_robots(&self, robots: &[DiscoveredRobot]) {
        let reachable = reachable_names(robots);
        for robot_name in self.store.robot_names() {
            if reachable.contains(robot_name.as_str()) {
                continue;
            }
            info!("{} no longer reachable, closing its connection", robot_name);

            let ips = self.store.get_associated_ips_from_robot_name(&robot_name);
            // Teardown is requested before the store entries go away.
            for ip in &ips {
                let link = self.pending.lock().remove(ip);
                if let Some(link) = link {
                    let _ = link.end(true).await;
                }
            }
            if let Some(ip) = ips.first() {
                if let Some(client) = self.store.get_client(ip) {
                    let _ = client.end(true).await;
                }
            }
            let _ = self.store.delete_all_ips_for_robot(&robot_name);
        }
    }

    /// Apply one broker event to the per-host state machine.
    pub async fn on_event(&self, host_id: &str, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                if let Some(link) = self.pending.lock().remove(host_id) {
                    match self.store.set_connected(host_id, link) {
                        Ok(()) => info!("broker connection up for {}", host_id),
                        Err(e) => debug!("late connect callback for {}: {}", host_id, e),
                    }
                }
                self.replay_subscriptions(host_id).await;
            }
            BrokerEvent::SubAck { topic } => {
                if let Err(e) = self
                    .store
                    .set_sub_status(host_id, &topic, SubStatus::Subscribed)
                {
                    debug!("late suback for {}:{}: {}", host_id, topic, e);
                }
            }
            BrokerEvent::UnsubAck { topic } => {
                if let Err(e) =
                    self.store
                        .set_unsub_status(host_id, &topic, UnsubStatus::Unsubscribed)
                {
                    debug!("late unsuback for {}:{}: {}", host_id, topic, e);
                }
            }
            BrokerEvent::Message { topic, payload } => {
                self.bridge
                    .notify(NotifyEvent::message(host_id, topic, payload));
            }
            BrokerEvent::Disconnect { reason } => {
                warn!("broker-initiated disconnect for {}: {}", host_id, reason);
            }
            BrokerEvent::Error { detail } => {
                self.on_transport_error(host_id, &detail).await;
            }
            BrokerEvent::Closed => {
                let _ = self.pending.lock().remove(host_id);
                match self.store.delete_all_ips_for_host(host_id) {
                    Ok(removed) => debug!("connection closed, removed hosts {:?}", removed),
                    Err(_) => debug!("close event for untracked host {}", host_id),
                }
            }
        }
    }

    /// Transport errors are fatal for the connection: a pending connect is
    /// rolled back so the next discovery tick retries cleanly, a live
    /// connection is surfaced to the UI and force-closed.
    async fn on_transport_error(&self, host_id: &str, detail: &str) {
        if let Err(e) = self.store.set_failed_connection(host_id, detail) {
            debug!("transport error for untracked host {}: {}", host_id, e);
            return;
        }

        // Every listener already waiting on this host gets the failure;
        // anything else learns about it from its next subscribe attempt.
        let kind = FailureKind::classify(detail);
        for topic in self.store.interested_topics(host_id) {
            self.bridge.notify(NotifyEvent::failure(host_id, &topic, kind));
        }

        if let Some(client) = self.store.get_client(host_id) {
            let _ = client.end(true).await;
            // Store entries go away when the link reports Closed.
        } else {
            let link = self.pending.lock().remove(host_id);
            if let Some(link) = link {
                let _ = link.end(true).await;
            }
            let _ = self.store.delete_all_ips_for_host(host_id);
        }
    }

    /// Re-issue every live or queued subscription for the host. Runs on
    /// each CONNACK: the initial connect picks up intents queued while the
    /// connection was pending, and clean-start reconnects restore what the
    /// broker dropped.
    async fn replay_subscriptions(&self, host_id: &str) {
        let topics = self.store.interested_topics(host_id);
        if topics.is_empty() {
            return;
        }
        if let Some(client) = self.store.get_client(host_id) {
            for topic in topics {
                if let Err(e) = client.subscribe(&topic).await {
                    error!("resubscribe to {}:{} failed: {}", host_id, topic, e);
                }
            }
        }
    }

    /// Hand out every pending (pre-CONNACK) link, clearing the parking map.
    pub(crate) fn drain_pending(&self) -> Vec<Arc<dyn BrokerLink>> {
        self.pending.lock().drain().map(|(_, link)| link).collect()
    }
}
