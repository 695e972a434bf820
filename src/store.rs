//! Connection store.
//!
//! In-memory map from host identifier (IP or hostname) to broker connection
//! state. Several host identifiers may alias to one entry when discovery
//! reports the same robot under more than one IP; at most one live client
//! exists per robot name.
//!
//! All mutations are synchronous and return plain `Result`s so they compose
//! with the asynchronous broker callbacks that justify them. The store never
//! performs I/O; closing clients is the lifecycle manager's job.

use crate::broker::BrokerLink;
use crate::error::{Error, Result};
use crate::types::FailureKind;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Subscribe-side status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStatus {
    /// Subscribe issued, not yet acknowledged by the broker.
    Pending,
    /// The broker acknowledged the subscribe.
    Subscribed,
}

/// Unsubscribe-side status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubStatus {
    /// Unsubscribe issued, not yet acknowledged by the broker.
    Pending,
    /// The broker acknowledged the unsubscribe.
    Unsubscribed,
}

/// Per-robot connection state. Shared by every host id aliased to the robot.
#[derive(Default)]
struct HostConnection {
    client: Option<Arc<dyn BrokerLink>>,
    subscriptions: HashSet<String>,
    pending_subs: HashSet<String>,
    pending_unsubs: HashSet<String>,
}

#[derive(Default)]
struct StoreInner {
    /// host id -> robot name.
    aliases: HashMap<String, String>,
    /// robot name -> connection state.
    robots: HashMap<String, HostConnection>,
    /// host id -> last failure classification. Survives entry removal so a
    /// rolled-back connect attempt can still be reported to the UI; cleared
    /// when a connection to the host succeeds.
    failures: HashMap<String, FailureKind>,
}

impl StoreInner {
    fn robot_of(&self, host_id: &str) -> Result<&str> {
        self.aliases
            .get(host_id)
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(host_id.to_string()))
    }

    fn connection(&self, host_id: &str) -> Result<&HostConnection> {
        let robot = self.robot_of(host_id)?.to_string();
        self.robots
            .get(&robot)
            .ok_or_else(|| Error::NotFound(host_id.to_string()))
    }

    fn connection_mut(&mut self, host_id: &str) -> Result<&mut HostConnection> {
        let robot = self.robot_of(host_id)?.to_string();
        self.robots
            .get_mut(&robot)
            .ok_or_else(|| Error::NotFound(host_id.to_string()))
    }
}

/// Process-scoped store of broker connection state, explicitly constructed
/// and handed to the lifecycle and subscription managers.
#[derive(Default)]
pub struct ConnectionStore {
    inner: RwLock<StoreInner>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty entry for a newly discovered host.
    ///
    /// Entries are created before the connect call is issued, which closes
    /// the window where two rapid discovery ticks could both see "no entry"
    /// and race duplicate connects to the same robot.
    pub fn set_pending_connection(&self, host_id: &str, robot_name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.robots.contains_key(robot_name) || inner.aliases.contains_key(host_id) {
            return Err(Error::AlreadyConnected(host_id.to_string()));
        }
        inner
            .aliases
            .insert(host_id.to_string(), robot_name.to_string());
        inner
            .robots
            .insert(robot_name.to_string(), HostConnection::default());
        Ok(())
    }

    /// Point `host_id` at the existing entry for `robot_name` instead of
    /// opening a second connection.
    pub fn associate_ip_with_existing_host(&self, host_id: &str, robot_name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.robots.contains_key(robot_name) {
            return Err(Error::NotFound(robot_name.to_string()));
        }
        inner
            .aliases
            .insert(host_id.to_string(), robot_name.to_string());
        Ok(())
    }

    /// Attach a live client handle once the broker has acknowledged the
    /// connection. Rejects double-assignment from racing connect attempts.
    pub fn set_connected(&self, host_id: &str, client: Arc<dyn BrokerLink>) -> Result<()> {
        let mut inner = self.inner.write();
        let conn = inner.connection_mut(host_id)?;
        if conn.client.is_some() {
            return Err(Error::AlreadyConnected(host_id.to_string()));
        }
        conn.client = Some(client);
        // A live connection ends the failure episode for every alias.
        let robot = inner.robot_of(host_id)?.to_string();
        let ips: Vec<String> = inner
            .aliases
            .iter()
            .filter(|(_, name)| **name == robot)
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in ips {
            inner.failures.remove(&ip);
        }
        Ok(())
    }

    /// Record a classified connect/transport failure for the host.
    pub fn set_failed_connection(&self, host_id: &str, error_text: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.robot_of(host_id)?;
        let kind = FailureKind::classify(error_text);
        inner.failures.insert(host_id.to_string(), kind);
        Ok(())
    }

    /// Current failure classification for the host, if any.
    ///
    /// Reading a `ConnectionRefused` demotes it to `ConnectionFailed`, so
    /// refused-port reporting fires exactly once per failure episode.
    pub fn get_failed_connection_status(&self, host_id: &str) -> Result<Option<FailureKind>> {
        let mut inner = self.inner.write();
        match inner.failures.get(host_id).copied() {
            Some(FailureKind::ConnectionRefused) => {
                debug!("demoting one-shot refused status for {}", host_id);
                inner
                    .failures
                    .insert(host_id.to_string(), FailureKind::ConnectionFailed);
                Ok(Some(FailureKind::ConnectionRefused))
            }
            other => Ok(other),
        }
    }

    /// Record a subscribe-side transition for a topic.
    pub fn set_sub_status(&self, host_id: &str, topic: &str, status: SubStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let conn = inner.connection_mut(host_id)?;
        match status {
            SubStatus::Pending => {
                if !conn.subscriptions.contains(topic) {
                    conn.pending_subs.insert(topic.to_string());
                }
            }
            SubStatus::Subscribed => {
                conn.pending_subs.remove(topic);
                conn.subscriptions.insert(topic.to_string());
            }
        }
        Ok(())
    }

    /// Record an unsubscribe-side transition for a topic.
    pub fn set_unsub_status(&self, host_id: &str, topic: &str, status: UnsubStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let conn = inner.connection_mut(host_id)?;
        match status {
            UnsubStatus::Pending => {
                conn.pending_unsubs.insert(topic.to_string());
            }
            UnsubStatus::Unsubscribed => {
                conn.subscriptions.remove(topic);
                conn.pending_subs.remove(topic);
                conn.pending_unsubs.remove(topic);
            }
        }
        Ok(())
    }

    /// Remove every alias sharing a robot name with `host_id`.
    ///
    /// Returns the removed host ids. The client handle is dropped from the
    /// store but not closed here.
    pub fn delete_all_ips_for_host(&self, host_id: &str) -> Result<Vec<String>> {
        let robot = {
            let inner = self.inner.read();
            inner.robot_of(host_id)?.to_string()
        };
        self.delete_all_ips_for_robot(&robot)
    }

    /// Remove the robot's entry and every host id aliased to it.
    pub fn delete_all_ips_for_robot(&self, robot_name: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        if inner.robots.remove(robot_name).is_none() {
            return Err(Error::NotFound(robot_name.to_string()));
        }
        let mut removed: Vec<String> = inner
            .aliases
            .iter()
            .filter(|(_, name)| name.as_str() == robot_name)
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in &removed {
            inner.aliases.remove(ip);
        }
        removed.sort();
        Ok(removed)
    }

    /// The client handle for the host, if a connection is attached.
    pub fn get_client(&self, host_id: &str) -> Option<Arc<dyn BrokerLink>> {
        let inner = self.inner.read();
        inner.connection(host_id).ok().and_then(|c| c.client.clone())
    }

    /// Host ids with no recorded failure.
    pub fn get_reachable_hosts(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut hosts: Vec<String> = inner
            .aliases
            .keys()
            .filter(|ip| !inner.failures.contains_key(*ip))
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }

    /// Every host id sharing a robot name with `host_id` (itself included).
    pub fn get_associated_ips_from_ip(&self, host_id: &str) -> Vec<String> {
        match self.robot_name_of(host_id) {
            Some(robot) => self.get_associated_ips_from_robot_name(&robot),
            None => Vec::new(),
        }
    }

    /// Every host id aliased to the robot.
    pub fn get_associated_ips_from_robot_name(&self, robot_name: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut ips: Vec<String> = inner
            .aliases
            .iter()
            .filter(|(_, name)| name.as_str() == robot_name)
            .map(|(ip, _)| ip.clone())
            .collect();
        ips.sort();
        ips
    }

    /// The robot name `host_id` is aliased to, if known.
    pub fn robot_name_of(&self, host_id: &str) -> Option<String> {
        self.inner.read().aliases.get(host_id).cloned()
    }

    /// Every robot name with a store entry.
    pub fn robot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().robots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every known host id.
    pub fn known_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.inner.read().aliases.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Every attached client handle, one per robot.
    pub fn clients(&self) -> Vec<Arc<dyn BrokerLink>> {
        self.inner
            .read()
            .robots
            .values()
            .filter_map(|c| c.client.clone())
            .collect()
    }

    /// True when a client is attached and its transport reports connected.
    pub fn is_connected_to_broker(&self, host_id: &str) -> bool {
        let inner = self.inner.read();
        inner
            .connection(host_id)
            .ok()
            .and_then(|c| c.client.as_ref())
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// True while no failure is recorded for the host.
    pub fn is_broker_reachable(&self, host_id: &str) -> bool {
        !self.inner.read().failures.contains_key(host_id)
    }

    pub fn is_pending_sub(&self, host_id: &str, topic: &str) -> bool {
        let inner = self.inner.read();
        inner
            .connection(host_id)
            .map(|c| c.pending_subs.contains(topic))
            .unwrap_or(false)
    }

    pub fn is_active_sub(&self, host_id: &str, topic: &str) -> bool {
        let inner = self.inner.read();
        inner
            .connection(host_id)
            .map(|c| c.subscriptions.contains(topic))
            .unwrap_or(false)
    }

    pub fn is_pending_unsub(&self, host_id: &str, topic: &str) -> bool {
        let inner = self.inner.read();
        inner
            .connection(host_id)
            .map(|c| c.pending_unsubs.contains(topic))
            .unwrap_or(false)
    }

    /// Topics with a live or in-flight subscription for the host.
    pub fn interested_topics(&self, host_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        match inner.connection(host_id) {
            Ok(conn) => {
                let mut topics: Vec<String> = conn
                    .subscriptions
                    .union(&conn.pending_subs)
                    .cloned()
                    .collect();
                topics.sort();
                topics
            }
            Err(_) => Vec::new(),
        }
    }
}
