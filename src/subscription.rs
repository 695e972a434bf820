//! Subscription manager.
//!
//! Lazy subscribe/unsubscribe over the per-host broker connections: a
//! network subscribe is issued only when a topic goes from zero to one
//! interested listener, and a network unsubscribe only when the last
//! listener goes away. Pending-state tracking in the store keeps in-flight
//! requests from being repeated, and intents queued while a host has no
//! live client are replayed when the connection comes up.

use crate::error::{Error, Result};
use crate::store::{ConnectionStore, SubStatus, UnsubStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SubscriptionManager {
    store: Arc<ConnectionStore>,
    /// Interest count per (host, topic); the network subscription lives
    /// while the count is non-zero.
    interests: Mutex<HashMap<(String, String), usize>>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<ConnectionStore>) -> Self {
        Self {
            store,
            interests: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `topic` on `host_id`, subscribing over the
    /// network only for the first listener.
    ///
    /// Fails with [`Error::HostNotConnected`] when the host has no store
    /// entry (never discovered, or already torn down).
    pub async fn subscribe(&self, host_id: &str, topic: &str) -> Result<()> {
        if self.store.robot_name_of(host_id).is_none() {
            return Err(Error::HostNotConnected(host_id.to_string()));
        }

        let count = {
            let mut interests = self.interests.lock();
            let count = interests
                .entry((host_id.to_string(), topic.to_string()))
                .or_insert(0);
            *count += 1;
            *count
        };

        if self.store.is_active_sub(host_id, topic) || self.store.is_pending_sub(host_id, topic) {
            debug!(
                "subscribe to {}:{} already in place ({} listeners)",
                host_id, topic, count
            );
            return Ok(());
        }

        self.store.set_sub_status(host_id, topic, SubStatus::Pending)?;

        match self.store.get_client(host_id) {
            Some(client) => {
                if let Err(e) = client.subscribe(topic).await {
                    // Stays pending; the connect/reconnect replay picks it up.
                    warn!("subscribe request for {}:{} failed: {}", host_id, topic, e);
                }
            }
            None => {
                debug!(
                    "no live client for {}, queued subscribe to {} for replay",
                    host_id, topic
                );
            }
        }
        Ok(())
    }

    /// Drop one listener's interest in `topic` on `host_id`, unsubscribing
    /// over the network only when no interest remains.
    pub async fn unsubscribe(&self, host_id: &str, topic: &str) -> Result<()> {
        if self.store.robot_name_of(host_id).is_none() {
            return Err(Error::HostNotConnected(host_id.to_string()));
        }

        if !self.store.is_active_sub(host_id, topic) && !self.store.is_pending_sub(host_id, topic)
        {
            debug!("unsubscribe from {}:{} without a subscription", host_id, topic);
            self.interests
                .lock()
                .remove(&(host_id.to_string(), topic.to_string()));
            return Ok(());
        }

        let remaining = {
            let mut interests = self.interests.lock();
            let key = (host_id.to_string(), topic.to_string());
            match interests.get_mut(&key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    if remaining == 0 {
                        interests.remove(&key);
                    }
                    remaining
                }
                None => 0,
            }
        };

        if remaining > 0 {
            debug!(
                "{} listeners still interested in {}:{}",
                remaining, host_id, topic
            );
            return Ok(());
        }

        if self.store.is_pending_unsub(host_id, topic) {
            debug!("unsubscribe from {}:{} already in flight", host_id, topic);
            return Ok(());
        }

        self.store
            .set_unsub_status(host_id, topic, UnsubStatus::Pending)?;

        if let Some(client) = self.store.get_client(host_id) {
            if let Err(e) = client.unsubscribe(topic).await {
                warn!("unsubscribe request for {}:{} failed: {}", host_id, topic, e);
            }
        }
        Ok(())
    }

    /// Forget every interest recorded for a host. Called after teardown so a
    /// rediscovered host starts from a clean slate.
    pub fn clear_host(&self, host_id: &str) {
        self.interests
            .lock()
            .retain(|(host, _), _| host.as_str() != host_id);
    }
}
