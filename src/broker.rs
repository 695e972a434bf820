//! Broker client adapter over rumqttc.
//!
//! Wraps the MQTT 5 client behind two small traits so the connection and
//! subscription managers never touch the transport directly:
//! - [`Connector`] opens a connection to one host and spawns its event loop
//! - [`BrokerLink`] is the per-connection handle (subscribe/unsubscribe/end)
//!
//! The event loop forwards transport events outward as [`HostEvent`]s and
//! correlates SUBACK/UNSUBACK packet ids back to the topics that requested
//! them, so acknowledgments can be recorded per topic in the store.

use crate::error::{Error, Result};
use crate::types::{BrokerEvent, HostEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-connection handle handed out by a [`Connector`].
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Issue a network subscribe for the topic.
    async fn subscribe(&self, topic: &str) -> Result<()>;
    /// Issue a network unsubscribe for the topic.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    /// Close the connection. With `force`, tear down without waiting for a
    /// clean DISCONNECT exchange.
    async fn end(&self, force: bool) -> Result<()>;
    /// True while the transport reports an established connection.
    fn is_connected(&self) -> bool;
}

/// Opens broker connections; one implementation per transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start a connection to `host_id`'s broker. Returns the link handle
    /// immediately; connection progress arrives on `events` as
    /// [`BrokerEvent`]s tagged with the host.
    async fn connect(
        &self,
        host_id: &str,
        events: UnboundedSender<HostEvent>,
    ) -> Result<Arc<dyn BrokerLink>>;
}

/// Connection options for dialing a broker.
#[derive(Debug, Clone)]
pub struct Dialer {
    /// Broker port.
    pub port: u16,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Delay before re-polling the transport after an error.
    pub reconnect_delay: Duration,
    /// Bound on the initial connect.
    pub connect_timeout: Duration,
    /// Client ID (defaults to a random UUID-based id).
    pub id: Option<String>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            port: 1883,
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            id: None,
        }
    }
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the keep-alive interval.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the delay before re-polling after a transport error.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the bound on the initial connect.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the client ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// In-flight subscribe/unsubscribe requests awaiting broker acknowledgment.
///
/// Topics queue in issue order; the outgoing packet event claims a packet id
/// for the queue head, and the matching ack resolves it back to the topic.
#[derive(Default)]
struct AckQueue {
    queued: VecDeque<String>,
    sent: HashMap<u16, String>,
}

impl AckQueue {
    fn push(&mut self, topic: &str) {
        self.queued.push_back(topic.to_string());
    }

    fn drop_queued(&mut self, topic: &str) {
        if let Some(pos) = self.queued.iter().position(|t| t == topic) {
            let _ = self.queued.remove(pos);
        }
    }

    fn mark_sent(&mut self, pkid: u16) {
        if let Some(topic) = self.queued.pop_front() {
            self.sent.insert(pkid, topic);
        }
    }

    fn complete(&mut self, pkid: u16) -> Option<String> {
        self.sent.remove(&pkid)
    }
}

/// MQTT 5 connection to one broker host.
pub struct MqttLink {
    client: AsyncClient,
    connected: AtomicBool,
    subs: Mutex<AckQueue>,
    unsubs: Mutex<AckQueue>,
    cancel: CancellationToken,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subs.lock().push(topic);
        if let Err(e) = self.client.subscribe(topic, QoS::ExactlyOnce).await {
            self.subs.lock().drop_queued(topic);
            return Err(Error::Subscribe(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.unsubs.lock().push(topic);
        if let Err(e) = self.client.unsubscribe(topic).await {
            self.unsubs.lock().drop_queued(topic);
            return Err(Error::Subscribe(e.to_string()));
        }
        Ok(())
    }

    async fn end(&self, force: bool) -> Result<()> {
        if !force {
            if let Err(e) = self.client.disconnect().await {
                debug!("disconnect request failed: {}", e);
            }
        }
        self.cancel.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl MqttLink {
    async fn run_event_loop(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        host_id: String,
        events: UnboundedSender<HostEvent>,
        reconnect_delay: Duration,
        connect_timeout: Duration,
    ) {
        // Watchdog for the very first CONNACK; after that, the transport
        // reconnects on its own schedule and the managers react to events.
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let mut connected_once = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("event loop for {} shutting down", host_id);
                    break;
                }
                _ = tokio::time::sleep_until(deadline), if !connected_once => {
                    warn!("connect to {} timed out", host_id);
                    let _ = events.send(HostEvent::new(
                        &host_id,
                        BrokerEvent::Error {
                            detail: "connect timeout".to_string(),
                        },
                    ));
                    break;
                }
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to broker at {}", host_id);
                        connected_once = true;
                        self.connected.store(true, Ordering::SeqCst);
                        let _ = events.send(HostEvent::new(&host_id, BrokerEvent::Connected));
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                        debug!("message from {} on topic {}", host_id, topic);
                        let _ = events.send(HostEvent::new(
                            &host_id,
                            BrokerEvent::Message {
                                topic,
                                payload: Bytes::from(publish.payload.to_vec()),
                            },
                        ));
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        if let Some(topic) = self.subs.lock().complete(ack.pkid) {
                            let _ = events.send(HostEvent::new(
                                &host_id,
                                BrokerEvent::SubAck { topic },
                            ));
                        } else {
                            debug!("suback from {} with no matching request", host_id);
                        }
                    }
                    Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                        if let Some(topic) = self.unsubs.lock().complete(ack.pkid) {
                            let _ = events.send(HostEvent::new(
                                &host_id,
                                BrokerEvent::UnsubAck { topic },
                            ));
                        } else {
                            debug!("unsuback from {} with no matching request", host_id);
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect(frame))) => {
                        warn!(
                            "broker at {} disconnected: {:?}",
                            host_id, frame.reason_code
                        );
                        self.connected.store(false, Ordering::SeqCst);
                        let _ = events.send(HostEvent::new(
                            &host_id,
                            BrokerEvent::Disconnect {
                                reason: format!("{:?}", frame.reason_code),
                            },
                        ));
                    }
                    Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                        self.subs.lock().mark_sent(pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                        self.unsubs.lock().mark_sent(pkid);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("transport error for {}: {}", host_id, e);
                        self.connected.store(false, Ordering::SeqCst);
                        let _ = events.send(HostEvent::new(
                            &host_id,
                            BrokerEvent::Error {
                                detail: e.to_string(),
                            },
                        ));
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        let _ = events.send(HostEvent::new(&host_id, BrokerEvent::Closed));
    }
}

/// [`Connector`] implementation over rumqttc's MQTT 5 client.
pub struct MqttConnector {
    dialer: Dialer,
}

impl MqttConnector {
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        host_id: &str,
        events: UnboundedSender<HostEvent>,
    ) -> Result<Arc<dyn BrokerLink>> {
        let addr = format!("mqtt://{}:{}", host_id, self.dialer.port);
        let url = url::Url::parse(&addr).map_err(|e| Error::Connection(e.to_string()))?;
        let host = url.host_str().unwrap_or(host_id).to_string();
        let port = url.port().unwrap_or(self.dialer.port);

        let id = self
            .dialer
            .id
            .clone()
            .unwrap_or_else(|| format!("fleet-notify-{}", Uuid::new_v4()));

        let mut options = MqttOptions::new(id, host, port);
        options.set_keep_alive(self.dialer.keep_alive);
        options.set_clean_start(true);

        let (client, event_loop) = AsyncClient::new(options, 100);

        let link = Arc::new(MqttLink {
            client,
            connected: AtomicBool::new(false),
            subs: Mutex::new(AckQueue::default()),
            unsubs: Mutex::new(AckQueue::default()),
            cancel: CancellationToken::new(),
        });

        let worker = link.clone();
        let host_id = host_id.to_string();
        let reconnect_delay = self.dialer.reconnect_delay;
        let connect_timeout = self.dialer.connect_timeout;
        tokio::spawn(async move {
            worker
                .run_event_loop(event_loop, host_id, events, reconnect_delay, connect_timeout)
                .await;
        });

        Ok(link)
    }
}
