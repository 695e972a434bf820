//! Crate-level scenario tests.
//!
//! Drive the lifecycle and subscription managers through a mock transport
//! that records every network-level call and lets the tests play broker
//! events by hand. Unit tests for individual components live in their own
//! modules.

use crate::bridge::{EventBridge, NotifyEvent};
use crate::broker::{BrokerLink, Connector};
use crate::discovery::DiscoveredRobot;
use crate::error::{Error, Result};
use crate::hub::{NotifyConfig, NotifyHub};
use crate::lifecycle::LifecycleManager;
use crate::store::ConnectionStore;
use crate::subscription::SubscriptionManager;
use crate::types::{BrokerEvent, FailureKind, HostEvent};
use crate::Action;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Network-level calls observed by the mock transport.
#[derive(Default)]
struct Recorder {
    connects: Mutex<Vec<String>>,
    subscribes: Mutex<Vec<(String, String)>>,
    unsubscribes: Mutex<Vec<(String, String)>>,
    ends: Mutex<Vec<String>>,
}

struct MockLink {
    host_id: String,
    connected: AtomicBool,
    recorder: Arc<Recorder>,
    hang_on_end: bool,
}

#[async_trait]
impl BrokerLink for MockLink {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.recorder
            .subscribes
            .lock()
            .push((self.host_id.clone(), topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.recorder
            .unsubscribes
            .lock()
            .push((self.host_id.clone(), topic.to_string()));
        Ok(())
    }

    async fn end(&self, _force: bool) -> Result<()> {
        if self.hang_on_end {
            futures::future::pending::<()>().await;
        }
        self.recorder.ends.lock().push(self.host_id.clone());
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MockConnector {
    recorder: Arc<Recorder>,
    links: Mutex<HashMap<String, Arc<MockLink>>>,
}

impl MockConnector {
    fn new(recorder: Arc<Recorder>) -> Arc<Self> {
        Arc::new(Self {
            recorder,
            links: Mutex::new(HashMap::new()),
        })
    }

    /// Flip the transport-level connected flag, as a CONNACK would.
    fn go_online(&self, host_id: &str) {
        self.links.lock()[host_id]
            .connected
            .store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host_id: &str,
        _events: UnboundedSender<HostEvent>,
    ) -> Result<Arc<dyn BrokerLink>> {
        self.recorder.connects.lock().push(host_id.to_string());
        let link = Arc::new(MockLink {
            host_id: host_id.to_string(),
            connected: AtomicBool::new(false),
            recorder: self.recorder.clone(),
            hang_on_end: false,
        });
        self.links.lock().insert(host_id.to_string(), link.clone());
        Ok(link)
    }
}

struct Fixture {
    store: Arc<ConnectionStore>,
    lifecycle: LifecycleManager,
    subs: SubscriptionManager,
    connector: Arc<MockConnector>,
    recorder: Arc<Recorder>,
    notify_rx: UnboundedReceiver<NotifyEvent>,
    _events_rx: UnboundedReceiver<HostEvent>,
}

fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let recorder = Arc::new(Recorder::default());
    let connector = MockConnector::new(recorder.clone());
    let store = Arc::new(ConnectionStore::new());
    let (bridge, notify_rx) = EventBridge::new();
    let (events_tx, events_rx) = unbounded_channel();

    let lifecycle = LifecycleManager::new(
        store.clone(),
        connector.clone(),
        events_tx,
        bridge,
    );
    let subs = SubscriptionManager::new(store.clone());

    Fixture {
        store,
        lifecycle,
        subs,
        connector,
        recorder,
        notify_rx,
        _events_rx: events_rx,
    }
}

fn otie() -> DiscoveredRobot {
    DiscoveredRobot::new("otie", "10.0.0.5").healthy()
}

/// Run one discovery tick for the robot and complete its connect handshake.
async fn connect_robot(fx: &Fixture, robot: &DiscoveredRobot) {
    fx.lifecycle.update_robots(&[robot.clone()]).await;
    fx.connector.go_online(&robot.ip);
    fx.lifecycle
        .on_event(&robot.ip, BrokerEvent::Connected)
        .await;
}

#[tokio::test]
async fn discovery_tick_connects_new_robot() {
    let fx = fixture();

    fx.lifecycle.update_robots(&[otie()]).await;

    // Pending: entry exists, connect dispatched, no client attached yet.
    assert_eq!(fx.store.robot_name_of("10.0.0.5"), Some("otie".to_string()));
    assert_eq!(*fx.recorder.connects.lock(), vec!["10.0.0.5".to_string()]);
    assert!(!fx.store.is_connected_to_broker("10.0.0.5"));

    fx.connector.go_online("10.0.0.5");
    fx.lifecycle
        .on_event("10.0.0.5", BrokerEvent::Connected)
        .await;

    assert!(fx.store.is_connected_to_broker("10.0.0.5"));
    assert!(fx.store.get_client("10.0.0.5").is_some());
}

#[tokio::test]
async fn unreachable_robot_is_not_connected() {
    let fx = fixture();

    fx.lifecycle
        .update_robots(&[DiscoveredRobot::new("otie", "10.0.0.5")])
        .await;

    assert!(fx.store.robot_name_of("10.0.0.5").is_none());
    assert!(fx.recorder.connects.lock().is_empty());
}

#[tokio::test]
async fn second_ip_aliases_instead_of_reconnecting() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;

    // Same robot shows up on a second NIC in a later tick.
    fx.lifecycle
        .update_robots(&[
            otie(),
            DiscoveredRobot::new("otie", "10.0.0.6").healthy(),
        ])
        .await;

    assert_eq!(*fx.recorder.connects.lock(), vec!["10.0.0.5".to_string()]);
    assert_eq!(
        fx.store.get_associated_ips_from_robot_name("otie"),
        vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]
    );
    // The alias shares the connection.
    assert!(fx.store.is_connected_to_broker("10.0.0.6"));
}

#[tokio::test]
async fn same_tick_duplicate_ips_open_one_socket() {
    let fx = fixture();

    fx.lifecycle
        .update_robots(&[
            otie(),
            DiscoveredRobot::new("otie", "10.0.0.6").healthy(),
        ])
        .await;

    assert_eq!(*fx.recorder.connects.lock(), vec!["10.0.0.5".to_string()]);
    assert_eq!(
        fx.store.get_associated_ips_from_robot_name("otie"),
        vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]
    );
}

#[tokio::test]
async fn duplicate_subscribe_issues_one_network_call() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;

    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();
    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();

    assert_eq!(
        *fx.recorder.subscribes.lock(),
        vec![("10.0.0.5".to_string(), "runs".to_string())]
    );
    assert!(fx.store.is_pending_sub("10.0.0.5", "runs"));

    // Only the broker ack confirms the subscription.
    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::SubAck {
                topic: "runs".to_string(),
            },
        )
        .await;
    assert!(fx.store.is_active_sub("10.0.0.5", "runs"));
    assert!(!fx.store.is_pending_sub("10.0.0.5", "runs"));
}

#[tokio::test]
async fn unsubscribe_waits_for_last_listener() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;

    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();
    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();
    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::SubAck {
                topic: "runs".to_string(),
            },
        )
        .await;

    // First listener leaves: the network subscription stays.
    fx.subs.unsubscribe("10.0.0.5", "runs").await.unwrap();
    assert!(fx.recorder.unsubscribes.lock().is_empty());
    assert!(fx.store.is_active_sub("10.0.0.5", "runs"));

    // Last listener leaves: unsubscribe goes out, ack completes it.
    fx.subs.unsubscribe("10.0.0.5", "runs").await.unwrap();
    assert_eq!(
        *fx.recorder.unsubscribes.lock(),
        vec![("10.0.0.5".to_string(), "runs".to_string())]
    );
    assert!(fx.store.is_pending_unsub("10.0.0.5", "runs"));

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::UnsubAck {
                topic: "runs".to_string(),
            },
        )
        .await;
    assert!(!fx.store.is_active_sub("10.0.0.5", "runs"));
    assert!(!fx.store.is_pending_unsub("10.0.0.5", "runs"));
}

#[tokio::test]
async fn unsubscribe_without_subscription_is_a_noop() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;

    fx.subs.unsubscribe("10.0.0.5", "runs").await.unwrap();
    assert!(fx.recorder.unsubscribes.lock().is_empty());
}

#[tokio::test]
async fn subscribe_to_unknown_host_fails() {
    let fx = fixture();

    let result = fx.subs.subscribe("10.9.9.9", "runs").await;
    assert!(matches!(result, Err(Error::HostNotConnected(_))));
    assert!(fx.recorder.subscribes.lock().is_empty());
}

#[tokio::test]
async fn subscribe_while_connect_pending_is_replayed_on_connack() {
    let fx = fixture();
    fx.lifecycle.update_robots(&[otie()]).await;

    // No client attached yet: the intent queues, nothing hits the network.
    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();
    assert!(fx.recorder.subscribes.lock().is_empty());
    assert!(fx.store.is_pending_sub("10.0.0.5", "runs"));

    fx.connector.go_online("10.0.0.5");
    fx.lifecycle
        .on_event("10.0.0.5", BrokerEvent::Connected)
        .await;

    assert_eq!(
        *fx.recorder.subscribes.lock(),
        vec![("10.0.0.5".to_string(), "runs".to_string())]
    );
}

#[tokio::test]
async fn reconnect_replays_confirmed_subscriptions() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;

    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();
    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::SubAck {
                topic: "runs".to_string(),
            },
        )
        .await;
    assert_eq!(fx.recorder.subscribes.lock().len(), 1);

    // Clean-start reconnect: the broker has forgotten the session.
    fx.lifecycle
        .on_event("10.0.0.5", BrokerEvent::Connected)
        .await;

    assert_eq!(
        *fx.recorder.subscribes.lock(),
        vec![
            ("10.0.0.5".to_string(), "runs".to_string()),
            ("10.0.0.5".to_string(), "runs".to_string()),
        ]
    );
}

#[tokio::test]
async fn failed_connect_rolls_back_the_eager_entry() {
    let fx = fixture();
    fx.lifecycle.update_robots(&[otie()]).await;

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::Error {
                detail: "Connection refused (os error 111)".to_string(),
            },
        )
        .await;

    // Entry is gone so the next tick can retry cleanly.
    assert!(fx.store.robot_name_of("10.0.0.5").is_none());

    fx.lifecycle.update_robots(&[otie()]).await;
    assert_eq!(
        *fx.recorder.connects.lock(),
        vec!["10.0.0.5".to_string(), "10.0.0.5".to_string()]
    );
}

#[tokio::test]
async fn failed_connect_surfaces_queued_topics() {
    let mut fx = fixture();
    fx.lifecycle.update_robots(&[otie()]).await;
    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::Error {
                detail: "Connection refused (os error 111)".to_string(),
            },
        )
        .await;

    let event = fx.notify_rx.try_recv().unwrap();
    assert_eq!(event.to_wire(), "10.0.0.5:runs:ECONNREFUSED");
    assert!(fx.store.robot_name_of("10.0.0.5").is_none());
}

#[tokio::test]
async fn refused_connection_reports_once() {
    let fx = fixture();
    fx.lifecycle.update_robots(&[otie()]).await;

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::Error {
                detail: "Connection refused (os error 111)".to_string(),
            },
        )
        .await;

    assert_eq!(
        fx.store.get_failed_connection_status("10.0.0.5").unwrap(),
        Some(FailureKind::ConnectionRefused)
    );
    assert_eq!(
        fx.store.get_failed_connection_status("10.0.0.5").unwrap(),
        Some(FailureKind::ConnectionFailed)
    );
}

#[tokio::test]
async fn transport_error_surfaces_per_topic_and_closes() {
    let mut fx = fixture();
    connect_robot(&fx, &otie()).await;
    fx.lifecycle
        .update_robots(&[otie(), DiscoveredRobot::new("otie", "10.0.0.6").healthy()])
        .await;

    fx.subs.subscribe("10.0.0.5", "runs").await.unwrap();
    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::SubAck {
                topic: "runs".to_string(),
            },
        )
        .await;

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::Error {
                detail: "broken pipe".to_string(),
            },
        )
        .await;

    let event = fx.notify_rx.try_recv().unwrap();
    assert_eq!(event.to_wire(), "10.0.0.5:runs:ECONNFAILED");
    assert_eq!(*fx.recorder.ends.lock(), vec!["10.0.0.5".to_string()]);

    // The link's terminal close removes the entry and every alias.
    fx.lifecycle.on_event("10.0.0.5", BrokerEvent::Closed).await;
    assert!(fx.store.robot_name_of("10.0.0.5").is_none());
    assert!(fx.store.robot_name_of("10.0.0.6").is_none());
}

#[tokio::test]
async fn broker_message_reaches_the_bridge() {
    let mut fx = fixture();
    connect_robot(&fx, &otie()).await;

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::Message {
                topic: "robot-server/runs".to_string(),
                payload: Bytes::from("{\"current\":true}"),
            },
        )
        .await;

    let event = fx.notify_rx.try_recv().unwrap();
    assert_eq!(
        event.to_wire(),
        "10.0.0.5:robot-server/runs:{\"current\":true}"
    );
}

#[tokio::test]
async fn disconnect_alone_keeps_the_entry() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;

    fx.lifecycle
        .on_event(
            "10.0.0.5",
            BrokerEvent::Disconnect {
                reason: "ServerShuttingDown".to_string(),
            },
        )
        .await;

    assert_eq!(fx.store.robot_name_of("10.0.0.5"), Some("otie".to_string()));
}

#[tokio::test]
async fn vanished_robot_is_torn_down_with_aliases() {
    let fx = fixture();
    connect_robot(&fx, &otie()).await;
    fx.lifecycle
        .update_robots(&[otie(), DiscoveredRobot::new("otie", "10.0.0.6").healthy()])
        .await;

    fx.lifecycle.clean_up_unreachable_robots(&[]).await;

    assert_eq!(*fx.recorder.ends.lock(), vec!["10.0.0.5".to_string()]);
    assert!(fx.store.robot_name_of("10.0.0.5").is_none());
    assert!(fx.store.robot_name_of("10.0.0.6").is_none());
    assert!(fx.store.robot_names().is_empty());
}

#[tokio::test]
async fn hub_routes_actions_to_the_default_host() {
    let recorder = Arc::new(Recorder::default());
    let connector = MockConnector::new(recorder.clone());
    let config = NotifyConfig::new().with_default_host("127.0.0.1");
    let (hub, mut notify_rx) = NotifyHub::with_connector(connector, config);

    // Nothing discovered for the fixed host: the subscribe surfaces a
    // connection-failed signal instead of being dropped.
    hub.handle_action(Action::Subscribe {
        topic: "robot-server/runs".to_string(),
        host: None,
    })
    .await;

    let event = notify_rx.try_recv().unwrap();
    assert_eq!(event.to_wire(), "127.0.0.1:robot-server/runs:ECONNFAILED");
}

#[tokio::test]
async fn hub_surfaces_refused_status_for_failed_host() {
    let recorder = Arc::new(Recorder::default());
    let connector = MockConnector::new(recorder.clone());
    let (hub, mut notify_rx) = NotifyHub::with_connector(connector, NotifyConfig::default());

    let store = hub.store();
    store.set_pending_connection("10.0.0.5", "otie").unwrap();
    store
        .set_failed_connection("10.0.0.5", "Connection refused (os error 111)")
        .unwrap();
    store.delete_all_ips_for_host("10.0.0.5").unwrap();

    hub.handle_action(Action::Subscribe {
        topic: "runs".to_string(),
        host: Some("10.0.0.5".to_string()),
    })
    .await;
    hub.handle_action(Action::Subscribe {
        topic: "runs".to_string(),
        host: Some("10.0.0.5".to_string()),
    })
    .await;

    // Refused fires once, then demotes to the generic failure.
    assert_eq!(
        notify_rx.try_recv().unwrap().to_wire(),
        "10.0.0.5:runs:ECONNREFUSED"
    );
    assert_eq!(
        notify_rx.try_recv().unwrap().to_wire(),
        "10.0.0.5:runs:ECONNFAILED"
    );
}

#[tokio::test]
async fn close_all_connections_tears_everything_down() {
    let recorder = Arc::new(Recorder::default());
    let connector = MockConnector::new(recorder.clone());
    let (hub, _notify_rx) = NotifyHub::with_connector(connector, NotifyConfig::default());

    let link = Arc::new(MockLink {
        host_id: "10.0.0.5".to_string(),
        connected: AtomicBool::new(true),
        recorder: recorder.clone(),
        hang_on_end: false,
    });
    hub.store().set_pending_connection("10.0.0.5", "otie").unwrap();
    hub.store().set_connected("10.0.0.5", link).unwrap();

    hub.close_all_connections().await.unwrap();

    assert_eq!(*recorder.ends.lock(), vec!["10.0.0.5".to_string()]);
    assert!(hub.store().robot_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_all_connections_reports_hung_teardown() {
    let recorder = Arc::new(Recorder::default());
    let connector = MockConnector::new(recorder.clone());
    let (hub, _notify_rx) = NotifyHub::with_connector(connector, NotifyConfig::default());

    let link = Arc::new(MockLink {
        host_id: "10.0.0.5".to_string(),
        connected: AtomicBool::new(true),
        recorder: recorder.clone(),
        hang_on_end: true,
    });
    hub.store().set_pending_connection("10.0.0.5", "otie").unwrap();
    hub.store().set_connected("10.0.0.5", link).unwrap();

    let result = hub.close_all_connections().await;
    assert!(matches!(result, Err(Error::ShutdownTimeout(_))));
}
