//! Integration Tests for the MQTT engine
//!
//! Clients are driven through the in-memory `ChannelTransport`, which hands
//! the broker decoded packets the way a codec would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use mqtt_engine::broker::{
    Broker, BrokerConfig, BrokerError, BrokerEvent, ChannelPeer, ChannelTransport,
    ConnectionError,
};
use mqtt_engine::hooks::{
    DisconnectType, HookResult, Hooks, InterceptingPublish, ValidatingConnection,
};
use mqtt_engine::persistence::FileBackend;
use mqtt_engine::protocol::{
    ApplicationMessage, ConnAck, Connect, Disconnect, Packet, Properties, ProtocolError,
    ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, Subscribe, Subscription,
    SubscriptionOptions, Will,
};
use mqtt_engine::session::{DeliveryError, OverflowKind, OverflowStrategy};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

type ConnectionTask = JoinHandle<Result<(), ConnectionError>>;

fn connect_packet(client_id: &str) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        ..Default::default()
    }
}

/// Persistent v5 session that survives its connection for five minutes
fn persistent_connect(client_id: &str, clean_start: bool) -> Connect {
    let mut connect = connect_packet(client_id);
    connect.clean_start = clean_start;
    connect.properties.session_expiry_interval = Some(300);
    connect
}

async fn connect_with(broker: &Broker, connect: Connect) -> (ChannelPeer, ConnectionTask, ConnAck) {
    let (transport, mut peer) = ChannelTransport::pair();
    let task = broker.accept(transport).unwrap();
    assert!(peer.send(Packet::Connect(Box::new(connect))));
    match peer.recv_timeout(WAIT).await {
        Some(Packet::ConnAck(connack)) => (peer, task, connack),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

async fn connect(broker: &Broker, client_id: &str) -> (ChannelPeer, ConnectionTask) {
    let (peer, task, connack) = connect_with(broker, connect_packet(client_id)).await;
    assert_eq!(connack.reason_code, ReasonCode::Success);
    (peer, task)
}

async fn subscribe(peer: &mut ChannelPeer, packet_id: u16, filter: &str, options: SubscriptionOptions) {
    peer.send(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions: vec![Subscription {
            filter: filter.to_string(),
            options,
        }],
        properties: Properties::default(),
    }));
    match peer.recv_timeout(WAIT).await {
        Some(Packet::SubAck(suback)) => {
            assert_eq!(suback.packet_id, packet_id);
            assert!(suback.reason_codes.iter().all(|rc| rc.is_success()));
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

async fn recv_publish(peer: &mut ChannelPeer) -> Publish {
    match peer.recv_timeout(WAIT).await {
        Some(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

async fn disconnect(mut peer: ChannelPeer, task: ConnectionTask) {
    peer.send(Packet::Disconnect(Disconnect::default()));
    assert!(task.await.unwrap().is_ok());
    peer.close();
}

/// Next client lifecycle event, skipping everything else
async fn next_lifecycle(events: &mut broadcast::Receiver<BrokerEvent>) -> BrokerEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed");
        if matches!(
            event,
            BrokerEvent::ClientConnected(_) | BrokerEvent::ClientDisconnected(_)
        ) {
            return event;
        }
    }
}

fn payload_string(publish: &Publish) -> String {
    String::from_utf8_lossy(&publish.payload).into_owned()
}

#[tokio::test]
async fn test_connect_assigns_client_id_and_keep_alive() {
    let broker = Broker::default();
    let mut connect = connect_packet("");
    connect.keep_alive = 0;

    let (_peer, _task, connack) = connect_with(&broker, connect).await;
    assert_eq!(connack.reason_code, ReasonCode::Success);
    assert!(!connack.session_present);
    let assigned = connack.properties.assigned_client_identifier.unwrap();
    assert!(!assigned.is_empty());
    assert_eq!(connack.properties.server_keep_alive, Some(60));
    assert!(broker.client(&assigned).is_some());
}

#[tokio::test]
async fn test_empty_client_id_without_clean_start_rejected() {
    let broker = Broker::default();
    let mut connect = connect_packet("");
    connect.protocol_version = ProtocolVersion::V311;
    connect.clean_start = false;

    let (_peer, task, connack) = connect_with(&broker, connect).await;
    assert_eq!(connack.reason_code, ReasonCode::ClientIdentifierNotValid);
    assert!(matches!(
        task.await.unwrap(),
        Err(ConnectionError::Rejected(ReasonCode::ClientIdentifierNotValid))
    ));
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let broker = Broker::default();
    let (transport, mut peer) = ChannelTransport::pair();
    let task = broker.accept(transport).unwrap();

    peer.send(Packet::PingReq);
    assert_eq!(peer.recv_timeout(WAIT).await, None);
    assert!(matches!(
        task.await.unwrap(),
        Err(ConnectionError::Protocol(ProtocolError::UnexpectedPacket(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let broker = Broker::default();
    let (transport, mut peer) = ChannelTransport::pair();
    let task = broker.accept(transport).unwrap();

    assert_eq!(peer.recv_timeout(Duration::from_secs(30)).await, None);
    assert!(matches!(task.await.unwrap(), Err(ConnectionError::Timeout)));
}

#[tokio::test]
async fn test_publish_subscribe_qos1() {
    let broker = Broker::default();
    let mut events = broker.events();
    let (mut sub, _sub_task) = connect(&broker, "sub").await;
    let (mut publisher, _pub_task) = connect(&broker, "pub").await;

    subscribe(&mut sub, 1, "sensors/+", SubscriptionOptions::with_qos(QoS::AtLeastOnce)).await;

    let mut publish = Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce);
    publish.packet_id = Some(7);
    publisher.send(Packet::Publish(publish));

    match publisher.recv_timeout(WAIT).await {
        Some(Packet::PubAck(puback)) => {
            assert_eq!(puback.packet_id, 7);
            assert_eq!(puback.reason_code, ReasonCode::Success);
        }
        other => panic!("expected PUBACK, got {:?}", other),
    }

    let received = recv_publish(&mut sub).await;
    assert_eq!(&*received.topic, "sensors/temp");
    assert_eq!(received.payload, Bytes::from("21.5"));
    assert_eq!(received.qos, QoS::AtLeastOnce);
    let packet_id = received.packet_id.unwrap();
    sub.send(Packet::PubAck(PubAck::new(packet_id)));

    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let BrokerEvent::ClientAcknowledged(ack) = event {
            assert_eq!(&*ack.client_id, "sub");
            assert_eq!(ack.packet_id, packet_id);
            assert!(ack.is_completed);
            break;
        }
    }
    assert_eq!(broker.session("sub").unwrap().inflight_count(), 0);
}

#[tokio::test]
async fn test_no_matching_subscribers_puback() {
    let broker = Broker::default();
    let (mut publisher, _task) = connect(&broker, "lonely").await;

    let mut publish = Publish::new("nobody/listens", "x", QoS::AtLeastOnce);
    publish.packet_id = Some(1);
    publisher.send(Packet::Publish(publish));

    match publisher.recv_timeout(WAIT).await {
        Some(Packet::PubAck(puback)) => {
            assert_eq!(puback.reason_code, ReasonCode::NoMatchingSubscribers)
        }
        other => panic!("expected PUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_local_subscription() {
    let broker = Broker::default();
    let (mut client, _task) = connect(&broker, "echo").await;

    let options = SubscriptionOptions {
        no_local: true,
        ..Default::default()
    };
    subscribe(&mut client, 1, "chat/#", options).await;

    client.send(Packet::Publish(Publish::new("chat/room", "hello", QoS::AtMostOnce)));
    assert_eq!(client.recv_timeout(QUIET).await, None);
}

#[tokio::test]
async fn test_retained_replay_downgrades_qos() {
    let broker = Broker::default();
    broker
        .inject_application_message(
            ApplicationMessage::new("status/door", "open")
                .with_qos(QoS::AtLeastOnce)
                .with_retain(true),
        )
        .await
        .unwrap();
    assert_eq!(broker.retained_messages().len(), 1);

    let (mut client, _task) = connect(&broker, "viewer").await;
    subscribe(&mut client, 1, "status/#", SubscriptionOptions::with_qos(QoS::AtMostOnce)).await;

    let replay = recv_publish(&mut client).await;
    assert_eq!(&*replay.topic, "status/door");
    assert_eq!(replay.qos, QoS::AtMostOnce);
    assert!(replay.retain);
    assert_eq!(replay.packet_id, None);
}

#[tokio::test]
async fn test_retained_tombstone() {
    let broker = Broker::default();
    broker
        .inject_application_message(ApplicationMessage::new("status/lamp", "on").with_retain(true))
        .await
        .unwrap();
    broker
        .inject_application_message(ApplicationMessage::new("status/lamp", "").with_retain(true))
        .await
        .unwrap();
    assert!(broker.retained_messages().is_empty());

    let (mut client, _task) = connect(&broker, "viewer").await;
    subscribe(&mut client, 1, "status/#", SubscriptionOptions::default()).await;
    assert_eq!(client.recv_timeout(QUIET).await, None);
}

#[tokio::test]
async fn test_takeover_event_order() {
    let broker = Broker::default();
    let mut events = broker.events();

    let (mut first, first_task) = connect(&broker, "device").await;
    let (_second, _second_task) = connect(&broker, "device").await;

    match first.recv_timeout(WAIT).await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::SessionTakenOver)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    assert_eq!(first.recv_timeout(WAIT).await, None);
    assert!(first_task.await.unwrap().is_ok());

    assert!(matches!(
        next_lifecycle(&mut events).await,
        BrokerEvent::ClientConnected(e) if &*e.client_id == "device"
    ));
    assert!(matches!(
        next_lifecycle(&mut events).await,
        BrokerEvent::ClientDisconnected(e) if e.disconnect_type == DisconnectType::Takeover
    ));
    assert!(matches!(
        next_lifecycle(&mut events).await,
        BrokerEvent::ClientConnected(e) if &*e.client_id == "device"
    ));
    assert_eq!(broker.clients().len(), 1);
}

#[tokio::test]
async fn test_fifo_across_reconnect() {
    let broker = Broker::default();
    let (peer, task, _) = connect_with(&broker, persistent_connect("fifo", true)).await;
    disconnect(peer, task).await;

    let session = broker.session("fifo").unwrap();
    assert!(!session.is_connected());
    for payload in ["0", "2", "1", "4", "3", "6", "5", "8", "7", "9"] {
        session
            .try_enqueue(ApplicationMessage::new("queue", payload).with_qos(QoS::AtLeastOnce))
            .await
            .unwrap();
    }
    assert_eq!(session.pending_count(), 10);

    // First delivery, left unacknowledged
    let (mut peer, task, connack) = connect_with(&broker, persistent_connect("fifo", false)).await;
    assert!(connack.session_present);
    let mut first = String::new();
    for _ in 0..10 {
        first.push_str(&payload_string(&recv_publish(&mut peer).await));
    }
    assert_eq!(first, "0214365879");
    disconnect(peer, task).await;

    // Redelivery keeps the order and marks duplicates
    let (mut peer, task, _) = connect_with(&broker, persistent_connect("fifo", false)).await;
    let mut second = String::new();
    for _ in 0..10 {
        let publish = recv_publish(&mut peer).await;
        assert!(publish.dup);
        second.push_str(&payload_string(&publish));
        peer.send(Packet::PubAck(PubAck::new(publish.packet_id.unwrap())));
    }
    assert_eq!(second, "0214365879");
    assert_eq!(peer.recv_timeout(QUIET).await, None);
    disconnect(peer, task).await;
}

struct Overflow {
    broker: Broker,
    peer: ChannelPeer,
    /// Packet id of the message left in flight
    inflight_id: u16,
    results: Vec<Result<(), DeliveryError>>,
    events: broadcast::Receiver<BrokerEvent>,
}

impl Overflow {
    /// Payloads reported as overwritten so far
    fn overwritten(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let BrokerEvent::QueuedMessageOverwritten(e) = event {
                payloads.push(String::from_utf8_lossy(&e.overwritten.payload).into_owned());
            }
        }
        payloads
    }
}

/// One unacknowledged message in flight, then two more for a queue of one
async fn overflow_with(strategy: OverflowStrategy) -> Overflow {
    let broker = Broker::new(BrokerConfig {
        max_pending_messages: 1,
        max_inflight: 1,
        overflow_strategy: strategy,
        ..Default::default()
    });
    let events = broker.events();
    let (mut peer, _task) = connect(&broker, "slow").await;
    let session = broker.session("slow").unwrap();

    let message =
        |payload: &str| ApplicationMessage::new("work", payload.to_string()).with_qos(QoS::AtLeastOnce);
    let mut results = vec![session.try_enqueue(message("1")).await];
    let first = recv_publish(&mut peer).await;
    assert_eq!(payload_string(&first), "1");
    results.push(session.try_enqueue(message("2")).await);
    results.push(session.try_enqueue(message("3")).await);

    Overflow {
        broker,
        peer,
        inflight_id: first.packet_id.unwrap(),
        results,
        events,
    }
}

#[tokio::test]
async fn test_overflow_drop_new_message() {
    let mut overflow = overflow_with(OverflowStrategy::DropNewMessage).await;
    assert!(overflow.results[0].is_ok());
    assert!(overflow.results[1].is_ok());
    assert!(matches!(
        overflow.results[2],
        Err(DeliveryError::Overflow(OverflowKind::QueueFull))
    ));
    assert_eq!(overflow.broker.session("slow").unwrap().pending_count(), 1);
    assert!(overflow.overwritten().is_empty());

    overflow.peer.send(Packet::PubAck(PubAck::new(overflow.inflight_id)));
    assert_eq!(payload_string(&recv_publish(&mut overflow.peer).await), "2");
}

#[tokio::test]
async fn test_overflow_drop_oldest_queued_message() {
    let mut overflow = overflow_with(OverflowStrategy::DropOldestQueuedMessage).await;
    assert!(overflow.results.iter().all(|r| r.is_ok()));
    assert_eq!(overflow.broker.session("slow").unwrap().pending_count(), 1);
    assert_eq!(overflow.overwritten(), vec!["2"]);

    // "1" stays in flight, "2" was evicted for "3"
    overflow.peer.send(Packet::PubAck(PubAck::new(overflow.inflight_id)));
    assert_eq!(payload_string(&recv_publish(&mut overflow.peer).await), "3");
}

#[tokio::test]
async fn test_overwritten_event_names_evicted_message() {
    let broker = Broker::new(BrokerConfig {
        max_pending_messages: 1,
        overflow_strategy: OverflowStrategy::DropOldestQueuedMessage,
        ..Default::default()
    });
    let (peer, task, _) = connect_with(&broker, persistent_connect("offline", true)).await;
    disconnect(peer, task).await;

    let mut events = broker.events();
    let session = broker.session("offline").unwrap();
    session
        .try_enqueue(ApplicationMessage::new("t", "old"))
        .await
        .unwrap();
    session
        .try_enqueue(ApplicationMessage::new("t", "new"))
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let BrokerEvent::QueuedMessageOverwritten(e) = event {
            assert_eq!(&*e.receiver_client_id, "offline");
            assert_eq!(e.overwritten.payload, Bytes::from("old"));
            break;
        }
    }
    assert_eq!(session.pending_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_timeout_publishes_will() {
    let broker = Broker::default();

    let mut watcher_connect = connect_packet("watcher");
    watcher_connect.protocol_version = ProtocolVersion::V311;
    watcher_connect.keep_alive = 0;
    let (mut watcher, _watcher_task, _) = connect_with(&broker, watcher_connect).await;
    subscribe(&mut watcher, 1, "wills/#", SubscriptionOptions::default()).await;

    let mut victim_connect = connect_packet("victim");
    victim_connect.protocol_version = ProtocolVersion::V311;
    victim_connect.keep_alive = 1;
    victim_connect.will = Some(Will {
        topic: "wills/victim".to_string(),
        payload: Bytes::from("gone"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    let (mut victim, victim_task, _) = connect_with(&broker, victim_connect).await;

    // v3 clients get no DISCONNECT, the transport just closes
    assert_eq!(victim.recv_timeout(Duration::from_secs(5)).await, None);
    assert!(matches!(victim_task.await.unwrap(), Err(ConnectionError::Timeout)));

    let will = recv_publish(&mut watcher).await;
    assert_eq!(&*will.topic, "wills/victim");
    assert_eq!(will.payload, Bytes::from("gone"));
}

#[tokio::test]
async fn test_graceful_disconnect_discards_will() {
    let broker = Broker::default();
    let (mut watcher, _task) = connect(&broker, "watcher").await;
    subscribe(&mut watcher, 1, "wills/#", SubscriptionOptions::default()).await;

    let mut connect = connect_packet("polite");
    connect.will = Some(Will {
        topic: "wills/polite".to_string(),
        payload: Bytes::from("gone"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    let (peer, task, _) = connect_with(&broker, connect).await;
    disconnect(peer, task).await;

    assert_eq!(watcher.recv_timeout(QUIET).await, None);
}

#[tokio::test]
async fn test_admin_disconnect_publishes_will() {
    let broker = Broker::default();
    let (mut watcher, _task) = connect(&broker, "watcher").await;
    subscribe(&mut watcher, 1, "wills/#", SubscriptionOptions::default()).await;

    let mut connect = connect_packet("kicked");
    connect.will = Some(Will {
        topic: "wills/kicked".to_string(),
        payload: Bytes::from("bye"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    let (mut peer, task, _) = connect_with(&broker, connect).await;

    broker
        .disconnect_client("kicked", ReasonCode::AdministrativeAction)
        .await
        .unwrap();
    match peer.recv_timeout(WAIT).await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::AdministrativeAction)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    assert!(task.await.unwrap().is_ok());
    assert_eq!(&*recv_publish(&mut watcher).await.topic, "wills/kicked");

    assert!(matches!(
        broker.disconnect_client("kicked", ReasonCode::AdministrativeAction).await,
        Err(BrokerError::ClientNotFound)
    ));
}

#[tokio::test]
async fn test_malformed_packet_closes_without_response() {
    let broker = Broker::default();
    let (mut peer, task) = connect(&broker, "garbled").await;

    peer.send_malformed("bad remaining length");
    assert_eq!(peer.recv_timeout(WAIT).await, None);
    assert!(matches!(
        task.await.unwrap(),
        Err(ConnectionError::Protocol(ProtocolError::MalformedPacket(_)))
    ));
}

#[tokio::test]
async fn test_unexpected_packet_is_protocol_violation() {
    let broker = Broker::default();
    let (mut peer, task) = connect(&broker, "confused").await;

    peer.send(Packet::PingResp);
    assert_eq!(peer.recv_timeout(WAIT).await, None);
    assert!(matches!(
        task.await.unwrap(),
        Err(ConnectionError::Protocol(ProtocolError::UnexpectedPacket("PINGRESP")))
    ));
}

#[tokio::test]
async fn test_deliver_and_wait() {
    let broker = Broker::default();
    let (mut peer, _task) = connect(&broker, "target").await;
    let session = broker.session("target").unwrap();

    let delivery = tokio::spawn(async move {
        session
            .deliver_and_wait(ApplicationMessage::new("direct", "ping"), WAIT)
            .await
    });

    let publish = recv_publish(&mut peer).await;
    assert_eq!(&*publish.topic, "direct");
    assert!(delivery.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_inject_rejects_invalid_topic() {
    let broker = Broker::default();
    let result = broker
        .inject_application_message(ApplicationMessage::new("bad/+/topic", "x"))
        .await;
    assert!(matches!(result, Err(BrokerError::InvalidTopic(_))));
}

#[tokio::test]
async fn test_server_side_subscribe() {
    let broker = Broker::default();
    let (mut peer, _task) = connect(&broker, "managed").await;

    let reason = broker
        .subscribe("managed", "alerts/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(reason, ReasonCode::GrantedQoS1);
    assert_eq!(broker.session("managed").unwrap().subscriptions(), vec!["alerts/#"]);

    broker
        .inject_application_message(ApplicationMessage::new("alerts/fire", "!"))
        .await
        .unwrap();
    assert_eq!(&*recv_publish(&mut peer).await.topic, "alerts/fire");

    assert!(matches!(
        broker.subscribe("ghost", "a", SubscriptionOptions::default()).await,
        Err(BrokerError::SessionNotFound)
    ));
}

struct BlockingHook;

#[async_trait]
impl Hooks for BlockingHook {
    async fn intercept_publish(&self, ctx: &mut InterceptingPublish) -> HookResult<()> {
        if ctx.message.topic.starts_with("blocked/") {
            ctx.process_publish = false;
        } else if ctx.message.topic.starts_with("upper/") {
            let upper = String::from_utf8_lossy(&ctx.message.payload).to_uppercase();
            ctx.message.payload = Bytes::from(upper);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_publish_interceptor() {
    let broker = Broker::with_hooks(BrokerConfig::default(), Arc::new(BlockingHook));
    let (mut sub, _sub_task) = connect(&broker, "sub").await;
    let (mut publisher, _pub_task) = connect(&broker, "pub").await;
    subscribe(&mut sub, 1, "#", SubscriptionOptions::default()).await;

    let mut blocked = Publish::new("blocked/topic", "secret", QoS::AtLeastOnce);
    blocked.packet_id = Some(1);
    publisher.send(Packet::Publish(blocked));
    // still acknowledged
    assert!(matches!(
        publisher.recv_timeout(WAIT).await,
        Some(Packet::PubAck(PubAck { packet_id: 1, .. }))
    ));

    publisher.send(Packet::Publish(Publish::new("upper/topic", "shout", QoS::AtMostOnce)));

    let received = recv_publish(&mut sub).await;
    assert_eq!(&*received.topic, "upper/topic");
    assert_eq!(received.payload, Bytes::from("SHOUT"));
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let broker = Broker::default();
    broker.start().await.unwrap();
    let (mut peer, task) = connect(&broker, "bystander").await;

    broker.shutdown().await;

    match peer.recv_timeout(WAIT).await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::ServerShuttingDown)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    assert_eq!(peer.recv_timeout(WAIT).await, None);
    assert!(matches!(task.await.unwrap(), Err(ConnectionError::Shutdown)));

    let (transport, _peer) = ChannelTransport::pair();
    assert!(matches!(broker.accept(transport), Err(BrokerError::Shutdown)));
}

#[tokio::test]
async fn test_retained_messages_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.snapshot");

    let broker = Broker::default().with_persistence(Arc::new(FileBackend::open(&path).unwrap()));
    broker.start().await.unwrap();
    broker
        .inject_application_message(ApplicationMessage::new("config/mode", "eco").with_retain(true))
        .await
        .unwrap();
    broker.shutdown().await;

    let restarted = Broker::default().with_persistence(Arc::new(FileBackend::open(&path).unwrap()));
    restarted.start().await.unwrap();
    let retained = restarted.retained_messages();
    assert_eq!(retained.len(), 1);
    assert_eq!(&*retained[0].topic, "config/mode");
    assert_eq!(retained[0].payload, Bytes::from("eco"));
    restarted.shutdown().await;
}

struct SlowValidation(Duration);

#[async_trait]
impl Hooks for SlowValidation {
    async fn validate_connection(&self, _ctx: &mut ValidatingConnection) -> HookResult<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_refuses_connect_in_validation() {
    let broker = Broker::with_hooks(
        BrokerConfig::default(),
        Arc::new(SlowValidation(Duration::from_millis(300))),
    );
    broker.start().await.unwrap();

    let (transport, mut peer) = ChannelTransport::pair();
    let task = broker.accept(transport).unwrap();
    assert!(peer.send(Packet::Connect(Box::new(connect_packet("latecomer")))));

    let (_, reply) = tokio::join!(
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            broker.shutdown().await;
        },
        peer.recv_timeout(WAIT),
    );

    match reply {
        Some(Packet::ConnAck(connack)) => {
            assert_eq!(connack.reason_code, ReasonCode::ServerShuttingDown)
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
    assert!(matches!(task.await.unwrap(), Err(ConnectionError::Shutdown)));
    assert!(broker.clients().is_empty());
}

#[tokio::test]
async fn test_takeover_does_not_publish_will() {
    let broker = Broker::default();
    let (mut watcher, _watcher_task) = connect(&broker, "watcher").await;
    subscribe(&mut watcher, 1, "wills/#", SubscriptionOptions::default()).await;

    let mut first_connect = connect_packet("device");
    first_connect.will = Some(Will {
        topic: "wills/device".to_string(),
        payload: Bytes::from("gone"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    let (mut first, first_task, _) = connect_with(&broker, first_connect).await;
    let (_second, _second_task) = connect(&broker, "device").await;

    assert!(matches!(
        first.recv_timeout(WAIT).await,
        Some(Packet::Disconnect(Disconnect {
            reason_code: ReasonCode::SessionTakenOver,
            ..
        }))
    ));
    assert!(first_task.await.unwrap().is_ok());
    assert_eq!(watcher.recv_timeout(QUIET).await, None);
}

#[tokio::test]
async fn test_publish_subscribe_qos2() {
    let broker = Broker::default();
    let mut events = broker.events();
    let (mut sub, _sub_task) = connect(&broker, "sub").await;
    let (mut publisher, _pub_task) = connect(&broker, "pub").await;
    subscribe(&mut sub, 1, "orders/#", SubscriptionOptions::with_qos(QoS::ExactlyOnce)).await;

    // inbound: PUBLISH, PUBREC, PUBREL, PUBCOMP
    let mut publish = Publish::new("orders/42", "paid", QoS::ExactlyOnce);
    publish.packet_id = Some(9);
    publisher.send(Packet::Publish(publish));
    assert!(matches!(
        publisher.recv_timeout(WAIT).await,
        Some(Packet::PubRec(PubRec { packet_id: 9, reason_code: ReasonCode::Success, .. }))
    ));
    publisher.send(Packet::PubRel(PubRel::new(9)));
    assert!(matches!(
        publisher.recv_timeout(WAIT).await,
        Some(Packet::PubComp(PubComp { packet_id: 9, reason_code: ReasonCode::Success, .. }))
    ));

    // outbound: the subscriber walks the same handshake from the other side
    let received = recv_publish(&mut sub).await;
    assert_eq!(&*received.topic, "orders/42");
    assert_eq!(received.qos, QoS::ExactlyOnce);
    let packet_id = received.packet_id.unwrap();
    sub.send(Packet::PubRec(PubRec::new(packet_id)));
    assert_eq!(sub.recv_timeout(WAIT).await, Some(Packet::PubRel(PubRel::new(packet_id))));
    sub.send(Packet::PubComp(PubComp::new(packet_id)));

    let mut acknowledged = 0;
    loop {
        match tokio::time::timeout(QUIET, events.recv()).await {
            Ok(Ok(BrokerEvent::ClientAcknowledged(ack))) => {
                assert_eq!(&*ack.client_id, "sub");
                assert_eq!(ack.packet_id, packet_id);
                assert_eq!(ack.qos, QoS::ExactlyOnce);
                acknowledged += 1;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert_eq!(acknowledged, 1);
    assert_eq!(broker.session("sub").unwrap().inflight_count(), 0);
    assert_eq!(sub.recv_timeout(QUIET).await, None);
}

#[tokio::test]
async fn test_unacknowledged_message_exhausts_retries() {
    let broker = Broker::new(BrokerConfig {
        communication_timeout: Duration::from_millis(100),
        max_retries: 2,
        ..Default::default()
    });
    let (mut peer, task) = connect(&broker, "silent").await;
    subscribe(&mut peer, 1, "jobs", SubscriptionOptions::with_qos(QoS::AtLeastOnce)).await;

    broker
        .inject_application_message(ApplicationMessage::new("jobs", "run").with_qos(QoS::AtLeastOnce))
        .await
        .unwrap();

    let first = recv_publish(&mut peer).await;
    assert!(!first.dup);
    for _ in 0..2 {
        let resent = recv_publish(&mut peer).await;
        assert!(resent.dup);
        assert_eq!(resent.packet_id, first.packet_id);
    }

    // never acknowledged, the connection is dropped without DISCONNECT
    assert_eq!(peer.recv_timeout(WAIT).await, None);
    assert!(matches!(task.await.unwrap(), Err(ConnectionError::Timeout)));
    assert!(broker.client("silent").is_none());
}
