//! Dispatcher + notifier behaviour against the in-process broker.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use chatrelay_core::protocol::frame::{ClientFrame, ADD_USER, SEND_MESSAGE};
use chatrelay_core::{Message, MessageKind};
use chatrelay_gateway::broker::{BrokerBridge, BrokerState, Delivery, LocalBroker};
use chatrelay_gateway::obs::RelayMetrics;
use chatrelay_gateway::relay::{DisconnectNotifier, RelayDispatcher};
use chatrelay_gateway::session::{ConnectionId, SessionRegistry};

const TOPIC: &str = "/topic/public";

struct Harness {
    broker: Arc<LocalBroker>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<RelayDispatcher>,
    notifier: DisconnectNotifier,
    metrics: Arc<RelayMetrics>,
    rx: broadcast::Receiver<Delivery>,
}

async fn harness() -> Harness {
    let broker = Arc::new(LocalBroker::new());
    let sessions = Arc::new(SessionRegistry::new());
    let metrics = Arc::new(RelayMetrics::default());
    let bridge: Arc<dyn BrokerBridge> = broker.clone();
    let dispatcher = Arc::new(RelayDispatcher::new(
        Arc::clone(&sessions),
        bridge,
        TOPIC,
        Arc::clone(&metrics),
    ));
    let notifier = DisconnectNotifier::new(Arc::clone(&dispatcher));
    let rx = broker.subscribe(TOPIC).await.unwrap();
    Harness {
        broker,
        sessions,
        dispatcher,
        notifier,
        metrics,
        rx,
    }
}

fn conn(n: u64) -> ConnectionId {
    ConnectionId::from_raw(n)
}

fn assert_nothing_published(rx: &mut broadcast::Receiver<Delivery>) {
    assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
}

#[tokio::test]
async fn join_binds_session_and_rewrites_content() {
    let mut h = harness().await;
    let out = h
        .dispatcher
        .handle(conn(1), Message::new(MessageKind::Join, "Bob", "spoofed text"))
        .await
        .unwrap();

    assert_eq!(out, Message::new(MessageKind::Join, "Bob", "Bob joined the chat"));
    assert_eq!(h.sessions.lookup(conn(1)).as_deref(), Some("Bob"));
    assert_eq!(*h.rx.recv().await.unwrap(), out);
}

#[tokio::test]
async fn chat_passes_through_unchanged() {
    let mut h = harness().await;
    let msg = Message::chat("Bob", "hello <b>world</b>");
    let out = h.dispatcher.handle(conn(1), msg.clone()).await.unwrap();
    assert_eq!(out, msg);
    assert_eq!(*h.rx.recv().await.unwrap(), msg);
    assert!(h.sessions.lookup(conn(1)).is_none(), "chat must not bind");
}

#[tokio::test]
async fn disconnect_emits_single_leave() {
    let mut h = harness().await;
    h.sessions.bind(conn(1), "Alice");

    let out = h.notifier.on_disconnect(conn(1)).await.unwrap().unwrap();
    assert_eq!(out, Message::new(MessageKind::Leave, "Alice", "Alice left the chat"));
    assert_eq!(*h.rx.recv().await.unwrap(), out);

    assert!(h.notifier.on_disconnect(conn(1)).await.unwrap().is_none());
    assert_nothing_published(&mut h.rx);
}

#[tokio::test]
async fn disconnect_without_join_is_silent() {
    let mut h = harness().await;
    assert!(h.notifier.on_disconnect(conn(42)).await.unwrap().is_none());
    assert_nothing_published(&mut h.rx);
}

#[tokio::test]
async fn client_leave_is_rejected() {
    let mut h = harness().await;
    h.sessions.bind(conn(1), "Bob");
    let err = h
        .dispatcher
        .handle(conn(1), Message::leave("Bob"))
        .await
        .unwrap_err();
    assert!(err.is_protocol());
    assert_nothing_published(&mut h.rx);
    assert_eq!(h.sessions.lookup(conn(1)).as_deref(), Some("Bob"));
}

#[tokio::test]
async fn join_without_sender_mutates_nothing() {
    let mut h = harness().await;
    for sender in ["", "   "] {
        let err = h
            .dispatcher
            .handle(conn(1), Message::new(MessageKind::Join, sender, ""))
            .await
            .unwrap_err();
        assert!(err.is_protocol());
    }
    assert!(h.sessions.is_empty());
    assert_nothing_published(&mut h.rx);
    assert_eq!(h.metrics.frames_rejected.get(&[("reason", "protocol")]), 2);
}

#[tokio::test]
async fn rejoin_overwrites_binding() {
    let mut h = harness().await;
    h.dispatcher.handle(conn(1), Message::join("Bob")).await.unwrap();
    h.dispatcher.handle(conn(1), Message::join("Robert")).await.unwrap();
    assert_eq!(h.sessions.lookup(conn(1)).as_deref(), Some("Robert"));

    let leave = h.notifier.on_disconnect(conn(1)).await.unwrap().unwrap();
    assert_eq!(leave.content, "Robert left the chat");
    assert_eq!(h.rx.len(), 3);
}

#[tokio::test]
async fn add_user_endpoint_forces_join() {
    let mut h = harness().await;
    let frame = ClientFrame::new(ADD_USER, Message::chat("Carol", "whatever"));
    let out = h.dispatcher.route(conn(3), frame).await.unwrap();
    assert_eq!(out.kind, MessageKind::Join);
    assert_eq!(out.content, "Carol joined the chat");
    assert_eq!(h.sessions.lookup(conn(3)).as_deref(), Some("Carol"));
    assert_eq!(*h.rx.recv().await.unwrap(), out);
}

#[tokio::test]
async fn unknown_destination_is_rejected() {
    let mut h = harness().await;
    let frame = ClientFrame::new("/app/chat.kick", Message::chat("Carol", "x"));
    assert!(h.dispatcher.route(conn(3), frame).await.unwrap_err().is_protocol());
    assert_nothing_published(&mut h.rx);
}

#[tokio::test]
async fn degraded_broker_fails_fast() {
    let mut h = harness().await;
    h.broker.set_state(BrokerState::Degraded);

    let started = tokio::time::Instant::now();
    for i in 0..5 {
        let err = h
            .dispatcher
            .handle(conn(i), Message::chat("Bob", "hi"))
            .await
            .unwrap_err();
        assert!(err.is_broker_unavailable());
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_nothing_published(&mut h.rx);
    assert_eq!(h.metrics.broker_publish_failures.get(&[("kind", "CHAT")]), 5);

    // Recovery: publishes flow again, failed ones are not replayed.
    h.broker.set_state(BrokerState::Connected);
    h.dispatcher.handle(conn(1), Message::chat("Bob", "again")).await.unwrap();
    assert_eq!(h.rx.recv().await.unwrap().content, "again");
    assert_nothing_published(&mut h.rx);
}

#[tokio::test]
async fn join_binding_survives_broker_failure() {
    let h = harness().await;
    h.broker.set_state(BrokerState::Degraded);
    assert!(h.dispatcher.handle(conn(1), Message::join("Bob")).await.is_err());
    assert_eq!(h.sessions.lookup(conn(1)).as_deref(), Some("Bob"));
}

#[tokio::test]
async fn join_chat_leave_scenario() {
    let mut h = harness().await;
    let c1 = conn(1);

    let out = h
        .dispatcher
        .route(c1, ClientFrame::new(ADD_USER, Message::new(MessageKind::Join, "Bob", "")))
        .await
        .unwrap();
    assert_eq!(out, Message::new(MessageKind::Join, "Bob", "Bob joined the chat"));
    assert_eq!(h.sessions.lookup(c1).as_deref(), Some("Bob"));

    let out = h
        .dispatcher
        .route(c1, ClientFrame::new(SEND_MESSAGE, Message::chat("Bob", "hi")))
        .await
        .unwrap();
    assert_eq!(out, Message::chat("Bob", "hi"));

    let out = h.notifier.on_disconnect(c1).await.unwrap().unwrap();
    assert_eq!(out, Message::new(MessageKind::Leave, "Bob", "Bob left the chat"));
    assert!(h.sessions.lookup(c1).is_none());

    let seen: Vec<MessageKind> = (0..3).map(|_| h.rx.try_recv().unwrap().kind).collect();
    assert_eq!(seen, vec![MessageKind::Join, MessageKind::Chat, MessageKind::Leave]);
    assert_eq!(h.metrics.frames_relayed.get(&[("kind", "LEAVE")]), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections_keep_their_bindings() {
    let h = harness().await;
    let mut tasks = Vec::new();
    for i in 0..64u64 {
        let dispatcher = Arc::clone(&h.dispatcher);
        tasks.push(tokio::spawn(async move {
            dispatcher
                .handle(conn(i), Message::join(format!("user-{i}")))
                .await
                .unwrap();
            for n in 0..5 {
                dispatcher
                    .handle(conn(i), Message::chat(format!("user-{i}"), format!("m{n}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(h.sessions.len(), 64);
    for i in 0..64u64 {
        assert_eq!(h.sessions.lookup(conn(i)), Some(format!("user-{i}")));
    }
}

#[tokio::test]
async fn per_connection_order_is_preserved() {
    let mut h = harness().await;
    for n in 0..20 {
        h.dispatcher
            .handle(conn(1), Message::chat("Bob", n.to_string()))
            .await
            .unwrap();
    }
    for n in 0..20 {
        assert_eq!(h.rx.recv().await.unwrap().content, n.to_string());
    }
}
