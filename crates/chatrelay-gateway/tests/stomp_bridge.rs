//! STOMP bridge lifecycle against an in-test STOMP server.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Instant};

use chatrelay_core::protocol::stomp::{self, Command, Frame, DEFAULT_MAX_FRAME_BYTES};
use chatrelay_core::Message;
use chatrelay_gateway::broker::{BrokerBridge, BrokerState, StompBroker};
use chatrelay_gateway::config::BrokerConfig;

const TOPIC: &str = "/topic/public";

#[derive(Clone, Copy, Default)]
struct FakeOptions {
    reject_login: bool,
    withhold_receipts: bool,
    /// The first N connections get `CONNECTED` and `ERROR` in one write.
    error_after_connected: usize,
}

type Outbox = mpsc::UnboundedSender<Frame>;

/// Minimal STOMP broker: CONNECT, SUBSCRIBE, SEND (with receipts), DISCONNECT.
struct FakeBroker {
    port: u16,
    /// Every frame received, in order, across connections.
    received: Arc<Mutex<Vec<Frame>>>,
    kill: broadcast::Sender<()>,
}

impl FakeBroker {
    async fn start(opts: FakeOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let subs: Arc<Mutex<Vec<(String, String, Outbox)>>> = Arc::new(Mutex::new(Vec::new()));
        let (kill, _) = broadcast::channel(4);
        let connections = Arc::new(AtomicUsize::new(0));

        let received_c = Arc::clone(&received);
        let kill_c = kill.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let received = Arc::clone(&received_c);
                let subs = Arc::clone(&subs);
                let mut kill_rx = kill_c.subscribe();
                let nth = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.into_split();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
                    let writer = tokio::spawn(async move {
                        while let Some(f) = out_rx.recv().await {
                            // Frames queued together go out in a single write.
                            let mut buf = BytesMut::new();
                            stomp::encode(&f, &mut buf);
                            while let Ok(next) = out_rx.try_recv() {
                                stomp::encode(&next, &mut buf);
                            }
                            if wr.write_all(&buf).await.is_err() {
                                return;
                            }
                        }
                    });

                    let mut buf = BytesMut::new();
                    'conn: loop {
                        while let Some(frame) = stomp::decode(&mut buf, DEFAULT_MAX_FRAME_BYTES).unwrap() {
                            received.lock().unwrap().push(frame.clone());
                            match frame.command {
                                Command::Connect if opts.reject_login => {
                                    let _ = out_tx.send(
                                        Frame::new(Command::Error).header("message", "bad credentials"),
                                    );
                                    break 'conn;
                                }
                                Command::Connect if nth < opts.error_after_connected => {
                                    let _ = out_tx.send(Frame::new(Command::Connected).header("version", "1.2"));
                                    let _ = out_tx.send(
                                        Frame::new(Command::Error).header("message", "session revoked"),
                                    );
                                    break 'conn;
                                }
                                Command::Connect => {
                                    let _ = out_tx.send(Frame::new(Command::Connected).header("version", "1.2"));
                                }
                                Command::Subscribe => {
                                    let dest = frame.get("destination").unwrap().to_string();
                                    let id = frame.get("id").unwrap().to_string();
                                    subs.lock().unwrap().push((dest, id, out_tx.clone()));
                                }
                                Command::Send => {
                                    let dest = frame.get("destination").unwrap().to_string();
                                    if let Some(r) = frame.get("receipt") {
                                        if !opts.withhold_receipts {
                                            let _ = out_tx.send(Frame::new(Command::Receipt).header("receipt-id", r));
                                        }
                                    }
                                    for (d, id, tx) in subs.lock().unwrap().iter() {
                                        if *d == dest {
                                            let _ = tx.send(
                                                Frame::new(Command::Message)
                                                    .header("destination", d.as_str())
                                                    .header("subscription", id.as_str())
                                                    .header("message-id", "m")
                                                    .with_body(frame.body.clone()),
                                            );
                                        }
                                    }
                                }
                                Command::Disconnect => break 'conn,
                                _ => {}
                            }
                        }
                        tokio::select! {
                            n = rd.read_buf(&mut buf) => {
                                if !matches!(n, Ok(k) if k > 0) {
                                    break 'conn;
                                }
                            }
                            _ = kill_rx.recv() => break 'conn,
                        }
                    }
                    // Drop this connection's subscriptions and sockets.
                    subs.lock().unwrap().retain(|(_, _, tx)| !tx.same_channel(&out_tx));
                    drop(out_tx);
                    let _ = timeout(Duration::from_millis(200), writer).await;
                });
            }
        });

        Self { port, received, kill }
    }

    fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    fn frames(&self, command: Command) -> Vec<Frame> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }
}

fn cfg(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".into(),
        port,
        virtual_host: "chat-vhost".into(),
        system_login: "relay".into(),
        system_passcode: "s3cret".into(),
        connect_timeout_ms: 300,
        publish_timeout_ms: 300,
        reconnect_initial_ms: 300,
        reconnect_max_ms: 1200,
        ..BrokerConfig::default()
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<BrokerState>, want: BrokerState, within: Duration) {
    let res = timeout(within, async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await;
    assert!(res.is_ok(), "state never became {want}, last {}", *rx.borrow());
}

async fn unused_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap().port()
}

#[tokio::test]
async fn connects_with_system_credentials() {
    let fake = FakeBroker::start(FakeOptions::default()).await;
    let bridge = StompBroker::start(cfg(fake.port)).await;
    assert_eq!(bridge.state(), BrokerState::Connected);

    let connects = fake.frames(Command::Connect);
    assert_eq!(connects.len(), 1);
    let c = &connects[0];
    assert_eq!(c.get("accept-version"), Some("1.2"));
    assert_eq!(c.get("host"), Some("chat-vhost"));
    assert_eq!(c.get("login"), Some("relay"));
    assert_eq!(c.get("passcode"), Some("s3cret"));
}

#[tokio::test]
async fn publish_reaches_subscribers_through_broker() {
    let fake = FakeBroker::start(FakeOptions::default()).await;
    let bridge = StompBroker::start(cfg(fake.port)).await;

    let mut rx1 = bridge.subscribe(TOPIC).await.unwrap();
    let mut rx2 = bridge.subscribe(TOPIC).await.unwrap();

    let msg = Message::chat("Bob", "hi");
    bridge.publish(TOPIC, &msg).await.unwrap();

    let got1 = timeout(Duration::from_secs(2), rx1.recv()).await.unwrap().unwrap();
    let got2 = timeout(Duration::from_secs(2), rx2.recv()).await.unwrap().unwrap();
    assert_eq!(*got1, msg);
    assert_eq!(*got2, msg);

    // One broker subscription serves every local receiver.
    assert_eq!(fake.frames(Command::Subscribe).len(), 1);
    let sends = fake.frames(Command::Send);
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].get("destination"), Some(TOPIC));
    assert!(sends[0].get("receipt").is_some());
    assert_eq!(Message::decode_slice(&sends[0].body).unwrap(), msg);
}

#[tokio::test]
async fn concurrent_publishes_all_get_receipts() {
    let fake = FakeBroker::start(FakeOptions::default()).await;
    let bridge = Arc::new(StompBroker::start(cfg(fake.port)).await);

    let mut tasks = Vec::new();
    for i in 0..32 {
        let b = Arc::clone(&bridge);
        tasks.push(tokio::spawn(async move {
            b.publish(TOPIC, &Message::chat(format!("u{i}"), "x")).await
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(fake.frames(Command::Send).len(), 32);
}

#[tokio::test]
async fn unreachable_broker_starts_degraded_and_fails_fast() {
    let port = unused_port().await;
    let config = cfg(port);
    let bound = Duration::from_millis(config.connect_timeout_ms + 500);
    let bridge = StompBroker::start(config).await;
    assert_ne!(bridge.state(), BrokerState::Connected);

    for _ in 0..3 {
        let started = Instant::now();
        let err = bridge.publish(TOPIC, &Message::chat("Bob", "hi")).await.unwrap_err();
        assert!(err.is_broker_unavailable());
        assert!(started.elapsed() < bound, "publish blocked for {:?}", started.elapsed());
    }
    bridge.shutdown().await;
}

#[tokio::test]
async fn rejected_login_is_degraded() {
    let fake = FakeBroker::start(FakeOptions {
        reject_login: true,
        ..FakeOptions::default()
    })
    .await;
    let bridge = StompBroker::start(cfg(fake.port)).await;
    assert_eq!(bridge.state(), BrokerState::Degraded);
    bridge.shutdown().await;
}

#[tokio::test]
async fn missing_receipt_times_out() {
    let fake = FakeBroker::start(FakeOptions {
        withhold_receipts: true,
        ..FakeOptions::default()
    })
    .await;
    let bridge = StompBroker::start(cfg(fake.port)).await;

    let started = Instant::now();
    let err = bridge.publish(TOPIC, &Message::chat("Bob", "hi")).await.unwrap_err();
    assert!(err.is_broker_unavailable());
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn connection_loss_degrades_then_reconnects_and_resubscribes() {
    let fake = FakeBroker::start(FakeOptions::default()).await;
    let bridge = StompBroker::start(cfg(fake.port)).await;
    let mut state = bridge.state_watch();
    let mut rx = bridge.subscribe(TOPIC).await.unwrap();

    fake.kill_connections();
    wait_for_state(&mut state, BrokerState::Degraded, Duration::from_secs(2)).await;

    let err = bridge.publish(TOPIC, &Message::chat("Bob", "lost")).await.unwrap_err();
    assert!(err.is_broker_unavailable());

    wait_for_state(&mut state, BrokerState::Connected, Duration::from_secs(5)).await;
    assert_eq!(fake.frames(Command::Connect).len(), 2);

    let msg = Message::chat("Bob", "back");
    bridge.publish(TOPIC, &msg).await.unwrap();
    let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    // The failed publish is not replayed.
    assert_eq!(*got, msg);
    assert_eq!(fake.frames(Command::Subscribe).len(), 2);
}

#[tokio::test]
async fn shutdown_disconnects_and_stops_publishing() {
    let fake = FakeBroker::start(FakeOptions::default()).await;
    let bridge = StompBroker::start(cfg(fake.port)).await;
    bridge.shutdown().await;

    assert_eq!(bridge.state(), BrokerState::Disconnected);
    assert!(bridge
        .publish(TOPIC, &Message::chat("Bob", "hi"))
        .await
        .unwrap_err()
        .is_broker_unavailable());

    let deadline = Instant::now() + Duration::from_secs(2);
    while fake.frames(Command::Disconnect).is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fake.frames(Command::Disconnect).len(), 1);

    // No reconnect after shutdown.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(fake.frames(Command::Connect).len(), 1);
    assert_eq!(bridge.state(), BrokerState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn error_right_after_connected_never_sticks_connected() {
    let flaps = 4;
    let fake = FakeBroker::start(FakeOptions {
        error_after_connected: flaps,
        ..FakeOptions::default()
    })
    .await;
    let bridge = StompBroker::start(BrokerConfig {
        reconnect_initial_ms: 20,
        reconnect_max_ms: 80,
        ..cfg(fake.port)
    })
    .await;

    // Every flapping connection must end Degraded and be retried until the
    // broker settles and publishes go through again.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match bridge.publish(TOPIC, &Message::chat("Bob", "hi")).await {
            Ok(()) => break,
            Err(e) => {
                assert!(e.is_broker_unavailable());
                assert!(Instant::now() < deadline, "bridge stuck in {}", bridge.state());
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    assert_eq!(bridge.state(), BrokerState::Connected);
    assert!(fake.frames(Command::Connect).len() > flaps);
    bridge.shutdown().await;
}
