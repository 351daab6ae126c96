use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::time::timeout;

use chatrelay_core::error::{Result, RelayError};
use chatrelay_core::protocol::stomp::{self, Command, Frame, DEFAULT_MAX_FRAME_BYTES};
use chatrelay_core::Message;

use super::backoff::Backoff;
use super::{BrokerBridge, BrokerState, Delivery, Topics};
use crate::config::BrokerConfig;

/// STOMP 1.2 broker bridge over a single shared TCP connection.
///
/// - Publishes are `SEND` frames carrying a `receipt` header; `publish`
///   resolves when the matching `RECEIPT` arrives.
/// - Each destination is subscribed once on the broker; deliveries are fanned
///   out locally to every per-connection receiver.
/// - On transport failure the bridge goes `Degraded` and a background task
///   reconnects with exponential backoff, re-subscribing every destination.
#[derive(Clone)]
pub struct StompBroker {
    inner: Arc<Inner>,
}

struct Link {
    generation: u64,
    writer: OwnedWriteHalf,
}

struct Inner {
    cfg: BrokerConfig,
    state: watch::Sender<BrokerState>,
    /// Write half of the live connection; the lock serializes frame writes.
    link: Mutex<Option<Link>>,
    topics: Topics,
    /// destination -> subscription id
    subscriptions: DashMap<String, String>,
    /// subscription id -> destination
    sub_destinations: DashMap<String, String>,
    /// receipt id -> publisher waiting for it
    pending: DashMap<String, oneshot::Sender<()>>,
    seq: AtomicU64,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    closed: watch::Sender<bool>,
}

impl StompBroker {
    /// Build the bridge and make the first connection attempt.
    ///
    /// A failed first attempt is not an error: the bridge starts `Degraded`
    /// and keeps reconnecting in the background.
    pub async fn start(cfg: BrokerConfig) -> Self {
        let (state, _) = watch::channel(BrokerState::Disconnected);
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            cfg,
            state,
            link: Mutex::new(None),
            topics: Topics::new(),
            subscriptions: DashMap::new(),
            sub_destinations: DashMap::new(),
            pending: DashMap::new(),
            seq: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            closed,
        });

        if let Err(e) = Inner::connect(&inner).await {
            tracing::warn!(addr = %inner.cfg.addr(), error = %e, "initial broker connect failed");
            inner.set_state(BrokerState::Degraded);
            Inner::spawn_reconnect(&inner);
        }

        Self { inner }
    }
}

impl Inner {
    fn set_state(&self, next: BrokerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "broker state changed");
        }
    }

    fn current(&self) -> BrokerState {
        *self.state.borrow()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.connect_timeout_ms)
    }

    fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.publish_timeout_ms)
    }

    /// One connection attempt: TCP connect, CONNECT/CONNECTED handshake,
    /// re-subscribe, then hand the read half to a reader task.
    async fn connect(this: &Arc<Self>) -> Result<()> {
        if this.is_closed() {
            return Err(RelayError::BrokerUnavailable("bridge shut down".into()));
        }
        this.set_state(BrokerState::Connecting);

        let addr = this.cfg.addr();
        let (reader, writer, leftover) = timeout(this.connect_timeout(), this.handshake(&addr))
            .await
            .map_err(|_| RelayError::BrokerUnavailable(format!("connect to {addr} timed out")))??;

        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut link = this.link.lock().await;
            let mut link_new = Link { generation, writer };
            let subs: Vec<(String, String)> = this
                .subscriptions
                .iter()
                .map(|e| (e.value().clone(), e.key().clone()))
                .collect();
            for (id, destination) in &subs {
                let frame = subscribe_frame(id, destination);
                write_frame(&mut link_new.writer, &frame).await.map_err(|e| {
                    RelayError::BrokerUnavailable(format!("resubscribe failed: {e}"))
                })?;
            }
            *link = Some(link_new);
            // Set under the link lock: a loss seen by the reader lands after it.
            this.set_state(BrokerState::Connected);
        }

        tokio::spawn(Inner::read_loop(Arc::clone(this), reader, leftover, generation));
        tracing::info!(%addr, generation, subscriptions = this.subscriptions.len(), "broker connected");
        Ok(())
    }

    async fn handshake(&self, addr: &str) -> Result<(OwnedReadHalf, OwnedWriteHalf, BytesMut)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::BrokerUnavailable(format!("connect to {addr} failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", self.cfg.virtual_host.as_str())
            .header("login", self.cfg.system_login.as_str())
            .header("passcode", self.cfg.system_passcode.as_str())
            .header("heart-beat", "0,0");
        write_frame(&mut writer, &connect)
            .await
            .map_err(|e| RelayError::BrokerUnavailable(format!("send CONNECT failed: {e}")))?;

        let mut buf = BytesMut::with_capacity(4096);
        let reply = loop {
            if let Some(frame) = stomp::decode(&mut buf, DEFAULT_MAX_FRAME_BYTES)? {
                break frame;
            }
            let n = reader
                .read_buf(&mut buf)
                .await
                .map_err(|e| RelayError::BrokerUnavailable(format!("read CONNECTED failed: {e}")))?;
            if n == 0 {
                return Err(RelayError::BrokerUnavailable(
                    "broker closed connection during handshake".into(),
                ));
            }
        };

        match reply.command {
            Command::Connected => {
                tracing::debug!(version = reply.get("version").unwrap_or("?"), "stomp session established");
                Ok((reader, writer, buf))
            }
            Command::Error => Err(RelayError::BrokerUnavailable(format!(
                "broker refused connection: {}",
                reply.get("message").unwrap_or("no message")
            ))),
            other => Err(RelayError::BrokerUnavailable(format!(
                "unexpected {other} during handshake"
            ))),
        }
    }

    async fn read_loop(this: Arc<Self>, mut reader: OwnedReadHalf, mut buf: BytesMut, generation: u64) {
        let reason = loop {
            match stomp::decode(&mut buf, DEFAULT_MAX_FRAME_BYTES) {
                Ok(Some(frame)) => {
                    if let Some(reason) = this.on_frame(frame) {
                        break reason;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => break format!("undecodable frame: {e}"),
            }
            match reader.read_buf(&mut buf).await {
                Ok(0) => break "connection closed by broker".to_string(),
                Ok(_) => {}
                Err(e) => break format!("read failed: {e}"),
            }
        };
        Inner::on_connection_lost(&this, generation, &reason).await;
    }

    /// Handle one inbound frame. Returns a reason when the connection is unusable.
    fn on_frame(&self, frame: Frame) -> Option<String> {
        match frame.command {
            Command::Message => {
                let destination = frame
                    .get("destination")
                    .map(str::to_string)
                    .or_else(|| {
                        frame
                            .get("subscription")
                            .and_then(|id| self.sub_destinations.get(id).map(|d| d.value().clone()))
                    });
                let Some(destination) = destination else {
                    tracing::warn!("MESSAGE without destination dropped");
                    return None;
                };
                match Message::decode_slice(&frame.body) {
                    Ok(msg) => {
                        let n = self.topics.fanout(&destination, Arc::new(msg));
                        tracing::trace!(%destination, receivers = n, "broker delivery");
                    }
                    Err(e) => tracing::warn!(%destination, error = %e, "undecodable broker message dropped"),
                }
                None
            }
            Command::Receipt => {
                if let Some(id) = frame.get("receipt-id") {
                    if let Some((_, waiter)) = self.pending.remove(id) {
                        let _ = waiter.send(());
                    }
                }
                None
            }
            Command::Error => Some(format!(
                "broker error: {}",
                frame.get("message").unwrap_or("no message")
            )),
            other => {
                tracing::debug!(command = %other, "ignoring unexpected broker frame");
                None
            }
        }
    }

    /// Tear down the link for `generation` and schedule a reconnect.
    /// Only the first report for a live generation acts; late or stale
    /// reports are ignored.
    async fn on_connection_lost(this: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut link = this.link.lock().await;
            match link.as_ref() {
                Some(l) if l.generation == generation => *link = None,
                _ => return,
            }
        }
        // Waiters see their sender dropped and fail with BrokerUnavailable.
        this.pending.clear();

        if this.is_closed() {
            return;
        }
        tracing::warn!(generation, %reason, "broker connection lost");
        this.set_state(BrokerState::Degraded);
        Inner::spawn_reconnect(this);
    }

    fn spawn_reconnect(this: &Arc<Self>) {
        if this.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(this);
        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
            // A loss reported while this loop was finishing found the flag set.
            if this.current() == BrokerState::Degraded && !this.is_closed() {
                Inner::spawn_reconnect(&this);
            }
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.cfg.reconnect_initial_ms),
            Duration::from_millis(self.cfg.reconnect_max_ms),
        );
        let mut closed = self.closed.subscribe();

        loop {
            let delay = backoff.next_delay();
            tracing::debug!(
                attempt = backoff.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "broker reconnect scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed.changed() => {}
            }
            if self.is_closed() {
                return;
            }

            match Inner::connect(self).await {
                Ok(()) => {
                    tracing::info!(attempts = backoff.attempt(), "broker reconnected");
                    return;
                }
                Err(e) => {
                    let attempt = backoff.attempt();
                    if attempt <= 3 || attempt % 10 == 0 {
                        tracing::warn!(attempt, error = %e, "broker reconnect failed");
                    }
                    if !self.is_closed() {
                        self.set_state(BrokerState::Degraded);
                    }
                }
            }
        }
    }

    /// Wait out a `Connecting` phase, bounded by the connect timeout.
    async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    BrokerState::Connected => return Ok(()),
                    BrokerState::Connecting => {}
                    other => return Err(RelayError::BrokerUnavailable(format!("broker {other}"))),
                }
                if rx.changed().await.is_err() {
                    return Err(RelayError::BrokerUnavailable("bridge dropped".into()));
                }
            }
        };
        timeout(self.connect_timeout(), wait).await.map_err(|_| {
            RelayError::BrokerUnavailable("timed out waiting for broker connection".into())
        })?
    }
}

fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

async fn write_frame(w: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(256 + frame.body.len());
    stomp::encode(frame, &mut buf);
    w.write_all(&buf).await?;
    w.flush().await
}

#[async_trait]
impl BrokerBridge for StompBroker {
    fn name(&self) -> &'static str {
        "stomp"
    }

    async fn publish(&self, destination: &str, message: &Message) -> Result<()> {
        let inner = &self.inner;
        match inner.current() {
            BrokerState::Connected => {}
            BrokerState::Connecting => inner.wait_connected().await?,
            other => return Err(RelayError::BrokerUnavailable(format!("broker {other}"))),
        }

        let body = message.encode()?;
        let receipt = inner.next_id("r");
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("receipt", receipt.as_str())
            .with_body(body.into_bytes());

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(receipt.clone(), tx);

        let written = {
            let mut link = inner.link.lock().await;
            match link.as_mut() {
                None => Err(None),
                Some(l) => {
                    let generation = l.generation;
                    match timeout(inner.publish_timeout(), write_frame(&mut l.writer, &frame)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(Some((generation, e.to_string()))),
                        Err(_) => Err(Some((generation, "write timed out".to_string()))),
                    }
                }
            }
        };

        match written {
            Ok(()) => {}
            Err(None) => {
                inner.pending.remove(&receipt);
                if inner.current() == BrokerState::Connected && !inner.is_closed() {
                    tracing::warn!("broker marked connected without a link");
                    inner.set_state(BrokerState::Degraded);
                    Inner::spawn_reconnect(inner);
                }
                return Err(RelayError::BrokerUnavailable("no broker connection".into()));
            }
            Err(Some((generation, reason))) => {
                inner.pending.remove(&receipt);
                Inner::on_connection_lost(inner, generation, &reason).await;
                return Err(RelayError::BrokerUnavailable(format!("publish failed: {reason}")));
            }
        }

        match timeout(inner.publish_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::BrokerUnavailable(
                "connection lost before receipt".into(),
            )),
            Err(_) => {
                inner.pending.remove(&receipt);
                Err(RelayError::BrokerUnavailable("broker receipt timed out".into()))
            }
        }
    }

    async fn subscribe(&self, destination: &str) -> Result<broadcast::Receiver<Delivery>> {
        let inner = &self.inner;
        let rx = inner.topics.subscribe(destination);

        let failed = {
            let mut link = inner.link.lock().await;
            let id = match inner.subscriptions.entry(destination.to_string()) {
                Entry::Occupied(_) => return Ok(rx),
                Entry::Vacant(v) => {
                    let id = inner.next_id("sub");
                    v.insert(id.clone());
                    inner.sub_destinations.insert(id.clone(), destination.to_string());
                    id
                }
            };
            // Not connected: the next successful connect sends it.
            match link.as_mut() {
                None => None,
                Some(l) => write_frame(&mut l.writer, &subscribe_frame(&id, destination))
                    .await
                    .err()
                    .map(|e| (l.generation, e.to_string())),
            }
        };

        if let Some((generation, reason)) = failed {
            Inner::on_connection_lost(inner, generation, &reason).await;
        }
        tracing::debug!(%destination, "broker subscription registered");
        Ok(rx)
    }

    fn state(&self) -> BrokerState {
        self.inner.current()
    }

    fn state_watch(&self) -> watch::Receiver<BrokerState> {
        self.inner.state.subscribe()
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.send_replace(true);

        let link = inner.link.lock().await.take();
        if let Some(mut l) = link {
            let disconnect = Frame::new(Command::Disconnect).header("receipt", inner.next_id("bye"));
            if let Err(e) = write_frame(&mut l.writer, &disconnect).await {
                tracing::debug!(error = %e, "DISCONNECT not delivered");
            }
            let _ = l.writer.shutdown().await;
        }
        inner.pending.clear();
        inner.set_state(BrokerState::Disconnected);
        tracing::info!("broker bridge shut down");
    }
}
