//! Push hub: the server end of the push connection.
//!
//! ```text
//! publish(topic, event) ──► TopicGroup (seq, broadcast::Sender)
//!                                 │ encoded once
//!                  ┌──────────────┼──────────────┐
//!                  ▼              ▼              ▼
//!              forwarder      forwarder      forwarder     (one per peer × topic)
//!                  │              │              │
//!               peer ws        peer ws        peer ws
//! ```
//!
//! Peers send `Subscribe`/`Unsubscribe` frames; each subscription spawns a
//! forwarder that copies the topic's broadcast stream into the peer's
//! socket. Sequence numbers are per topic.
//!
//! A topic group lives only while someone listens: the forwarder that
//! drops the last receiver removes it, and publishing to a topic nobody
//! follows is a no-op that creates nothing. A recreated group numbers its
//! events from 1 again; subscribers start a fresh sequence on subscribe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use newhire_core::Topic;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{ClientFrame, ProtocolError, PushEvent, ServerFrame};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// `host:port` to listen on; port 0 picks a free one.
    pub bind_addr: String,
    /// Events buffered per subscriber before it starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Peers accepted since start.
    pub total_connections: u64,
    /// Peers connected right now.
    pub active_connections: u64,
    /// Calls to `publish`, whether or not anyone was listening.
    pub events_published: u64,
    /// Events skipped by subscribers that fell behind their buffer.
    pub events_lagged: u64,
    /// Topics with at least one subscribed peer.
    pub active_topics: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    events_published: AtomicU64,
    events_lagged: AtomicU64,
}

struct TopicGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    seq: u64,
}

struct HubShared {
    config: HubConfig,
    topics: Mutex<HashMap<Topic, TopicGroup>>,
    stats: AtomicHubStats,
    /// Replaced on every `drop_connections`.
    kick: Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl HubShared {
    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.clone())
            .or_insert_with(|| TopicGroup {
                sender: broadcast::channel(self.config.broadcast_capacity).0,
                seq: 0,
            })
            .sender
            .subscribe()
    }

    /// Drop the topic's group once its last receiver is gone.
    fn prune(&self, topic: &Topic) {
        let mut topics = self.topics.lock();
        if topics
            .get(topic)
            .is_some_and(|group| group.sender.receiver_count() == 0)
        {
            topics.remove(topic);
            log::debug!("No subscribers left on {topic}, dropped its group");
        }
    }
}

pub struct PushHub {
    shared: Arc<HubShared>,
}

impl PushHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            shared: Arc::new(HubShared {
                config,
                topics: Mutex::new(HashMap::new()),
                stats: AtomicHubStats::default(),
                kick: Mutex::new(CancellationToken::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Bind and serve in the background. Returns the bound address, which
    /// matters when `bind_addr` asks for port 0.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Push hub listening on {addr}");
        tokio::spawn(Self::serve(listener, self.shared.clone()));
        Ok(addr)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Push hub listening on {}", self.shared.config.bind_addr);
        Self::serve(listener, self.shared.clone()).await;
        Ok(())
    }

    async fn serve(listener: TcpListener, shared: Arc<HubShared>) {
        loop {
            let accepted = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Err(e) => log::warn!("accept failed: {e}"),
            }
        }
        log::info!("Push hub stopped");
    }

    /// Encode the event once and fan it out to every subscriber of
    /// `topic`. Returns how many peers it reached.
    pub fn publish(&self, topic: &Topic, event: PushEvent) -> Result<usize, ProtocolError> {
        self.shared
            .stats
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        let mut topics = self.shared.topics.lock();
        let Some(group) = topics.get_mut(topic) else {
            return Ok(0);
        };
        group.seq += 1;
        let frame = ServerFrame::Event {
            topic: topic.clone(),
            seq: group.seq,
            event,
        };
        let encoded = Arc::new(frame.encode()?);
        Ok(group.sender.send(encoded).unwrap_or(0))
    }

    /// Peers currently subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map_or(0, |group| group.sender.receiver_count())
    }

    /// Close every open peer connection. The hub keeps accepting new ones.
    pub fn drop_connections(&self) {
        let mut kick = self.shared.kick.lock();
        kick.cancel();
        *kick = CancellationToken::new();
        log::info!("Dropping all peer connections");
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn stats(&self) -> HubStats {
        let stats = &self.shared.stats;
        HubStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            events_published: stats.events_published.load(Ordering::Relaxed),
            events_lagged: stats.events_lagged.load(Ordering::Relaxed),
            active_topics: self.shared.topics.lock().len(),
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<HubShared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let peer = PeerSession::open(shared.clone());
        log::info!("Peer {} connected from {addr}", peer.id);
        let result = Self::pump_peer(ws_stream, peer).await;
        log::info!("Connection closed from {addr}");
        result
    }

    async fn pump_peer(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut peer: PeerSession,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let kick = peer.shared.kick.lock().clone();
        let shutdown = peer.shared.shutdown.clone();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

        loop {
            tokio::select! {
                _ = kick.cancelled() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                _ = shutdown.cancelled() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                Some(data) = out_rx.recv() => {
                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                }
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match ClientFrame::decode(&data) {
                        Ok(ClientFrame::Subscribe { topic }) => {
                            peer.subscribe(&topic, &out_tx);
                            let ack = ServerFrame::Subscribed { topic }.encode()?;
                            ws_sender.send(Message::Binary(ack.into())).await?;
                        }
                        Ok(ClientFrame::Unsubscribe { topic }) => peer.unsubscribe(&topic),
                        Ok(ClientFrame::Ping { nonce }) => {
                            let pong = ServerFrame::Pong { nonce }.encode()?;
                            ws_sender.send(Message::Binary(pong.into())).await?;
                        }
                        Err(e) => log::warn!("Failed to decode frame from peer {}: {e}", peer.id),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from peer {}: {e}", peer.id);
                        break;
                    }
                },
            }
        }
        Ok(())
    }
}

/// Per-peer subscriptions. Dropping it stops every forwarder and updates
/// the connection gauges.
struct PeerSession {
    id: Uuid,
    shared: Arc<HubShared>,
    /// Cancels the forwarder of each subscribed topic.
    forwarders: HashMap<Topic, CancellationToken>,
}

impl PeerSession {
    fn open(shared: Arc<HubShared>) -> Self {
        shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        Self {
            id: Uuid::new_v4(),
            shared,
            forwarders: HashMap::new(),
        }
    }

    fn subscribe(&mut self, topic: &Topic, out: &mpsc::UnboundedSender<Arc<Vec<u8>>>) {
        if self.forwarders.contains_key(topic) {
            return;
        }
        let mut rx = self.shared.subscribe(topic);
        let out = out.clone();
        let shared = self.shared.clone();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let owned_topic = topic.clone();
        let label = format!("{} on {topic}", self.id);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(data) => {
                        if out.send(data).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        shared.stats.events_lagged.fetch_add(n, Ordering::Relaxed);
                        log::warn!("Peer {label} lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            drop(rx);
            shared.prune(&owned_topic);
        });
        log::debug!("Peer {} subscribed to {topic}", self.id);
        self.forwarders.insert(topic.clone(), cancel);
    }

    fn unsubscribe(&mut self, topic: &Topic) {
        if let Some(cancel) = self.forwarders.remove(topic) {
            cancel.cancel();
            log::debug!("Peer {} unsubscribed from {topic}", self.id);
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        for (_, cancel) in self.forwarders.drain() {
            cancel.cancel();
        }
        self.shared
            .stats
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}
