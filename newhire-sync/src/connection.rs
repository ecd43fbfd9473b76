//! Push connection manager.
//!
//! Owns the single WebSocket to the push endpoint and keeps it alive:
//!
//! ```text
//!   Disconnected ──connect()──► Connecting ──ok──► Connected
//!        ▲                          │                 │
//!        └──── backoff sleep ◄──────┴──── lost ◄──────┘
//! ```
//!
//! The supervisor task retries until [`ConnectionManager::teardown`] with
//! exponential backoff plus jitter; the attempt counter resets after every
//! successful connect. Decoded server frames and lifecycle changes are
//! forwarded as [`ConnectionEvent`]s to whoever took the event receiver,
//! normally the topic registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::topics::Transport;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection established. `resumed` is false only for the first one.
    Connected { resumed: bool },
    Disconnected,
    Frame(ServerFrame),
}

type StatusListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ConnectionManager {
    config: SyncConfig,
    url: Url,
    state: watch::Sender<ConnectionState>,
    listeners: RwLock<Vec<StatusListener>>,
    /// Writer channel of the live connection, if any.
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    connects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: SyncConfig) -> Result<Arc<Self>, SyncError> {
        config.validate()?;
        let url = config.push_url()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::channel(256);
        Ok(Arc::new(Self {
            config,
            url,
            state,
            listeners: RwLock::new(Vec::new()),
            outgoing: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
            connects: AtomicU64::new(0),
        }))
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.lock().take()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register a callback for status transitions. Only real changes are
    /// reported.
    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Number of successful connects so far.
    pub fn connection_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Start the supervisor. Idempotent; does nothing after teardown.
    pub fn connect(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let this = self.clone();
        *supervisor = Some(tokio::spawn(async move { this.supervise().await }));
    }

    /// Stop reconnecting and close the live connection, if any.
    pub async fn teardown(&self) {
        self.shutdown.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("connection supervisor ended abnormally: {e}");
            }
        }
        self.outgoing.lock().take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Wait until the status equals `target`. Returns false if the manager
    /// is dropped first.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(|state| *state == target).await.is_ok();
        reached
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            log::debug!("push connection state: {next:?}");
            let listeners = self.listeners.read().clone();
            for listener in listeners {
                listener(next);
            }
        }
    }

    async fn emit(&self, event: ConnectionEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = Backoff::from_config(&self.config);
        let mut resumed = false;

        while !self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = tokio_tungstenite::connect_async(self.url.as_str()) => attempt,
            };

            match attempt {
                Ok((stream, _)) => {
                    backoff.reset();
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    *self.outgoing.lock() = Some(out_tx);
                    self.connects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    log::info!("push connection established to {}", self.url);
                    if !self.emit(ConnectionEvent::Connected { resumed }).await {
                        log::debug!("no consumer for connection events");
                    }
                    resumed = true;

                    self.pump(stream, out_rx).await;
                    self.outgoing.lock().take();
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    log::warn!("push connection to {} lost", self.url);
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ConnectionEvent::Disconnected).await;
                }
                Err(e) => {
                    log::debug!("connect to {} failed: {e}", self.url);
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            let delay = backoff.next_delay();
            log::debug!("reconnecting in {delay:?} (attempt {})", backoff.attempt());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.outgoing.lock().take();
        self.set_state(ConnectionState::Disconnected);
        log::debug!("connection supervisor stopped");
    }

    /// Run one connection until it closes, fails, or teardown is requested.
    async fn pump(&self, stream: PushStream, mut outgoing: mpsc::UnboundedReceiver<ClientFrame>) {
        let (mut writer, mut reader) = stream.split();
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut nonce = 0u64;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    nonce += 1;
                    match (ClientFrame::Ping { nonce }).encode() {
                        Ok(bytes) => {
                            if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                                log::debug!("heartbeat failed: {e}");
                                break;
                            }
                        }
                        Err(e) => log::error!("failed to encode heartbeat: {e}"),
                    }
                }
                frame = outgoing.recv() => match frame {
                    Some(frame) => match frame.encode() {
                        Ok(bytes) => {
                            if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                                log::warn!("failed to send {frame:?}: {e}");
                                break;
                            }
                        }
                        Err(e) => log::error!("failed to encode {frame:?}: {e}"),
                    },
                    None => break,
                },
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(frame) => {
                            if !self.emit(ConnectionEvent::Frame(frame)).await {
                                log::debug!("event consumer gone, dropping frame");
                            }
                        }
                        Err(e) => log::warn!("undecodable push frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("push connection read error: {e}");
                        break;
                    }
                },
            }
        }
    }
}

impl Transport for ConnectionManager {
    fn send(&self, frame: ClientFrame) -> Result<(), SyncError> {
        if self.status() != ConnectionState::Connected {
            return Err(SyncError::NetworkUnavailable);
        }
        match self.outgoing.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| SyncError::NetworkUnavailable),
            None => Err(SyncError::NetworkUnavailable),
        }
    }
}
