//! Topic registry: local fan-out of push events.
//!
//! Any number of handlers may listen on a topic. The first handler on a
//! topic makes the registry send `Subscribe` upstream; the last one to
//! leave sends `Unsubscribe`. Handlers are called synchronously, in
//! registration order, with the registry lock released, and a panicking
//! handler does not stop the others.
//!
//! After the push connection comes (back) up every live topic is
//! re-subscribed and its handlers receive [`TopicSignal::Resync`], since
//! events may have been missed while the connection was down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use newhire_core::Topic;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::connection::ConnectionEvent;
use crate::error::SyncError;
use crate::protocol::{ClientFrame, PushEvent, ServerFrame};

/// What a topic handler is told.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicSignal {
    Event(PushEvent),
    /// Local state for this topic may have missed events; re-fetch it.
    Resync,
}

/// Outgoing half of the push connection.
pub trait Transport: Send + Sync {
    fn send(&self, frame: ClientFrame) -> Result<(), SyncError>;
}

type Handler = Arc<dyn Fn(&TopicSignal) + Send + Sync>;

struct TopicEntry {
    handlers: Vec<(u64, Handler)>,
    last_seq: Option<u64>,
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    topics: RwLock<HashMap<Topic, TopicEntry>>,
    next_handler: AtomicU64,
}

impl RegistryInner {
    fn send_interest(&self, frame: ClientFrame) {
        match self.transport.send(frame) {
            Ok(()) => {}
            Err(SyncError::NetworkUnavailable) => {
                log::debug!("push connection down, interest change deferred to reconnect")
            }
            Err(e) => log::warn!("failed to send topic interest: {e}"),
        }
    }

    fn remove_handler(&self, topic: &Topic, id: u64) {
        let emptied = {
            let mut topics = self.topics.write();
            match topics.get_mut(topic) {
                Some(entry) => {
                    entry.handlers.retain(|(hid, _)| *hid != id);
                    if entry.handlers.is_empty() {
                        topics.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if emptied {
            log::debug!("last handler left {topic}, unsubscribing");
            self.send_interest(ClientFrame::Unsubscribe {
                topic: topic.clone(),
            });
        }
    }
}

/// Handle returned by [`TopicRegistry::subscribe`].
///
/// The handler stays registered until this is dropped or
/// [`unsubscribe`](Subscription::unsubscribe) is called.
pub struct Subscription {
    registry: Weak<RegistryInner>,
    topic: Topic,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.registry.upgrade() {
            inner.remove_handler(&self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Clone)]
pub struct TopicRegistry {
    inner: Arc<RegistryInner>,
}

impl TopicRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                topics: RwLock::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&TopicSignal) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut topics = self.inner.topics.write();
            let entry = topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
                handlers: Vec::new(),
                last_seq: None,
            });
            entry.handlers.push((id, Arc::new(handler)));
            entry.handlers.len() == 1
        };
        if first {
            log::debug!("first handler on {topic}, subscribing");
            self.inner.send_interest(ClientFrame::Subscribe {
                topic: topic.clone(),
            });
        }
        Subscription {
            registry: Arc::downgrade(&self.inner),
            topic,
            id,
            active: true,
        }
    }

    /// Deliver an event to every handler on `topic`. Returns how many
    /// handlers were called.
    pub fn publish(&self, topic: &Topic, event: PushEvent) -> usize {
        self.dispatch(topic, &TopicSignal::Event(event))
    }

    pub fn resync(&self, topic: &Topic) -> usize {
        self.dispatch(topic, &TopicSignal::Resync)
    }

    fn dispatch(&self, topic: &Topic, signal: &TopicSignal) -> usize {
        let handlers: Vec<Handler> = self
            .inner
            .topics
            .read()
            .get(topic)
            .map(|entry| entry.handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(signal))).is_err() {
                log::error!("handler on {topic} panicked, continuing with the rest");
            }
        }
        handlers.len()
    }

    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { resumed } => self.on_connected(resumed),
            ConnectionEvent::Disconnected => {
                log::info!(
                    "push connection lost, {} topics pending resync",
                    self.inner.topics.read().len()
                );
            }
            ConnectionEvent::Frame(frame) => self.on_frame(frame),
        }
    }

    /// Consume connection events until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_connection_event(event);
        }
        log::debug!("connection event stream closed");
    }

    fn on_connected(&self, resumed: bool) {
        let topics: Vec<Topic> = {
            let mut topics = self.inner.topics.write();
            for entry in topics.values_mut() {
                entry.last_seq = None;
            }
            topics.keys().cloned().collect()
        };
        if resumed {
            log::info!("push connection restored, resyncing {} topics", topics.len());
        } else {
            log::info!("push connection up, {} topics registered", topics.len());
        }
        for topic in &topics {
            self.inner.send_interest(ClientFrame::Subscribe {
                topic: topic.clone(),
            });
        }
        for topic in &topics {
            self.resync(topic);
        }
    }

    fn on_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Event { topic, seq, event } => {
                if !self.accept_seq(&topic, seq) {
                    log::warn!("dropping out-of-order event #{seq} on {topic}");
                    return;
                }
                self.publish(&topic, event);
            }
            ServerFrame::Subscribed { topic } => log::debug!("server confirmed {topic}"),
            ServerFrame::Pong { nonce } => log::trace!("pong {nonce}"),
        }
    }

    fn accept_seq(&self, topic: &Topic, seq: u64) -> bool {
        let mut topics = self.inner.topics.write();
        let Some(entry) = topics.get_mut(topic) else {
            return true;
        };
        if entry.last_seq.is_some_and(|last| seq <= last) {
            return false;
        }
        entry.last_seq = Some(seq);
        true
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.inner.topics.read().keys().cloned().collect()
    }

    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, |entry| entry.handlers.len())
    }

    /// Forget every topic without telling the server.
    pub fn clear(&self) {
        self.inner.topics.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CountChange;
    use newhire_core::{Entity, EntityId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<ClientFrame>>,
        offline: std::sync::atomic::AtomicBool,
    }

    impl Transport for RecordingTransport {
        fn send(&self, frame: ClientFrame) -> Result<(), SyncError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::NetworkUnavailable);
            }
            self.sent.lock().push(frame);
            Ok(())
        }
    }

    fn registry() -> (Arc<RecordingTransport>, TopicRegistry) {
        let transport = Arc::new(RecordingTransport::default());
        (transport.clone(), TopicRegistry::new(transport))
    }

    fn recorder() -> (Arc<Mutex<Vec<TopicSignal>>>, impl Fn(&TopicSignal) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |signal: &TopicSignal| sink.lock().push(signal.clone()))
    }

    #[test]
    fn test_first_and_last_handler_drive_interest() {
        let (transport, registry) = registry();
        let topic = Topic::channel("general");

        let a = registry.subscribe(topic.clone(), |_| {});
        let b = registry.subscribe(topic.clone(), |_| {});
        assert_eq!(transport.sent.lock().len(), 1);

        drop(a);
        assert_eq!(transport.sent.lock().len(), 1);
        b.unsubscribe();

        let sent = transport.sent.lock();
        assert_eq!(
            *sent,
            vec![
                ClientFrame::Subscribe { topic: topic.clone() },
                ClientFrame::Unsubscribe { topic: topic.clone() },
            ]
        );
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let (_, registry) = registry();
        let topic = Topic::board();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for n in 0..3 {
            let order = order.clone();
            subs.push(registry.subscribe(topic.clone(), move |_| order.lock().push(n)));
        }
        let delivered = registry.publish(&topic, PushEvent::Deleted { id: EntityId(1) });
        assert_eq!(delivered, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let (_, registry) = registry();
        let topic = Topic::user_stats(7);
        let (seen, handler) = recorder();
        let _bad = registry.subscribe(topic.clone(), |_| panic!("widget exploded"));
        let _good = registry.subscribe(topic.clone(), handler);

        registry.publish(&topic, PushEvent::CountChanged(CountChange::Delta(1)));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(registry.handler_count(&topic), 2);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_dispatch() {
        let (_, registry) = registry();
        let topic = Topic::channel("random");
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let sub = registry.subscribe(topic.clone(), move |_| {
            inner.lock().take();
        });
        *slot.lock() = Some(sub);

        registry.publish(&topic, PushEvent::Deleted { id: EntityId(2) });
        assert_eq!(registry.handler_count(&topic), 0);
    }

    #[test]
    fn test_reconnect_resubscribes_and_resyncs() {
        let (transport, registry) = registry();
        let topic = Topic::user_activity(3);
        let (seen, handler) = recorder();
        let _sub = registry.subscribe(topic.clone(), handler);
        transport.sent.lock().clear();

        registry.handle_connection_event(ConnectionEvent::Disconnected);
        registry.handle_connection_event(ConnectionEvent::Connected { resumed: true });

        assert_eq!(
            *transport.sent.lock(),
            vec![ClientFrame::Subscribe { topic: topic.clone() }]
        );
        assert_eq!(*seen.lock(), vec![TopicSignal::Resync]);
    }

    #[test]
    fn test_subscribe_while_offline_is_sent_on_connect() {
        let (transport, registry) = registry();
        transport.offline.store(true, Ordering::SeqCst);
        let topic = Topic::channel("general");
        let _sub = registry.subscribe(topic.clone(), |_| {});
        assert!(transport.sent.lock().is_empty());

        transport.offline.store(false, Ordering::SeqCst);
        registry.handle_connection_event(ConnectionEvent::Connected { resumed: false });
        assert_eq!(
            *transport.sent.lock(),
            vec![ClientFrame::Subscribe { topic }]
        );
    }

    #[test]
    fn test_out_of_order_frames_dropped() {
        let (_, registry) = registry();
        let topic = Topic::board();
        let (seen, handler) = recorder();
        let _sub = registry.subscribe(topic.clone(), handler);

        let frame = |seq| {
            ConnectionEvent::Frame(ServerFrame::Event {
                topic: topic.clone(),
                seq,
                event: PushEvent::Created(Entity::new(seq)),
            })
        };
        registry.handle_connection_event(frame(1));
        registry.handle_connection_event(frame(2));
        registry.handle_connection_event(frame(2));
        registry.handle_connection_event(frame(1));
        registry.handle_connection_event(frame(3));
        assert_eq!(seen.lock().len(), 3);

        // Sequence numbering restarts with a new connection.
        registry.handle_connection_event(ConnectionEvent::Connected { resumed: true });
        registry.handle_connection_event(frame(1));
        assert_eq!(seen.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_run_pumps_events() {
        let (_, registry) = registry();
        let topic = Topic::channel("general");
        let (seen, handler) = recorder();
        let _sub = registry.subscribe(topic.clone(), handler);

        let (tx, rx) = mpsc::channel(8);
        let pump = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run(rx).await })
        };
        tx.send(ConnectionEvent::Frame(ServerFrame::Event {
            topic,
            seq: 1,
            event: PushEvent::Deleted { id: EntityId(4) },
        }))
        .await
        .unwrap();
        drop(tx);
        pump.await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }
}
