//! Windowed collection store.
//!
//! A window is one page (`offset`, `limit`) of a server collection plus the
//! collection's total count. Item state lives in the shared
//! [`EntityStore`]; the window only keeps the ordered ids.
//!
//! Loads are last-request-wins: every load gets a fresh token and cancels
//! the one before it, and a result is applied only if its token is still
//! the latest when it arrives.
//!
//! Push events on the window's topic are folded in as they arrive:
//!
//! | event          | offset 0                          | offset > 0           |
//! |----------------|-----------------------------------|----------------------|
//! | `Created`      | insert at head, trim, total += 1  | total += 1           |
//! | `Updated`      | entity fields only                | entity fields only   |
//! | `Deleted`      | drop id, total -= 1 (clamped)     | drop id, total -= 1  |
//! | `CountChanged` | adjust total (clamped)            | adjust total         |
//!
//! A `Created` for an id already seen since the last load is ignored, so a
//! duplicated event never counts twice. Clamped: on the first page the
//! total never drops below the number of items shown.
//!
//! After a reconnect the window is marked stale and reloaded; a failed
//! reload is retried with backoff until one succeeds or the window is
//! dropped.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use newhire_core::{Entity, EntityId, EntityKey, ResourceKind, Topic};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::PageSource;
use crate::backoff::Backoff;
use crate::error::SyncError;
use crate::policy::UpdateSource;
use crate::protocol::{CountChange, PushEvent};
use crate::store::EntityStore;
use crate::topics::{Subscription, TopicRegistry, TopicSignal};

const RESYNC_BASE_DELAY: Duration = Duration::from_millis(500);
const RESYNC_MAX_DELAY: Duration = Duration::from_secs(30);

/// Published state of a window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Index of the first item of the page within the collection.
    pub offset: usize,
    /// Page size.
    pub limit: usize,
    /// Ids on the page, in server order. Entity state is in the store.
    pub items: Vec<EntityId>,
    /// Size of the whole collection as last reported or adjusted by pushes.
    pub total: u64,
    /// Message of the last failed load, cleared by the next success.
    pub error: Option<String>,
    /// A load is in flight.
    pub loading: bool,
    /// Set after a reconnect until the next successful load.
    pub stale: bool,
}

impl Window {
    fn empty(limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            items: Vec::new(),
            total: 0,
            error: None,
            loading: false,
            stale: false,
        }
    }

    pub fn page_count(&self) -> u64 {
        let limit = self.limit.max(1) as u64;
        self.total.div_ceil(limit)
    }

    /// Zero-based index of the current page.
    pub fn page(&self) -> usize {
        self.offset / self.limit.max(1)
    }

    pub fn has_previous(&self) -> bool {
        self.offset > 0
    }

    pub fn has_next(&self) -> bool {
        ((self.offset + self.limit) as u64) < self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// A newer load was issued before this one resolved.
    Superseded,
    /// No page in the requested direction.
    OutOfRange,
}

/// A window together with its entities, resolved from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowView {
    pub window: Window,
    pub entities: Vec<Entity>,
}

struct WindowState {
    window: Window,
    /// Ids already counted into `total` by a push since the last load.
    counted: HashSet<EntityId>,
    latest: u64,
    in_flight: Option<CancellationToken>,
    /// Bumped per reconnect; an older retry loop stops when it changes.
    resync_epoch: u64,
}

pub struct WindowedStore {
    topic: Topic,
    kind: ResourceKind,
    store: Arc<EntityStore>,
    source: Arc<dyn PageSource>,
    state: Mutex<WindowState>,
    published: watch::Sender<Window>,
    resync_backoff: Mutex<Backoff>,
}

impl WindowedStore {
    pub fn new(
        topic: Topic,
        store: Arc<EntityStore>,
        source: Arc<dyn PageSource>,
        limit: usize,
    ) -> Arc<Self> {
        let window = Window::empty(limit.max(1));
        let (published, _) = watch::channel(window.clone());
        Arc::new(Self {
            kind: topic.resource_kind(),
            topic,
            store,
            source,
            state: Mutex::new(WindowState {
                window,
                counted: HashSet::new(),
                latest: 0,
                in_flight: None,
                resync_epoch: 0,
            }),
            published,
            resync_backoff: Mutex::new(Backoff::new(RESYNC_BASE_DELAY, RESYNC_MAX_DELAY)),
        })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Collection the window's ids belong to.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Delay schedule between failed reloads after a reconnect.
    pub fn set_resync_backoff(&self, base: Duration, max: Duration) {
        *self.resync_backoff.lock() = Backoff::new(base, max);
    }

    pub fn window(&self) -> Window {
        self.state.lock().window.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Window> {
        self.published.subscribe()
    }

    /// Current window with its entities resolved, in window order.
    pub fn view(&self) -> WindowView {
        let window = self.window();
        let entities = self.store.get_many(self.kind, &window.items);
        WindowView { window, entities }
    }

    pub async fn load_page(&self, offset: usize, limit: usize) -> Result<LoadOutcome, SyncError> {
        let limit = limit.max(1);
        let cancel = CancellationToken::new();
        let token = {
            let mut state = self.state.lock();
            state.latest += 1;
            if let Some(previous) = state.in_flight.replace(cancel.clone()) {
                previous.cancel();
            }
            state.window.loading = true;
            self.publish(&state.window);
            state.latest
        };
        log::debug!("{}: loading offset={offset} limit={limit} (#{token})", self.topic);

        let fetched = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("{}: load #{token} superseded", self.topic);
                return Ok(LoadOutcome::Superseded);
            }
            fetched = self.source.fetch_page(&self.topic, offset, limit) => fetched,
        };

        let mut state = self.state.lock();
        if state.latest != token {
            log::debug!("{}: page #{token}: {}", self.topic, SyncError::StaleResponse);
            return Ok(LoadOutcome::Superseded);
        }
        state.in_flight = None;
        state.window.loading = false;

        match fetched {
            Ok(page) => {
                let mut items = Vec::with_capacity(limit.min(page.items.len()));
                for entity in page.items.into_iter().take(limit) {
                    items.push(entity.id);
                    self.store.ingest_entity(self.kind, entity, UpdateSource::Fetch);
                }
                let window = &mut state.window;
                window.offset = offset;
                window.limit = limit;
                window.total = if offset == 0 {
                    page.total.max(items.len() as u64)
                } else {
                    page.total
                };
                window.items = items;
                window.error = None;
                window.stale = false;
                state.counted.clear();
                self.publish(&state.window);
                Ok(LoadOutcome::Applied)
            }
            Err(err) => {
                let message = match err {
                    SyncError::FetchFailed(message) => message,
                    other => other.to_string(),
                };
                log::warn!("{}: page load failed: {message}", self.topic);
                state.window.error = Some(message.clone());
                self.publish(&state.window);
                Err(SyncError::FetchFailed(message))
            }
        }
    }

    /// Re-fetch the current page.
    pub async fn reload(&self) -> Result<LoadOutcome, SyncError> {
        let (offset, limit) = {
            let state = self.state.lock();
            (state.window.offset, state.window.limit)
        };
        self.load_page(offset, limit).await
    }

    pub async fn next_page(&self) -> Result<LoadOutcome, SyncError> {
        let window = self.window();
        if !window.has_next() {
            return Ok(LoadOutcome::OutOfRange);
        }
        self.load_page(window.offset + window.limit, window.limit).await
    }

    pub async fn previous_page(&self) -> Result<LoadOutcome, SyncError> {
        let window = self.window();
        if !window.has_previous() {
            return Ok(LoadOutcome::OutOfRange);
        }
        let offset = window.offset.saturating_sub(window.limit);
        self.load_page(offset, window.limit).await
    }

    /// Jump to a zero-based page index.
    pub async fn go_to_page(&self, page: usize) -> Result<LoadOutcome, SyncError> {
        let window = self.window();
        let last = window.page_count().saturating_sub(1) as usize;
        if page > last {
            return Ok(LoadOutcome::OutOfRange);
        }
        self.load_page(page * window.limit, window.limit).await
    }

    /// Fold one push event into the window and the entity store.
    pub fn on_push(&self, event: PushEvent) {
        match event {
            PushEvent::Created(entity) => self.absorb_created(entity, UpdateSource::Push),
            PushEvent::Updated { id, patch } => {
                let key = EntityKey::new(self.kind, id);
                self.store.ingest_patch(key, &patch, UpdateSource::Push);
            }
            PushEvent::Deleted { id } => {
                self.store.remove(EntityKey::new(self.kind, id));
                let mut state = self.state.lock();
                if state.window.stale {
                    return;
                }
                state.counted.remove(&id);
                let window = &mut state.window;
                window.items.retain(|item| *item != id);
                window.total = window.total.saturating_sub(1);
                if window.offset == 0 {
                    window.total = window.total.max(window.items.len() as u64);
                }
                self.publish(&state.window);
            }
            PushEvent::CountChanged(change) => {
                let mut state = self.state.lock();
                if state.window.stale {
                    return;
                }
                let window = &mut state.window;
                window.total = match change {
                    CountChange::Delta(delta) => window.total.saturating_add_signed(delta),
                    CountChange::Total(total) => total,
                };
                if window.offset == 0 {
                    window.total = window.total.max(window.items.len() as u64);
                }
                self.publish(&state.window);
            }
        }
    }

    /// Record an entity created on this collection, by push or as the
    /// response to one of our own commands.
    pub fn absorb_created(&self, entity: Entity, source: UpdateSource) {
        let id = entity.id;
        self.store.ingest_entity(self.kind, entity, source);
        let mut state = self.state.lock();
        if state.window.stale || state.window.items.contains(&id) || !state.counted.insert(id) {
            return;
        }
        let window = &mut state.window;
        window.total += 1;
        if window.offset == 0 {
            window.items.insert(0, id);
            window.items.truncate(window.limit);
        }
        self.publish(&state.window);
    }

    /// Mark the window as possibly missing events. Structural pushes are
    /// ignored until the next successful load.
    pub fn mark_stale(&self) {
        let mut state = self.state.lock();
        state.window.stale = true;
        self.publish(&state.window);
    }

    /// Route this window's topic through `registry`. The window is held
    /// weakly; dropping it silences the handler.
    pub fn attach(self: &Arc<Self>, registry: &TopicRegistry) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        registry.subscribe(self.topic.clone(), move |signal| {
            let Some(window) = weak.upgrade() else {
                return;
            };
            match signal {
                TopicSignal::Event(event) => window.on_push(event.clone()),
                TopicSignal::Resync => {
                    window.mark_stale();
                    spawn_resync(&window);
                }
            }
        })
    }

    fn publish(&self, window: &Window) {
        self.published.send_replace(window.clone());
    }
}

/// Reload a stale window until a load succeeds, a newer reconnect takes
/// over, or the window is dropped.
fn spawn_resync(window: &Arc<WindowedStore>) {
    let epoch = {
        let mut state = window.state.lock();
        state.resync_epoch += 1;
        state.resync_epoch
    };
    let mut backoff = window.resync_backoff.lock().clone();
    let weak = Arc::downgrade(window);
    let topic = window.topic.clone();

    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            log::warn!("{topic}: no runtime to resync on");
            return;
        }
    };
    handle.spawn(async move {
        loop {
            let Some(window) = weak.upgrade() else {
                return;
            };
            {
                let state = window.state.lock();
                if state.resync_epoch != epoch || !state.window.stale {
                    return;
                }
            }
            let mut published = window.subscribe();
            let result = window.reload().await;
            drop(window);

            match result {
                Ok(LoadOutcome::Superseded) => {
                    // Someone else's load is running; see whether it clears
                    // the stale flag before trying again.
                    if published.wait_for(|w| !w.loading).await.is_err() {
                        return;
                    }
                }
                Ok(_) => return,
                Err(e) => {
                    let delay = backoff.next_delay();
                    log::warn!("{topic}: resync failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });
}
