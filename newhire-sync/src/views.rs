//! Application views built on the engine: the ticket board, chat channels
//! and the stats panel. Each keeps its own membership or window and reads
//! entity state from the shared store.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use newhire_core::{
    ChatMessage, EntityId, EntityKey, ResourceKind, StatsSnapshot, Ticket, TicketStatus, Topic,
};
use parking_lot::RwLock;

use crate::api::{PageSource, ResourceApi};
use crate::error::SyncError;
use crate::executor::{CommandOutcome, OptimisticExecutor};
use crate::policy::UpdateSource;
use crate::protocol::PushEvent;
use crate::store::EntityStore;
use crate::topics::{Subscription, TopicRegistry, TopicSignal};
use crate::window::{LoadOutcome, WindowedStore};

fn spawn_detached<F>(label: String, task: F)
where
    F: std::future::Future<Output = Result<(), SyncError>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = task.await {
                    log::warn!("{label}: {e}");
                }
            });
        }
        Err(_) => log::warn!("{label}: no runtime available"),
    }
}

/// Kanban board over every ticket.
pub struct TicketBoard {
    store: Arc<EntityStore>,
    executor: Arc<OptimisticExecutor>,
    api: Arc<dyn ResourceApi>,
    members: RwLock<BTreeSet<EntityId>>,
    last_error: RwLock<Option<String>>,
}

impl TicketBoard {
    pub fn new(
        store: Arc<EntityStore>,
        executor: Arc<OptimisticExecutor>,
        api: Arc<dyn ResourceApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            api,
            members: RwLock::new(BTreeSet::new()),
            last_error: RwLock::new(None),
        })
    }

    /// Fetch every ticket and replace the board's membership.
    pub async fn load(&self) -> Result<usize, SyncError> {
        match self.api.fetch_tickets().await {
            Ok(tickets) => {
                let mut ids = BTreeSet::new();
                for entity in tickets {
                    ids.insert(entity.id);
                    self.store
                        .ingest_entity(ResourceKind::Ticket, entity, UpdateSource::Fetch);
                }
                let count = ids.len();
                *self.members.write() = ids;
                *self.last_error.write() = None;
                Ok(count)
            }
            Err(err) => {
                let err = match err {
                    SyncError::FetchFailed(_) => err,
                    other => SyncError::FetchFailed(other.to_string()),
                };
                *self.last_error.write() = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Move a ticket to another column, optimistically.
    pub async fn move_ticket(
        &self,
        id: EntityId,
        status: TicketStatus,
    ) -> Result<CommandOutcome, SyncError> {
        let key = EntityKey::new(ResourceKind::Ticket, id);
        let patch = Ticket::status_patch(status);
        let api = self.api.clone();
        let body = patch.clone();
        let result = self
            .executor
            .execute(key, patch, move || async move { api.update_ticket(id, &body).await })
            .await;
        *self.last_error.write() = result.as_ref().err().map(|e| e.to_string());
        result
    }

    pub fn ticket(&self, id: EntityId) -> Option<Ticket> {
        if !self.members.read().contains(&id) {
            return None;
        }
        self.store
            .get(EntityKey::new(ResourceKind::Ticket, id))
            .and_then(|entity| Ticket::try_from(&entity).ok())
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        let ids: Vec<EntityId> = self.members.read().iter().copied().collect();
        self.store
            .get_many(ResourceKind::Ticket, &ids)
            .iter()
            .filter_map(|entity| match Ticket::try_from(entity) {
                Ok(ticket) => Some(ticket),
                Err(e) => {
                    log::warn!("skipping malformed ticket {}: {e}", entity.id);
                    None
                }
            })
            .collect()
    }

    /// Tickets grouped by status, in board column order.
    pub fn columns(&self) -> Vec<(TicketStatus, Vec<Ticket>)> {
        let tickets = self.tickets();
        TicketStatus::ALL
            .iter()
            .map(|status| {
                let column = tickets
                    .iter()
                    .filter(|t| t.status == *status)
                    .cloned()
                    .collect();
                (*status, column)
            })
            .collect()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn on_push(&self, event: PushEvent) {
        match event {
            PushEvent::Created(entity) => {
                self.members.write().insert(entity.id);
                self.store
                    .ingest_entity(ResourceKind::Ticket, entity, UpdateSource::Push);
            }
            PushEvent::Updated { id, patch } => {
                let key = EntityKey::new(ResourceKind::Ticket, id);
                self.store.ingest_patch(key, &patch, UpdateSource::Push);
            }
            PushEvent::Deleted { id } => {
                self.members.write().remove(&id);
                self.store.remove(EntityKey::new(ResourceKind::Ticket, id));
            }
            PushEvent::CountChanged(_) => {}
        }
    }

    pub fn attach(self: &Arc<Self>, registry: &TopicRegistry) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        registry.subscribe(Topic::board(), move |signal| {
            let Some(board) = weak.upgrade() else {
                return;
            };
            match signal {
                TopicSignal::Event(event) => board.on_push(event.clone()),
                TopicSignal::Resync => spawn_detached("ticket board resync".into(), async move {
                    board.load().await.map(|_| ())
                }),
            }
        })
    }
}

/// One chat channel: a window of its messages plus sending.
pub struct ChannelFeed {
    channel: String,
    window: Arc<WindowedStore>,
    api: Arc<dyn ResourceApi>,
}

impl ChannelFeed {
    pub fn new(
        channel: &str,
        store: Arc<EntityStore>,
        pages: Arc<dyn PageSource>,
        api: Arc<dyn ResourceApi>,
        page_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            window: WindowedStore::new(Topic::channel(channel), store, pages, page_size),
            api,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn window(&self) -> &Arc<WindowedStore> {
        &self.window
    }

    pub async fn load(&self) -> Result<LoadOutcome, SyncError> {
        let limit = self.window.window().limit;
        self.window.load_page(0, limit).await
    }

    /// Post a message. Blank content is refused without a request.
    ///
    /// The message appears once the server returns it; if the push for
    /// it arrives too, it is recognised and not added twice.
    pub async fn send(&self, content: &str) -> Result<ChatMessage, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::rejected(None, "message is empty"));
        }
        let entity = self.api.create_message(&self.channel, content).await?;
        let message =
            ChatMessage::try_from(&entity).map_err(|e| SyncError::rejected(None, e.to_string()))?;
        self.window.absorb_created(entity, UpdateSource::Command);
        Ok(message)
    }

    /// Messages in the window, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .window
            .view()
            .entities
            .iter()
            .filter_map(|entity| ChatMessage::try_from(entity).ok())
            .collect();
        messages.reverse();
        messages
    }

    pub fn attach(self: &Arc<Self>, registry: &TopicRegistry) -> Subscription {
        self.window.attach(registry)
    }
}

/// Progress panel of one user.
pub struct StatsPanel {
    user_id: u64,
    store: Arc<EntityStore>,
    api: Arc<dyn ResourceApi>,
}

impl StatsPanel {
    pub fn new(user_id: u64, store: Arc<EntityStore>, api: Arc<dyn ResourceApi>) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            store,
            api,
        })
    }

    pub async fn load(&self) -> Result<StatsSnapshot, SyncError> {
        let mut entity = self.api.fetch_stats(self.user_id).await?;
        entity.id = EntityId(self.user_id);
        self.store
            .ingest_entity(ResourceKind::Stats, entity, UpdateSource::Fetch);
        self.stats()
            .ok_or_else(|| SyncError::FetchFailed("stats response is incomplete".into()))
    }

    /// Stats are stored under the user's id.
    fn key(&self) -> EntityKey {
        ResourceKind::Stats.key(self.user_id)
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.store
            .get(self.key())
            .and_then(|entity| StatsSnapshot::try_from(&entity).ok())
    }

    pub fn on_push(&self, event: PushEvent) {
        let before = self.stats().map(|s| s.level);
        match event {
            PushEvent::Updated { patch, .. } => {
                self.store
                    .ingest_patch(self.key(), &patch, UpdateSource::Push);
            }
            PushEvent::Created(mut entity) => {
                entity.id = EntityId(self.user_id);
                self.store
                    .ingest_entity(ResourceKind::Stats, entity, UpdateSource::Push);
            }
            PushEvent::Deleted { .. } | PushEvent::CountChanged(_) => return,
        }
        if let (Some(before), Some(after)) = (before, self.stats().map(|s| s.level)) {
            if after > before {
                log::info!("user {} reached level {after}", self.user_id);
            }
        }
    }

    pub fn attach(self: &Arc<Self>, registry: &TopicRegistry) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        registry.subscribe(Topic::user_stats(self.user_id), move |signal| {
            let Some(panel) = weak.upgrade() else {
                return;
            };
            match signal {
                TopicSignal::Event(event) => panel.on_push(event.clone()),
                TopicSignal::Resync => spawn_detached("stats resync".into(), async move {
                    panel.load().await.map(|_| ())
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use newhire_core::{Entity, Patch};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeApi {
        tickets: Mutex<Vec<Entity>>,
        fail_updates: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ResourceApi for FakeApi {
        async fn fetch_tickets(&self) -> Result<Vec<Entity>, SyncError> {
            Ok(self.tickets.lock().clone())
        }

        async fn update_ticket(
            &self,
            id: EntityId,
            patch: &Patch,
        ) -> Result<Option<Entity>, SyncError> {
            if self.fail_updates {
                return Err(SyncError::rejected(Some(500), "database is locked"));
            }
            let base = self
                .tickets
                .lock()
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .unwrap_or_else(|| Entity::new(id.0));
            Ok(Some(base.apply(patch)))
        }

        async fn create_message(&self, channel: &str, content: &str) -> Result<Entity, SyncError> {
            self.sent.lock().push((channel.into(), content.into()));
            Ok(Entity::new(77)
                .with("channel", channel)
                .with("content", content)
                .with("sender_name", "You")
                .with("timestamp", "2024-05-01T09:00:00"))
        }

        async fn fetch_stats(&self, user_id: u64) -> Result<Entity, SyncError> {
            Ok(Entity::new(user_id).with("xp", 100i64).with("level", 1i64))
        }
    }

    fn ticket(id: u64, status: &str) -> Entity {
        Entity::new(id)
            .with("title", format!("Ticket {id}"))
            .with("status", status)
    }

    fn board(api: FakeApi) -> Arc<TicketBoard> {
        let store = Arc::new(EntityStore::new());
        let executor = Arc::new(OptimisticExecutor::new(store.clone()));
        TicketBoard::new(store, executor, Arc::new(api))
    }

    #[tokio::test]
    async fn test_board_columns() {
        let api = FakeApi::default();
        *api.tickets.lock() = vec![ticket(1, "TODO"), ticket(2, "DONE"), ticket(3, "TODO")];
        let board = board(api);
        assert_eq!(board.load().await.unwrap(), 3);

        let columns = board.columns();
        assert_eq!(columns.len(), TicketStatus::ALL.len());
        let todo = columns
            .iter()
            .find(|(status, _)| *status == TicketStatus::Todo)
            .unwrap();
        assert_eq!(todo.1.len(), 2);
    }

    #[tokio::test]
    async fn test_move_ticket_confirms() {
        let api = FakeApi::default();
        *api.tickets.lock() = vec![ticket(1, "TODO")];
        let board = board(api);
        board.load().await.unwrap();

        board
            .move_ticket(EntityId(1), TicketStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(
            board.ticket(EntityId(1)).unwrap().status,
            TicketStatus::InProgress
        );
        assert!(board.last_error().is_none());
    }

    #[tokio::test]
    async fn test_move_ticket_rolls_back_on_failure() {
        let api = FakeApi {
            fail_updates: true,
            ..FakeApi::default()
        };
        *api.tickets.lock() = vec![ticket(1, "TODO")];
        let board = board(api);
        board.load().await.unwrap();

        let err = board
            .move_ticket(EntityId(1), TicketStatus::InProgress)
            .await
            .unwrap_err();
        assert!(err.is_user_visible());
        assert_eq!(board.ticket(EntityId(1)).unwrap().status, TicketStatus::Todo);
        assert!(board.last_error().unwrap().contains("database is locked"));
    }

    #[tokio::test]
    async fn test_board_push_membership() {
        let board = board(FakeApi::default());
        board.on_push(PushEvent::Created(ticket(5, "BACKLOG")));
        assert_eq!(board.tickets().len(), 1);
        board.on_push(PushEvent::Updated {
            id: EntityId(5),
            patch: Patch::new().set("status", "TODO"),
        });
        assert_eq!(board.ticket(EntityId(5)).unwrap().status, TicketStatus::Todo);
        board.on_push(PushEvent::Deleted { id: EntityId(5) });
        assert!(board.tickets().is_empty());
    }

    struct EmptyPages;

    #[async_trait]
    impl PageSource for EmptyPages {
        async fn fetch_page(
            &self,
            _topic: &Topic,
            _offset: usize,
            _limit: usize,
        ) -> Result<crate::api::Page, SyncError> {
            Ok(crate::api::Page::default())
        }
    }

    #[tokio::test]
    async fn test_channel_send_is_idempotent_with_push() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(EntityStore::new());
        let feed = ChannelFeed::new("general", store, Arc::new(EmptyPages), api.clone(), 10);
        feed.load().await.unwrap();

        let message = feed.send("  hello team  ").await.unwrap();
        assert_eq!(message.content, "hello team");
        assert_eq!(api.sent.lock()[0], ("general".to_string(), "hello team".to_string()));

        // The push for our own message arrives afterwards.
        let echoed = feed.window().view().entities[0].clone();
        feed.window().on_push(PushEvent::Created(echoed));
        assert_eq!(feed.window().window().total, 1);
        assert_eq!(feed.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_rejects_blank_message() {
        let api = Arc::new(FakeApi::default());
        let feed = ChannelFeed::new(
            "general",
            Arc::new(EntityStore::new()),
            Arc::new(EmptyPages),
            api.clone(),
            10,
        );
        assert!(feed.send("   ").await.is_err());
        assert!(api.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_views_share_store_without_id_clashes() {
        let api = Arc::new(FakeApi::default());
        *api.tickets.lock() = vec![ticket(1, "TODO")];
        let store = Arc::new(EntityStore::new());
        let executor = Arc::new(OptimisticExecutor::new(store.clone()));
        let board = TicketBoard::new(store.clone(), executor, api.clone());
        let feed = ChannelFeed::new("general", store.clone(), Arc::new(EmptyPages), api.clone(), 10);
        let panel = StatsPanel::new(1, store.clone(), api);

        board.load().await.unwrap();
        feed.load().await.unwrap();
        panel.load().await.unwrap();
        feed.window().on_push(PushEvent::Created(
            Entity::new(1)
                .with("channel", "general")
                .with("content", "welcome")
                .with("sender_name", "Bot")
                .with("timestamp", "2024-05-01T08:00:00")
                .with("status", "sent"),
        ));
        panel.on_push(PushEvent::Updated {
            id: EntityId(1),
            patch: Patch::new().set("xp", 250i64),
        });
        assert_eq!(store.len(), 3);

        assert_eq!(board.ticket(EntityId(1)).unwrap().status, TicketStatus::Todo);
        assert_eq!(board.ticket(EntityId(1)).unwrap().title, "Ticket 1");
        let messages = feed.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "welcome");
        assert_eq!(panel.stats().unwrap().xp, 250);

        feed.window().on_push(PushEvent::Deleted { id: EntityId(1) });
        assert!(feed.messages().is_empty());
        assert!(board.ticket(EntityId(1)).is_some());
        assert!(panel.stats().is_some());
    }

    #[tokio::test]
    async fn test_stats_panel_merges_partial_push() {
        let store = Arc::new(EntityStore::new());
        let panel = StatsPanel::new(42, store, Arc::new(FakeApi::default()));
        let stats = panel.load().await.unwrap();
        assert_eq!(stats.xp, 100);

        panel.on_push(PushEvent::Updated {
            id: EntityId(42),
            patch: Patch::new().set("xp", 520i64).set("level", 2i64),
        });
        let stats = panel.stats().unwrap();
        assert_eq!(stats.xp, 520);
        assert_eq!(stats.level, 2);
    }
}
