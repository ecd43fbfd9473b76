//! One signed-in session: the connection, registry, store and executor
//! wired together, plus constructors for the views that run on them.
//!
//! Must be created inside a Tokio runtime; `init` spawns the supervisor and
//! the event pump.

use std::ops::Deref;
use std::sync::Arc;

use newhire_core::{Entity, EntityKey, Patch, Topic};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{PageSource, ResourceApi};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::SyncError;
use crate::executor::{CommandOutcome, OptimisticExecutor};
use crate::store::EntityStore;
use crate::topics::{Subscription, TopicRegistry, TopicSignal, Transport};
use crate::views::{ChannelFeed, StatsPanel, TicketBoard};
use crate::window::WindowedStore;

/// Who the session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: u64,
    /// Bearer token for the REST backend, if it wants one.
    pub credentials: Option<String>,
}

impl SessionContext {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            credentials: None,
        }
    }
}

/// A view attached to the registry. Dropping it detaches the view.
pub struct Mounted<T> {
    view: Arc<T>,
    subscription: Subscription,
}

impl<T> Mounted<T> {
    /// Shared handle to the view, for moving into tasks.
    pub fn handle(&self) -> &Arc<T> {
        &self.view
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn unmount(self) -> Arc<T> {
        self.subscription.unsubscribe();
        self.view
    }
}

impl<T> Deref for Mounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.view
    }
}

pub struct SyncSession {
    id: Uuid,
    config: SyncConfig,
    context: SessionContext,
    connection: Arc<ConnectionManager>,
    registry: TopicRegistry,
    store: Arc<EntityStore>,
    executor: Arc<OptimisticExecutor>,
    api: Arc<dyn ResourceApi>,
    pages: Arc<dyn PageSource>,
    pump: Option<JoinHandle<()>>,
}

impl SyncSession {
    pub fn init<A>(config: SyncConfig, context: SessionContext, api: Arc<A>) -> Result<Self, SyncError>
    where
        A: ResourceApi + PageSource + 'static,
    {
        let connection = ConnectionManager::new(config.clone())?;
        let transport: Arc<dyn Transport> = connection.clone();
        let registry = TopicRegistry::new(transport);
        let store = Arc::new(EntityStore::new());
        let executor = Arc::new(OptimisticExecutor::new(store.clone()));

        let pump = connection.take_event_rx().map(|events| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run(events).await })
        });
        connection.connect();

        let id = Uuid::new_v4();
        log::info!(
            "Session {id} started for user {} against {}",
            context.user_id,
            connection.url()
        );
        let resources: Arc<dyn ResourceApi> = api.clone();
        let pages: Arc<dyn PageSource> = api;
        Ok(Self {
            id,
            config,
            context,
            connection,
            registry,
            store,
            executor,
            api: resources,
            pages,
            pump,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn status(&self) -> ConnectionState {
        self.connection.status()
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<OptimisticExecutor> {
        &self.executor
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&TopicSignal) + Send + Sync + 'static,
    {
        self.registry.subscribe(topic, handler)
    }

    /// Run an optimistic command through the session's executor.
    pub async fn execute<F, Fut>(
        &self,
        key: EntityKey,
        patch: Patch,
        request: F,
    ) -> Result<CommandOutcome, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<Entity>, SyncError>>,
    {
        self.executor.execute(key, patch, request).await
    }

    /// A window over `topic` using the configured page size, attached to
    /// the registry. Not loaded yet.
    pub fn open_window(&self, topic: Topic) -> Mounted<WindowedStore> {
        let view = WindowedStore::new(
            topic,
            self.store.clone(),
            self.pages.clone(),
            self.config.page_size,
        );
        view.set_resync_backoff(
            self.config.reconnect_base_delay(),
            self.config.reconnect_max_delay(),
        );
        let subscription = view.attach(&self.registry);
        Mounted { view, subscription }
    }

    pub fn activity_feed(&self) -> Mounted<WindowedStore> {
        self.open_window(Topic::user_activity(self.context.user_id))
    }

    pub fn ticket_board(&self) -> Mounted<TicketBoard> {
        let view = TicketBoard::new(self.store.clone(), self.executor.clone(), self.api.clone());
        let subscription = view.attach(&self.registry);
        Mounted { view, subscription }
    }

    pub fn channel(&self, name: &str) -> Mounted<ChannelFeed> {
        let view = ChannelFeed::new(
            name,
            self.store.clone(),
            self.pages.clone(),
            self.api.clone(),
            self.config.page_size,
        );
        view.window().set_resync_backoff(
            self.config.reconnect_base_delay(),
            self.config.reconnect_max_delay(),
        );
        let subscription = view.attach(&self.registry);
        Mounted { view, subscription }
    }

    pub fn stats_panel(&self) -> Mounted<StatsPanel> {
        let view = StatsPanel::new(self.context.user_id, self.store.clone(), self.api.clone());
        let subscription = view.attach(&self.registry);
        Mounted { view, subscription }
    }

    /// Close the connection and drop all state. In-flight commands resolve
    /// as discarded.
    pub async fn teardown(mut self) {
        self.connection.teardown().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.registry.clear();
        self.store.clear();
        log::info!("Session {} torn down", self.id);
    }
}
