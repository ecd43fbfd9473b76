//! Shared fixtures: an in-memory backend and a hub on a free port.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use newhire_sync::api::{Page, PageSource, ResourceApi};
use newhire_sync::hub::{HubConfig, PushHub};
use newhire_sync::{Entity, EntityId, Patch, SyncConfig, SyncError, Topic};
use parking_lot::Mutex;

/// In-memory stand-in for the REST backend.
#[derive(Default)]
pub struct FakeApi {
    /// Newest first, like the real endpoints.
    pub collections: Mutex<HashMap<Topic, Vec<Entity>>>,
    pub tickets: Mutex<Vec<Entity>>,
    pub fail_updates: AtomicBool,
    pub update_delay: Mutex<Duration>,
    /// Delays applied to successive page fetches, in call order.
    pub page_delays: Mutex<VecDeque<Duration>>,
    pub page_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    next_message_id: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicU64::new(1_000),
            ..Self::default()
        }
    }

    pub fn with_collection(self, topic: Topic, items: Vec<Entity>) -> Self {
        self.collections.lock().insert(topic, items);
        self
    }

    pub fn with_tickets(self, tickets: Vec<Entity>) -> Self {
        *self.tickets.lock() = tickets;
        self
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for FakeApi {
    async fn fetch_page(&self, topic: &Topic, offset: usize, limit: usize) -> Result<Page, SyncError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.page_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let collections = self.collections.lock();
        let items = collections.get(topic).cloned().unwrap_or_default();
        Ok(Page {
            total: items.len() as u64,
            items: items.into_iter().skip(offset).take(limit).collect(),
        })
    }
}

#[async_trait]
impl ResourceApi for FakeApi {
    async fn fetch_tickets(&self) -> Result<Vec<Entity>, SyncError> {
        Ok(self.tickets.lock().clone())
    }

    async fn update_ticket(&self, id: EntityId, patch: &Patch) -> Result<Option<Entity>, SyncError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.update_delay.lock();
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SyncError::rejected(Some(500), "update failed"));
        }
        let mut tickets = self.tickets.lock();
        match tickets.iter_mut().find(|t| t.id == id) {
            Some(ticket) => {
                *ticket = ticket.apply(patch);
                Ok(Some(ticket.clone()))
            }
            None => Err(SyncError::rejected(Some(404), "Ticket not found")),
        }
    }

    async fn create_message(&self, channel: &str, content: &str) -> Result<Entity, SyncError> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(message(id, channel, content))
    }

    async fn fetch_stats(&self, user_id: u64) -> Result<Entity, SyncError> {
        Ok(Entity::new(user_id).with("xp", 0i64).with("level", 1i64))
    }
}

pub fn message(id: u64, channel: &str, content: &str) -> Entity {
    Entity::new(id)
        .with("channel", channel)
        .with("content", content)
        .with("sender_name", "Alex")
        .with("is_bot", false)
        .with("timestamp", "2024-05-01T09:00:00")
}

pub fn activity(id: u64) -> Entity {
    Entity::new(id)
        .with("type", "MESSAGE_SENT")
        .with("description", format!("activity {id}"))
        .with("created_at", "2024-05-01T09:00:00")
}

pub fn ticket(id: u64, status: &str) -> Entity {
    Entity::new(id)
        .with("title", format!("Ticket {id}"))
        .with("status", status)
        .with("priority", "MEDIUM")
}

/// Ids `from..to` in descending order, newest first.
pub fn newest_first(from: u64, to: u64, make: fn(u64) -> Entity) -> Vec<Entity> {
    (from..to).rev().map(make).collect()
}

pub async fn start_hub() -> (PushHub, SocketAddr) {
    let hub = PushHub::new(HubConfig {
        bind_addr: "127.0.0.1:0".into(),
        broadcast_capacity: 64,
    });
    let addr = hub.start().await.unwrap();
    (hub, addr)
}

/// Client config with short reconnect delays.
pub fn client_config(addr: SocketAddr) -> SyncConfig {
    SyncConfig {
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        ..SyncConfig::with_base_url(format!("http://{addr}"))
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
