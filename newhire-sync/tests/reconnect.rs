//! End-to-end tests against a real push hub: subscription, event delivery,
//! reconnect with resync, and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{activity, client_config, eventually, newest_first, start_hub, FakeApi};
use newhire_sync::{
    ConnectionManager, ConnectionState, PushEvent, SessionContext, SyncConfig, SyncSession, Topic,
    Window,
};
use tokio::time::timeout;

fn settled(window: &Window) -> bool {
    !window.stale && !window.loading
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_session_receives_pushed_activity() {
    let (hub, addr) = start_hub().await;
    let topic = Topic::user_activity(7);
    let api = Arc::new(FakeApi::new().with_collection(topic.clone(), newest_first(1, 4, activity)));
    let session = SyncSession::init(client_config(addr), SessionContext::new(7), api.clone()).unwrap();

    let connected = timeout(
        Duration::from_secs(2),
        session.connection().wait_for(ConnectionState::Connected),
    )
    .await;
    assert_eq!(connected, Ok(true));

    let feed = session.activity_feed();
    feed.load_page(0, 10).await.unwrap();
    eventually("first page", || settled(&feed.window()) && feed.window().total == 3).await;

    eventually("hub subscription", || hub.subscriber_count(&topic) == 1).await;
    hub.publish(&topic, PushEvent::Created(activity(50))).unwrap();

    eventually("pushed activity", || feed.window().total == 4).await;
    let view = feed.view();
    assert_eq!(view.entities[0].id.0, 50);
    assert_eq!(view.entities.len(), 4);

    session.teardown().await;
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_refetches() {
    let (hub, addr) = start_hub().await;
    let topic = Topic::user_activity(7);
    let api = Arc::new(FakeApi::new().with_collection(topic.clone(), newest_first(1, 4, activity)));
    let session = SyncSession::init(client_config(addr), SessionContext::new(7), api.clone()).unwrap();
    let feed = session.activity_feed();
    feed.load_page(0, 10).await.unwrap();

    eventually("initial subscription", || hub.subscriber_count(&topic) == 1).await;
    eventually("first page", || settled(&feed.window()) && feed.window().total == 3).await;
    eventually("first connection", || session.connection().connection_count() == 1).await;
    let calls_before = api.page_calls();

    // Items created while the client is away are only seen via re-fetch.
    api.collections
        .lock()
        .insert(topic.clone(), newest_first(1, 6, activity));
    hub.drop_connections();

    eventually("second connection", || session.connection().connection_count() >= 2).await;
    eventually("resubscription", || hub.subscriber_count(&topic) == 1).await;
    eventually("resync fetch", || api.page_calls() > calls_before).await;
    eventually("fresh window", || settled(&feed.window()) && feed.window().total == 5).await;

    hub.publish(&topic, PushEvent::Created(activity(99))).unwrap();
    eventually("push after reconnect", || feed.window().total == 6).await;

    session.teardown().await;
}

#[tokio::test]
async fn test_retries_until_hub_appears() {
    let port = free_port().await;
    let config = SyncConfig {
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 60,
        ..SyncConfig::with_base_url(format!("http://127.0.0.1:{port}"))
    };
    let manager = ConnectionManager::new(config).unwrap();
    let _events = manager.take_event_rx();
    manager.connect();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ne!(manager.status(), ConnectionState::Connected);

    let hub = newhire_sync::PushHub::new(newhire_sync::HubConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..newhire_sync::HubConfig::default()
    });
    hub.start().await.unwrap();

    let connected = timeout(
        Duration::from_secs(2),
        manager.wait_for(ConnectionState::Connected),
    )
    .await;
    assert_eq!(connected, Ok(true));
    assert_eq!(manager.connection_count(), 1);

    manager.teardown().await;
    assert_eq!(manager.status(), ConnectionState::Disconnected);
    hub.shutdown();
}

#[tokio::test]
async fn test_teardown_closes_hub_side() {
    let (hub, addr) = start_hub().await;
    let api = Arc::new(FakeApi::new());
    let session = SyncSession::init(client_config(addr), SessionContext::new(1), api).unwrap();
    eventually("connected", || hub.stats().active_connections == 1).await;

    let connection = session.connection().clone();
    session.teardown().await;
    assert_eq!(connection.status(), ConnectionState::Disconnected);
    eventually("hub sees close", || hub.stats().active_connections == 0).await;

    // No reconnect after teardown.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(hub.stats().total_connections, 1);
}
