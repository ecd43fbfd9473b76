//! Request/response side of the backend.
//!
//! [`PageSource`] is all a windowed store needs; [`ResourceApi`] covers the
//! mutating and whole-collection calls the views make. [`HttpApi`] speaks
//! the REST backend over `reqwest`.

use async_trait::async_trait;
use newhire_core::{Entity, EntityId, Patch, Topic, TopicKind};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::SyncConfig;
use crate::error::SyncError;

/// One page of a collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub items: Vec<Entity>,
    pub total: u64,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, topic: &Topic, offset: usize, limit: usize)
        -> Result<Page, SyncError>;
}

#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn fetch_tickets(&self) -> Result<Vec<Entity>, SyncError>;

    /// Returns the server's copy of the ticket when it sends one back.
    async fn update_ticket(&self, id: EntityId, patch: &Patch) -> Result<Option<Entity>, SyncError>;

    async fn create_message(&self, channel: &str, content: &str) -> Result<Entity, SyncError>;

    async fn fetch_stats(&self, user_id: u64) -> Result<Entity, SyncError>;
}

/// Collection endpoints answer either `{ "items": [...], "total": n }` or a
/// bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    Windowed { items: Vec<Value>, total: u64 },
    Bare(Vec<Value>),
}

pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    credentials: Option<String>,
}

impl HttpApi {
    pub fn new(config: &SyncConfig, credentials: Option<String>) -> Result<Self, SyncError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: config.api_url()?,
            credentials,
        })
    }

    /// Collection URL backing a topic's window.
    pub fn page_url(&self, topic: &Topic, offset: usize, limit: usize) -> Result<Url, SyncError> {
        let mut url = match topic.kind() {
            TopicKind::Channel(name) => self.url(&format!("api/messages/{name}"))?,
            TopicKind::UserActivity(user_id) => {
                let mut url = self.url("api/activity/recent")?;
                url.query_pairs_mut()
                    .append_pair("user_id", &user_id.to_string());
                url
            }
            TopicKind::Board => self.url("api/tickets/")?,
            TopicKind::UserStats(_) | TopicKind::Other => {
                return Err(SyncError::FetchFailed(format!(
                    "topic {topic} has no paged collection"
                )))
            }
        };
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path)
            .map_err(|e| SyncError::FetchFailed(format!("bad endpoint {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch_json(&self, url: Url) -> Result<Value, SyncError> {
        let response = self
            .request(Method::GET, url.clone())
            .send()
            .await
            .map_err(|e| SyncError::FetchFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::FetchFailed(format!(
                "GET {} returned {status}: {}",
                url.path(),
                detail(&body)
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::FetchFailed(e.to_string()))
    }

    async fn send_command(&self, builder: RequestBuilder) -> Result<Value, SyncError> {
        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::rejected(None, e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::rejected(Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err(SyncError::rejected(Some(status.as_u16()), detail(&body)));
        }
        if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| SyncError::rejected(Some(status.as_u16()), e.to_string()))
    }
}

/// Error text from a response body; FastAPI-style `{"detail": ...}` is
/// unwrapped.
fn detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => body.to_string(),
        },
        _ => body.to_string(),
    }
}

fn entities(values: &[Value]) -> Result<Vec<Entity>, SyncError> {
    values
        .iter()
        .map(|v| Entity::from_json(v).map_err(|e| SyncError::FetchFailed(e.to_string())))
        .collect()
}

fn parse_page(body: Value, offset: usize, limit: usize) -> Result<Page, SyncError> {
    let body: PageBody =
        serde_json::from_value(body).map_err(|e| SyncError::FetchFailed(e.to_string()))?;
    match body {
        PageBody::Windowed { items, total } => Ok(Page {
            items: entities(&items)?,
            total,
        }),
        PageBody::Bare(items) => {
            let items: Vec<Entity> = entities(&items)?.into_iter().take(limit).collect();
            // Without a count, the best known total is what we have seen.
            let total = (offset + items.len()) as u64;
            Ok(Page { items, total })
        }
    }
}

#[async_trait]
impl PageSource for HttpApi {
    async fn fetch_page(
        &self,
        topic: &Topic,
        offset: usize,
        limit: usize,
    ) -> Result<Page, SyncError> {
        let url = self.page_url(topic, offset, limit)?;
        let body = self.fetch_json(url).await?;
        parse_page(body, offset, limit)
    }
}

#[async_trait]
impl ResourceApi for HttpApi {
    async fn fetch_tickets(&self) -> Result<Vec<Entity>, SyncError> {
        let body = self.fetch_json(self.url("api/tickets/")?).await?;
        match body {
            Value::Array(items) => entities(&items),
            other => Ok(parse_page(other, 0, usize::MAX)?.items),
        }
    }

    async fn update_ticket(&self, id: EntityId, patch: &Patch) -> Result<Option<Entity>, SyncError> {
        let url = self.url(&format!("api/tickets/{id}"))?;
        let body = self
            .send_command(self.request(Method::PATCH, url).json(&patch.to_json()))
            .await?;
        if body.is_null() {
            return Ok(None);
        }
        Entity::from_json(&body)
            .map(Some)
            .map_err(|e| SyncError::rejected(None, e.to_string()))
    }

    async fn create_message(&self, channel: &str, content: &str) -> Result<Entity, SyncError> {
        let url = self.url("api/messages")?;
        let payload = json!({ "channel": channel, "content": content, "is_bot": false });
        let body = self
            .send_command(self.request(Method::POST, url).json(&payload))
            .await?;
        Entity::from_json(&body).map_err(|e| SyncError::rejected(None, e.to_string()))
    }

    async fn fetch_stats(&self, user_id: u64) -> Result<Entity, SyncError> {
        let mut url = self.url("api/gamification/me/stats")?;
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.to_string());
        let body = self.fetch_json(url).await?;
        let patch = Patch::from_json(&body).map_err(|e| SyncError::FetchFailed(e.to_string()))?;
        Ok(Entity::new(user_id).apply(&patch.without(&["id".to_string()].into())))
    }
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}
