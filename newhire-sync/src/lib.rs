//! # newhire-sync — client-side real-time state reconciliation
//!
//! Keeps the views of the onboarding workspace consistent with the server
//! while the server pushes changes and the user issues optimistic commands.
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────────────┐  ConnectionEvent  ┌───────────────┐  TopicSignal  ┌────────────────┐
//!  │ ConnectionManager │ ────────────────► │ TopicRegistry │ ────────────► │ WindowedStore  │
//!  │ (ws + backoff)    │ ◄──── Subscribe ─ │ (ref-counted) │               │ TicketBoard …  │
//!  └───────────────────┘                   └───────────────┘               └───────┬────────┘
//!                                                                                  │
//!  ┌───────────────────┐  claim/confirm/rollback  ┌─────────────┐  admit / merge    │
//!  │ OptimisticExecutor│ ───────────────────────► │ EntityStore │ ◄─────────────────┘
//!  │ (per-entity lane) │                          │ + Policy    │
//!  └───────────────────┘                          └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`] — push WebSocket with reconnect backoff
//! - [`topics`] — topic fan-out, resubscribe and resync on reconnect
//! - [`executor`] — optimistic commands with rollback, serialized per entity
//! - [`window`] — paginated collections folded with push events
//! - [`policy`] / [`store`] — the field-ownership merge rule and the state it guards
//! - [`api`] — REST calls (`reqwest`)
//! - [`views`] — ticket board, chat channels, stats panel
//! - [`session`] — wiring for one signed-in user
//! - [`hub`] — push server used by the `newhire-hub` binary and the tests

pub mod api;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod hub;
pub mod policy;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topics;
pub mod views;
pub mod window;

pub use api::{HttpApi, Page, PageSource, ResourceApi};
pub use backoff::Backoff;
pub use config::{ConfigError, SyncConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::SyncError;
pub use executor::{CommandOutcome, CommandState, OptimisticExecutor};
pub use hub::{HubConfig, HubStats, PushHub};
pub use policy::{ReconciliationPolicy, UpdateSource};
pub use protocol::{ClientFrame, CountChange, ProtocolError, PushEvent, ServerFrame};
pub use session::{Mounted, SessionContext, SyncSession};
pub use store::{EntityStore, Resolution, StoreSnapshot};
pub use topics::{Subscription, TopicRegistry, TopicSignal, Transport};
pub use views::{ChannelFeed, StatsPanel, TicketBoard};
pub use window::{LoadOutcome, Window, WindowView, WindowedStore};

pub use newhire_core::{Entity, EntityId, EntityKey, FieldValue, Patch, ResourceKind, Topic};
