//! # worldstate-sdk
//!
//! Rust client SDK for querying and subscribing to indexed world state.
//!
//! An indexer exposes entities: records identified by a world address and a
//! hashed key, each carrying a list of typed models. This crate provides a
//! [`Client`] that pages through entities with opaque cursors and streams
//! real-time entity updates.
//!
//! ## Example
//!
//! ```rust,ignore
//! use worldstate_sdk::prelude::*;
//!
//! let client = Client::connect("ws://localhost:8080", 4 * 1024 * 1024).await?;
//!
//! let query = Query::new().with_model("ns-Position").with_limit(50);
//! let page = client.execute(&query).await?;
//! let next = client.execute(&query.with_cursor(page.next_cursor)).await?;
//!
//! let mut sub = client.subscribe(None, [world]).await?;
//! while let Some(event) = sub.next().await {
//!     println!("{:?}", event);
//! }
//! ```
//!
//! ## Pagination
//!
//! Results follow a canonical order: the query's `order_by` fields, then
//! world address, hashed keys, `updated_at` and `executed_at`. A cursor marks
//! a position in that order and is bound to the query it came from; it can be
//! replayed with a different page size or direction but not a different
//! filter.

mod clause;
mod client;
mod config;
mod connection;
mod cursor;
mod decoder;
mod entity;
mod error;
mod felt;
pub mod frame;
pub mod memory;
mod paginate;
pub mod prelude;
mod query;
mod subscription;
mod transport;

pub use clause::{
    Clause, ComparisonOperator, CompositeClause, KeysClause, LogicalOperator, MemberClause,
    MemberValue, PatternMatching,
};
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_MAX_MESSAGE_SIZE};
pub use decoder::{JsonModelDecoder, ModelDecoder};
pub use entity::{
    Entity, EntityBuilder, EnumOption, EnumValue, Member, Model, Primitive, Struct, Ty,
};
pub use error::{ClientError, DecodeError, Result};
pub use felt::{Felt, FeltParseError};
pub use memory::{MemoryIndexer, MemoryTransport};
pub use paginate::{paginate, SortKey, SortValue};
pub use query::{
    OrderBy, OrderDirection, Page, Pagination, PaginationDirection, Query, DEFAULT_PAGE_LIMIT,
    ENTITY_ORDER_FIELDS,
};
pub use subscription::{
    EntityUpdateCallback, Subscription, SubscriptionEvent, SubscriptionId, SubscriptionState,
};
pub use transport::{Transport, WebSocketTransport, WireMessage};

pub use serde_json::Value;
