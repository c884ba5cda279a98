//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use worldstate_sdk::prelude::*;
//!
//! let client = Client::connect("ws://localhost:8080", DEFAULT_MAX_MESSAGE_SIZE).await?;
//! let mut sub = client.subscribe(Some(Clause::hashed_keys([key])), []).await?;
//! while let Some(event) = sub.next().await {
//!     // StreamExt methods available without separate import
//! }
//! ```

pub use crate::{
    Clause, Client, ClientConfig, ClientError, ComparisonOperator, Entity, EntityUpdateCallback,
    Felt, MemberValue, Model, OrderBy, Page, PaginationDirection, PatternMatching, Primitive,
    Query, Subscription, SubscriptionEvent, SubscriptionId, Ty, DEFAULT_MAX_MESSAGE_SIZE,
};

pub use futures_util::StreamExt;
