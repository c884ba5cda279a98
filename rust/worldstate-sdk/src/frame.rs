use crate::clause::Clause;
use crate::decoder::ModelDecoder;
use crate::entity::{Entity, Model};
use crate::error::{ClientError, DecodeError};
use crate::felt::Felt;
use crate::query::{Page, Query};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const PROTOCOL_VERSION: u32 = 1;

/// Which index a query or subscription runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIndex {
    #[default]
    Entities,
    EventMessages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        protocol_version: u32,
    },
    Query {
        id: u64,
        index: QueryIndex,
        query: Query,
    },
    Subscribe {
        id: u64,
        #[serde(default)]
        index: QueryIndex,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clause: Option<Clause>,
        #[serde(default)]
        world_addresses: BTreeSet<Felt>,
    },
    UpdateSubscription {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clause: Option<Clause>,
        #[serde(default)]
        world_addresses: BTreeSet<Felt>,
    },
    Unsubscribe {
        id: u64,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidQuery,
    InvalidCursor,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol_version: u32,
        #[serde(default)]
        server: String,
    },
    Page {
        id: u64,
        page: WirePage,
    },
    Error {
        id: u64,
        kind: ErrorKind,
        message: String,
    },
    Subscribed {
        id: u64,
    },
    Update {
        id: u64,
        entity: WireEntity,
    },
    SubscriptionError {
        id: u64,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(id: u64, err: &ClientError) -> Self {
        let kind = match err {
            ClientError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            ClientError::InvalidCursor(_) => ErrorKind::InvalidCursor,
            _ => ErrorKind::Internal,
        };
        let message = match err {
            ClientError::InvalidQuery(m) | ClientError::InvalidCursor(m) => m.clone(),
            other => other.to_string(),
        };
        ServerMessage::Error { id, kind, message }
    }
}

/// Minimal view of a server message, read before the full decode so that
/// oversized payloads can be attributed to their request or subscription.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<u64>,
}

impl ClientError {
    pub(crate) fn from_server(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidQuery => ClientError::InvalidQuery(message),
            ErrorKind::InvalidCursor => ClientError::InvalidCursor(message),
            ErrorKind::Internal => ClientError::Connection(format!("server error: {}", message)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireModel {
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntity {
    pub world_address: Felt,
    pub hashed_keys: Felt,
    pub created_at: u64,
    pub updated_at: u64,
    pub executed_at: u64,
    #[serde(default)]
    pub models: Vec<WireModel>,
}

impl WireEntity {
    pub fn decode(self, decoder: &dyn ModelDecoder) -> Result<Entity, DecodeError> {
        if self.created_at > self.updated_at {
            return Err(DecodeError::Timestamps {
                hashed_keys: self.hashed_keys.to_hex(),
                created_at: self.created_at,
                updated_at: self.updated_at,
            });
        }

        let mut builder = Entity::builder(self.world_address, self.hashed_keys)
            .created_at(self.created_at)
            .updated_at(self.updated_at)
            .executed_at(self.executed_at);
        for model in self.models {
            let children = decoder.decode(&model.name, &model.data)?;
            builder = builder.model(Model::new(model.name, children));
        }
        builder.build().ok_or_else(|| {
            DecodeError::Unexpected("entity timestamps out of order".to_string())
        })
    }
}

impl From<&Entity> for WireEntity {
    fn from(entity: &Entity) -> Self {
        Self {
            world_address: entity.world_address(),
            hashed_keys: entity.hashed_keys(),
            created_at: entity.created_at(),
            updated_at: entity.updated_at(),
            executed_at: entity.executed_at(),
            models: entity
                .models()
                .iter()
                .map(|m| WireModel {
                    name: m.name.clone(),
                    data: serde_json::to_value(&m.children).unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePage {
    pub items: Vec<WireEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl WirePage {
    pub fn decode(self, decoder: &dyn ModelDecoder) -> Result<Page, DecodeError> {
        let items = self
            .items
            .into_iter()
            .map(|e| e.decode(decoder))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            next_cursor: self.next_cursor,
        })
    }
}

impl From<&Page> for WirePage {
    fn from(page: &Page) -> Self {
        Self {
            items: page.items.iter().map(WireEntity::from).collect(),
            next_cursor: page.next_cursor.clone(),
        }
    }
}

pub fn parse_server_message(bytes: &[u8]) -> Result<ServerMessage, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) fn parse_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}
