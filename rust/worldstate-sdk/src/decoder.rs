//! Model payload decoding.
//!
//! The server ships each model as its name plus an opaque payload. A
//! [`ModelDecoder`] turns that payload into the typed member tree.

use crate::entity::Member;
use crate::error::DecodeError;
use serde::Deserialize;
use serde_json::Value;

pub trait ModelDecoder: Send + Sync + 'static {
    fn decode(&self, model: &str, raw: &Value) -> Result<Vec<Member>, DecodeError>;
}

/// Reads the member tree straight from its JSON representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModelDecoder;

impl ModelDecoder for JsonModelDecoder {
    fn decode(&self, model: &str, raw: &Value) -> Result<Vec<Member>, DecodeError> {
        Vec::<Member>::deserialize(raw).map_err(|e| DecodeError::Model {
            model: model.to_string(),
            reason: e.to_string(),
        })
    }
}
