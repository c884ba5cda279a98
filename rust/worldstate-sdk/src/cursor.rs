//! Opaque pagination cursors.
//!
//! A cursor names a boundary between two items of a query's canonical
//! ordering, together with a signature of the query shape it was issued
//! for. Tokens are self-describing: nothing is pinned on the server between
//! pages, and a token replayed against a different query shape is rejected.
//!
//! Token layout: `v1.` followed by unpadded base64url of a JSON payload.

use crate::error::ClientError;
use crate::paginate::SortKey;
use crate::query::Query;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CURSOR_VERSION_PREFIX: &str = "v1.";
const MAX_CURSOR_TOKEN_LEN: usize = 8 * 1024;

/// Which side of the stored key the boundary sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Boundary {
    /// Just past the key: forward scans resume with the next item.
    After,
    /// Just before the key: backward scans resume with the previous item.
    Before,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Cursor {
    pub boundary: Boundary,
    pub key: SortKey,
}

#[derive(Serialize)]
struct SignedCursorRef<'a> {
    sig: &'a str,
    #[serde(flatten)]
    cursor: &'a Cursor,
}

#[derive(Deserialize)]
struct SignedCursor {
    sig: String,
    #[serde(flatten)]
    cursor: Cursor,
}

/// The parts of a query that determine its ordering and membership.
/// Excludes `limit`, `direction` and `no_hashed_keys`: a cursor stays valid
/// across page size and scan direction changes.
#[derive(Serialize)]
struct QueryShape<'a> {
    world_addresses: &'a std::collections::BTreeSet<crate::felt::Felt>,
    clause: &'a Option<crate::clause::Clause>,
    models: &'a std::collections::BTreeSet<String>,
    order_by: &'a [crate::query::OrderBy],
    historical: bool,
}

/// Hex SHA-256 of the canonical JSON of the query shape.
pub(crate) fn signature(query: &Query) -> String {
    let shape = QueryShape {
        world_addresses: &query.world_addresses,
        clause: &query.clause,
        models: &query.models,
        order_by: &query.pagination.order_by,
        historical: query.historical,
    };
    // Serializing these plain data types cannot fail.
    let bytes = serde_json::to_vec(&shape).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

impl Cursor {
    pub fn after(key: SortKey) -> Self {
        Self {
            boundary: Boundary::After,
            key,
        }
    }

    pub fn before(key: SortKey) -> Self {
        Self {
            boundary: Boundary::Before,
            key,
        }
    }

    pub fn encode(&self, signature: &str) -> String {
        let payload = SignedCursorRef {
            sig: signature,
            cursor: self,
        };
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        format!("{}{}", CURSOR_VERSION_PREFIX, URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str, expected_signature: &str) -> Result<Self, ClientError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ClientError::InvalidCursor("cursor is empty".to_string()));
        }
        if token.len() > MAX_CURSOR_TOKEN_LEN {
            return Err(ClientError::InvalidCursor(format!(
                "cursor is {} bytes (max {})",
                token.len(),
                MAX_CURSOR_TOKEN_LEN
            )));
        }
        let body = token.strip_prefix(CURSOR_VERSION_PREFIX).ok_or_else(|| {
            ClientError::InvalidCursor("unknown cursor version".to_string())
        })?;
        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| ClientError::InvalidCursor(format!("cursor is not base64url: {}", e)))?;
        let signed: SignedCursor = serde_json::from_slice(&json)
            .map_err(|e| ClientError::InvalidCursor(format!("cursor payload: {}", e)))?;

        if signed.sig != expected_signature {
            return Err(ClientError::InvalidCursor(
                "cursor was issued for a different query".to_string(),
            ));
        }
        Ok(signed.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause::Clause;
    use crate::felt::Felt;
    use crate::paginate::SortValue;
    use crate::query::OrderBy;

    fn key() -> SortKey {
        SortKey::new(
            vec![SortValue::Int(-4), SortValue::String("x".to_string())],
            Felt::from(1u64),
            Felt::from(2u64),
            3,
            4,
        )
    }

    #[test]
    fn test_token_is_versioned_and_opaque() {
        let query = Query::new();
        let token = Cursor::after(key()).encode(&signature(&query));
        assert!(token.starts_with("v1."));
        assert!(!token.contains('{'));

        let decoded = Cursor::decode(&token, &signature(&query)).unwrap();
        assert_eq!(decoded.boundary, Boundary::After);
        assert_eq!(decoded.key, key());
    }

    #[test]
    fn test_signature_ignores_window_parameters() {
        let base = Query::new().with_order_by(OrderBy::asc("updated_at"));
        let resized = base
            .clone()
            .with_limit(7)
            .with_direction(crate::query::PaginationDirection::Backward)
            .no_hashed_keys(true);
        assert_eq!(signature(&base), signature(&resized));
    }

    #[test]
    fn test_signature_tracks_query_shape() {
        let base = Query::new();
        let variants = [
            base.clone().with_world(Felt::from(9u64)),
            base.clone().with_clause(Clause::hashed_keys([Felt::from(1u64)])),
            base.clone().with_model("ns-Hero"),
            base.clone().with_order_by(OrderBy::desc("created_at")),
            base.clone().historical(true),
        ];
        for variant in &variants {
            assert_ne!(signature(&base), signature(variant));
        }
    }

    #[test]
    fn test_rejects_foreign_and_malformed_tokens() {
        let issued_for = Query::new();
        let other = Query::new().with_order_by(OrderBy::desc("created_at"));
        let token = Cursor::before(key()).encode(&signature(&issued_for));

        assert!(matches!(
            Cursor::decode(&token, &signature(&other)),
            Err(ClientError::InvalidCursor(_))
        ));
        let oversized = "a".repeat(MAX_CURSOR_TOKEN_LEN + 1);
        for bad in ["", "v2.abc", "v1.!!!", "v1.e30", oversized.as_str()] {
            assert!(
                matches!(Cursor::decode(bad, &signature(&issued_for)), Err(ClientError::InvalidCursor(_))),
                "{bad:?} accepted"
            );
        }
    }
}
