use crate::clause::Clause;
use crate::cursor;
use crate::entity::Entity;
use crate::error::{ClientError, Result};
use crate::felt::Felt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Order fields that address the entity itself rather than a model member.
pub const ENTITY_ORDER_FIELDS: [&str; 5] = [
    "world_address",
    "hashed_keys",
    "created_at",
    "updated_at",
    "executed_at",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationDirection {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// `created_at`, `updated_at`, `executed_at`, `hashed_keys`,
    /// `world_address`, or `<model>.<member>[.<nested>...]`.
    pub field: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Desc,
        }
    }

    fn validate(&self) -> Result<()> {
        if ENTITY_ORDER_FIELDS.contains(&self.field.as_str()) {
            return Ok(());
        }
        match self.field.split_once('.') {
            Some((model, path)) if !model.is_empty() && !path.split('.').any(str::is_empty) => {
                Ok(())
            }
            _ => Err(ClientError::InvalidQuery(format!(
                "order field {:?} is neither an entity field nor <model>.<member>",
                self.field
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub limit: u32,
    #[serde(default)]
    pub direction: PaginationDirection,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_LIMIT,
            direction: PaginationDirection::Forward,
            order_by: Vec::new(),
        }
    }
}

/// A request for one page of entities. Plain value; build it, then hand it
/// to [`crate::Client::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Empty means every world.
    #[serde(default)]
    pub world_addresses: BTreeSet<Felt>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clause: Option<Clause>,
    /// Empty means every model.
    #[serde(default)]
    pub models: BTreeSet<String>,
    #[serde(default)]
    pub no_hashed_keys: bool,
    #[serde(default)]
    pub historical: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_world(mut self, world: Felt) -> Self {
        self.world_addresses.insert(world);
        self
    }

    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.clause = Some(clause);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.pagination.limit = limit;
        self
    }

    pub fn with_direction(mut self, direction: PaginationDirection) -> Self {
        self.pagination.direction = direction;
        self
    }

    pub fn with_order_by(mut self, order: OrderBy) -> Self {
        self.pagination.order_by.push(order);
        self
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.pagination.cursor = cursor;
        self
    }

    pub fn historical(mut self, historical: bool) -> Self {
        self.historical = historical;
        self
    }

    pub fn no_hashed_keys(mut self, no_hashed_keys: bool) -> Self {
        self.no_hashed_keys = no_hashed_keys;
        self
    }

    /// Everything that can be rejected before a request leaves the process:
    /// the limit, order fields, clause structure and the cursor's origin.
    pub fn validate(&self) -> Result<()> {
        if self.pagination.limit == 0 {
            return Err(ClientError::InvalidQuery(
                "pagination limit must be greater than zero".to_string(),
            ));
        }
        for order in &self.pagination.order_by {
            order.validate()?;
        }
        if let Some(clause) = &self.clause {
            clause.validate().map_err(ClientError::InvalidQuery)?;
        }
        if let Some(token) = &self.pagination.cursor {
            cursor::Cursor::decode(token, &cursor::signature(self))?;
        }
        Ok(())
    }
}

/// One page of results. `next_cursor` is set iff more items exist in the
/// requested direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<Entity>,
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause::{ComparisonOperator, MemberValue};

    #[test]
    fn test_zero_limit_is_invalid() {
        let err = Query::new().with_limit(0).validate().unwrap_err();
        assert!(matches!(err, ClientError::InvalidQuery(_)));
    }

    #[test]
    fn test_order_field_shapes() {
        assert!(Query::new().with_order_by(OrderBy::asc("updated_at")).validate().is_ok());
        assert!(Query::new().with_order_by(OrderBy::desc("ns-Hero.stats.level")).validate().is_ok());
        for bad in ["", "level", "ns-Hero.", ".level", "ns-Hero..level"] {
            let err = Query::new().with_order_by(OrderBy::asc(bad)).validate().unwrap_err();
            assert!(matches!(err, ClientError::InvalidQuery(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_malformed_clause_is_invalid() {
        let query = Query::new().with_clause(Clause::member(
            "ns-Hero",
            "level",
            ComparisonOperator::In,
            MemberValue::String("x".to_string()),
        ));
        assert!(matches!(query.validate(), Err(ClientError::InvalidQuery(_))));
    }

    #[test]
    fn test_garbage_cursor_is_invalid_cursor() {
        let query = Query::new().with_cursor(Some("not-a-cursor".to_string()));
        assert!(matches!(query.validate(), Err(ClientError::InvalidCursor(_))));
    }

    #[test]
    fn test_query_serde_defaults() {
        let query: Query = serde_json::from_str(r#"{"pagination": {"limit": 5}}"#).unwrap();
        assert_eq!(query.pagination.limit, 5);
        assert_eq!(query.pagination.direction, PaginationDirection::Forward);
        assert!(query.world_addresses.is_empty());
        assert!(query.clause.is_none());
    }
}
