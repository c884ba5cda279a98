//! Cursor pagination over an ordered entity set.
//!
//! Filters a set of entities by a [`Query`], sorts them into the query's
//! canonical order and slices the window the cursor and direction select.
//! The order is total: ties on the user ordering fall back to
//! `(world_address, hashed_keys, updated_at, executed_at)`.

use crate::cursor::{self, Boundary, Cursor};
use crate::entity::{Entity, Primitive, Ty};
use crate::error::Result;
use crate::felt::Felt;
use crate::query::{OrderBy, OrderDirection, Page, PaginationDirection, Query};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Comparable value extracted from an entity for ordering and comparisons.
///
/// Integers that fit an `i128` are `Int`; wider unsigned values and field
/// elements are `Felt`. The two compare numerically with each other.
/// Cross-kind order: `Null < Bool < numbers < String`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SortValue {
    Null,
    Bool(bool),
    Int(#[serde(with = "crate::entity::decimal")] i128),
    Felt(Felt),
    String(String),
}

impl SortValue {
    pub fn from_primitive(p: &Primitive) -> Self {
        match p {
            Primitive::Bool(b) => SortValue::Bool(*b),
            Primitive::U256(f)
            | Primitive::Felt252(f)
            | Primitive::ClassHash(f)
            | Primitive::ContractAddress(f)
            | Primitive::EthAddress(f) => SortValue::Felt(*f),
            Primitive::U128(v) => match i128::try_from(*v) {
                Ok(i) => SortValue::Int(i),
                Err(_) => SortValue::Felt(Felt::from(*v)),
            },
            other => other.as_i128().map(SortValue::Int).unwrap_or(SortValue::Null),
        }
    }

    /// Scalars map directly; enums sort by their selected option name;
    /// composite values sort as null.
    pub fn from_ty(ty: &Ty) -> Self {
        match ty {
            Ty::Primitive(p) => Self::from_primitive(p),
            Ty::ByteArray(s) => SortValue::String(s.clone()),
            Ty::Enum(e) => e
                .selected()
                .map(|o| SortValue::String(o.name.clone()))
                .unwrap_or(SortValue::Null),
            _ => SortValue::Null,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortValue::Null => 0,
            SortValue::Bool(_) => 1,
            SortValue::Int(_) | SortValue::Felt(_) => 2,
            SortValue::String(_) => 3,
        }
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Bool(a), SortValue::Bool(b)) => a.cmp(b),
            (SortValue::Int(a), SortValue::Int(b)) => a.cmp(b),
            (SortValue::Felt(a), SortValue::Felt(b)) => a.cmp(b),
            (SortValue::String(a), SortValue::String(b)) => a.cmp(b),
            (SortValue::Int(a), SortValue::Felt(b)) => cmp_int_felt(*a, b),
            (SortValue::Felt(a), SortValue::Int(b)) => cmp_int_felt(*b, a).reverse(),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

fn cmp_int_felt(int: i128, felt: &Felt) -> Ordering {
    match u128::try_from(int) {
        Ok(u) => Felt::from(u).cmp(felt),
        Err(_) => Ordering::Less,
    }
}

/// Position of an entity in a query's canonical order: the user ordering
/// values followed by the implicit tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    values: Vec<SortValue>,
    world_address: Felt,
    hashed_keys: Felt,
    updated_at: u64,
    executed_at: u64,
}

impl SortKey {
    pub(crate) fn new(
        values: Vec<SortValue>,
        world_address: Felt,
        hashed_keys: Felt,
        updated_at: u64,
        executed_at: u64,
    ) -> Self {
        Self {
            values,
            world_address,
            hashed_keys,
            updated_at,
            executed_at,
        }
    }

    pub(crate) fn for_entity(entity: &Entity, order_by: &[OrderBy]) -> Self {
        Self {
            values: order_by
                .iter()
                .map(|o| extract_order_value(entity, &o.field))
                .collect(),
            world_address: entity.world_address(),
            hashed_keys: entity.hashed_keys(),
            updated_at: entity.updated_at(),
            executed_at: entity.executed_at(),
        }
    }

    fn compare(&self, other: &Self, order_by: &[OrderBy]) -> Ordering {
        for (i, order) in order_by.iter().enumerate() {
            let ord = match (self.values.get(i), other.values.get(i)) {
                (Some(a), Some(b)) => a.cmp(b),
                (a, b) => a.is_some().cmp(&b.is_some()),
            };
            let ord = match order.direction {
                OrderDirection::Asc => ord,
                OrderDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        (self.world_address, self.hashed_keys, self.updated_at, self.executed_at).cmp(&(
            other.world_address,
            other.hashed_keys,
            other.updated_at,
            other.executed_at,
        ))
    }
}

fn extract_order_value(entity: &Entity, field: &str) -> SortValue {
    match field {
        "world_address" => SortValue::Felt(entity.world_address()),
        "hashed_keys" => SortValue::Felt(entity.hashed_keys()),
        "created_at" => SortValue::Int(entity.created_at() as i128),
        "updated_at" => SortValue::Int(entity.updated_at() as i128),
        "executed_at" => SortValue::Int(entity.executed_at() as i128),
        path => {
            let Some((model, member)) = path.split_once('.') else {
                return SortValue::Null;
            };
            entity
                .model(model)
                .and_then(|m| m.resolve(member.split('.')))
                .map(SortValue::from_ty)
                .unwrap_or(SortValue::Null)
        }
    }
}

/// Keep only the newest state of each `(world_address, hashed_keys)`.
fn latest_states(entities: impl IntoIterator<Item = Entity>) -> Vec<Entity> {
    let mut latest: HashMap<(Felt, Felt), Entity> = HashMap::new();
    for entity in entities {
        let id = (entity.world_address(), entity.hashed_keys());
        match latest.get(&id) {
            Some(current)
                if (current.updated_at(), current.executed_at())
                    >= (entity.updated_at(), entity.executed_at()) => {}
            _ => {
                latest.insert(id, entity);
            }
        }
    }
    latest.into_values().collect()
}

/// Run `query` over `entities`, returning one page.
pub fn paginate(entities: impl IntoIterator<Item = Entity>, query: &Query) -> Result<Page> {
    query.validate()?;

    let signature = cursor::signature(query);
    let boundary = query
        .pagination
        .cursor
        .as_deref()
        .map(|token| Cursor::decode(token, &signature))
        .transpose()?;

    let candidates = if query.historical {
        entities.into_iter().collect()
    } else {
        latest_states(entities)
    };

    let order_by = &query.pagination.order_by;
    let mut rows: Vec<(SortKey, Entity)> = candidates
        .into_iter()
        .filter(|e| query.world_addresses.is_empty() || query.world_addresses.contains(&e.world_address()))
        .filter(|e| query.models.is_empty() || e.models().iter().any(|m| query.models.contains(&m.name)))
        .filter(|e| query.clause.as_ref().map_or(true, |c| c.matches(e)))
        .map(|e| (SortKey::for_entity(&e, order_by), e))
        .collect();
    rows.sort_by(|a, b| a.0.compare(&b.0, order_by));

    // Index of the first row at or past the boundary.
    let split = |cursor: &Cursor| match cursor.boundary {
        Boundary::After => rows.partition_point(|(k, _)| k.compare(&cursor.key, order_by) != Ordering::Greater),
        Boundary::Before => rows.partition_point(|(k, _)| k.compare(&cursor.key, order_by) == Ordering::Less),
    };

    let limit = query.pagination.limit as usize;
    let (start, end, next) = match query.pagination.direction {
        PaginationDirection::Forward => {
            let start = boundary.as_ref().map(split).unwrap_or(0);
            let end = rows.len().min(start + limit);
            let next = (end < rows.len() && end > start)
                .then(|| Cursor::after(rows[end - 1].0.clone()));
            (start, end, next)
        }
        PaginationDirection::Backward => {
            let end = boundary.as_ref().map(split).unwrap_or(rows.len());
            let start = end.saturating_sub(limit);
            let next = (start > 0 && end > start).then(|| Cursor::before(rows[start].0.clone()));
            (start, end, next)
        }
    };

    let items = rows
        .drain(start..end)
        .map(|(_, mut entity)| {
            if !query.models.is_empty() {
                entity.retain_models(|m| query.models.contains(&m.name));
            }
            if query.no_hashed_keys {
                entity.clear_hashed_keys();
            }
            entity
        })
        .collect();

    Ok(Page {
        items,
        next_cursor: next.map(|c| c.encode(&signature)),
    })
}
