//! Filter clauses.
//!
//! A [`Clause`] is a closed predicate tree over an entity's identifiers and
//! model members. The same tree filters queries and subscriptions.

use crate::entity::{Entity, Primitive, Ty};
use crate::felt::Felt;
use crate::paginate::SortValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternMatching {
    /// The entity must have exactly as many keys as the pattern.
    FixedLen,
    /// The pattern matches a prefix of the entity's keys.
    VariableLen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClause {
    /// `None` entries are wildcards.
    pub keys: Vec<Option<Felt>>,
    pub pattern_matching: PatternMatching,
    /// Models the pattern applies to; empty means any model.
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    ContainsAll,
    ContainsAny,
    ArrayLengthEq,
    ArrayLengthGt,
    ArrayLengthLt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MemberValue {
    Primitive(Primitive),
    String(String),
    List(Vec<MemberValue>),
}

impl MemberValue {
    fn scalar(&self) -> SortValue {
        match self {
            MemberValue::Primitive(p) => SortValue::from_primitive(p),
            MemberValue::String(s) => SortValue::String(s.clone()),
            MemberValue::List(_) => SortValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberClause {
    pub model: String,
    /// Dotted path into the model, e.g. `vec.x`.
    pub member: String,
    pub operator: ComparisonOperator,
    pub value: MemberValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeClause {
    pub operator: LogicalOperator,
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Clause {
    /// Matches entities whose hashed key is listed. An empty list matches all.
    HashedKeys(Vec<Felt>),
    Keys(KeysClause),
    Member(MemberClause),
    Composite(CompositeClause),
    Not(Box<Clause>),
}

impl Clause {
    pub fn hashed_keys(keys: impl IntoIterator<Item = Felt>) -> Self {
        Clause::HashedKeys(keys.into_iter().collect())
    }

    pub fn keys(keys: Vec<Option<Felt>>, pattern_matching: PatternMatching) -> Self {
        Clause::Keys(KeysClause {
            keys,
            pattern_matching,
            models: Vec::new(),
        })
    }

    pub fn member(
        model: impl Into<String>,
        member: impl Into<String>,
        operator: ComparisonOperator,
        value: MemberValue,
    ) -> Self {
        Clause::Member(MemberClause {
            model: model.into(),
            member: member.into(),
            operator,
            value,
        })
    }

    pub fn and(clauses: Vec<Clause>) -> Self {
        Clause::Composite(CompositeClause {
            operator: LogicalOperator::And,
            clauses,
        })
    }

    pub fn or(clauses: Vec<Clause>) -> Self {
        Clause::Composite(CompositeClause {
            operator: LogicalOperator::Or,
            clauses,
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: Clause) -> Self {
        Clause::Not(Box::new(clause))
    }

    /// Structural checks that can be made without the server.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Clause::HashedKeys(_) | Clause::Keys(_) => Ok(()),
            Clause::Member(m) => m.validate(),
            Clause::Composite(c) => {
                if c.clauses.is_empty() {
                    return Err(format!("{:?} clause has no children", c.operator));
                }
                c.clauses.iter().try_for_each(Clause::validate)
            }
            Clause::Not(inner) => inner.validate(),
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Clause::HashedKeys(keys) => keys.is_empty() || keys.contains(&entity.hashed_keys()),
            Clause::Keys(k) => k.matches(entity),
            Clause::Member(m) => m.matches(entity),
            Clause::Composite(c) => match c.operator {
                LogicalOperator::And => c.clauses.iter().all(|cl| cl.matches(entity)),
                LogicalOperator::Or => c.clauses.iter().any(|cl| cl.matches(entity)),
            },
            Clause::Not(inner) => !inner.matches(entity),
        }
    }
}

impl KeysClause {
    fn matches(&self, entity: &Entity) -> bool {
        entity
            .models()
            .iter()
            .filter(|m| self.models.is_empty() || self.models.contains(&m.name))
            .any(|model| {
                let keys = model.keys();
                let len_ok = match self.pattern_matching {
                    PatternMatching::FixedLen => keys.len() == self.keys.len(),
                    PatternMatching::VariableLen => keys.len() >= self.keys.len(),
                };
                len_ok
                    && self
                        .keys
                        .iter()
                        .zip(keys.iter())
                        .all(|(want, have)| want.is_none() || (have.is_some() && want == have))
            })
    }
}

impl MemberClause {
    fn validate(&self) -> Result<(), String> {
        if self.model.is_empty() {
            return Err("member clause has an empty model name".to_string());
        }
        if self.member.is_empty() || self.member.split('.').any(str::is_empty) {
            return Err(format!("member clause on {} has an empty member path", self.model));
        }

        use ComparisonOperator::*;
        match self.operator {
            In | NotIn | ContainsAll | ContainsAny => match self.value {
                MemberValue::List(_) => Ok(()),
                _ => Err(format!("{:?} requires a list value", self.operator)),
            },
            ArrayLengthEq | ArrayLengthGt | ArrayLengthLt => match &self.value {
                MemberValue::Primitive(p) if p.as_i128().is_some() => Ok(()),
                _ => Err(format!("{:?} requires an integer value", self.operator)),
            },
            Eq | Neq | Gt | Gte | Lt | Lte => match self.value {
                MemberValue::List(_) => Err(format!("{:?} requires a scalar value", self.operator)),
                _ => Ok(()),
            },
            Contains => Ok(()),
        }
    }

    fn matches(&self, entity: &Entity) -> bool {
        let Some(ty) = entity
            .model(&self.model)
            .and_then(|m| m.resolve(self.member.split('.')))
        else {
            return false;
        };

        use ComparisonOperator::*;
        match self.operator {
            Eq => SortValue::from_ty(ty) == self.value.scalar(),
            Neq => SortValue::from_ty(ty) != self.value.scalar(),
            Gt => SortValue::from_ty(ty) > self.value.scalar(),
            Gte => SortValue::from_ty(ty) >= self.value.scalar(),
            Lt => SortValue::from_ty(ty) < self.value.scalar(),
            Lte => SortValue::from_ty(ty) <= self.value.scalar(),
            In => list_contains(&self.value, &SortValue::from_ty(ty)),
            NotIn => !list_contains(&self.value, &SortValue::from_ty(ty)),
            Contains => match (ty, &self.value) {
                (Ty::ByteArray(s), MemberValue::String(needle)) => s.contains(needle.as_str()),
                _ => elements(ty).is_some_and(|els| els.contains(&self.value.scalar())),
            },
            ContainsAll => match (elements(ty), &self.value) {
                (Some(els), MemberValue::List(wanted)) => {
                    wanted.iter().all(|w| els.contains(&w.scalar()))
                }
                _ => false,
            },
            ContainsAny => match (elements(ty), &self.value) {
                (Some(els), MemberValue::List(wanted)) => {
                    wanted.iter().any(|w| els.contains(&w.scalar()))
                }
                _ => false,
            },
            ArrayLengthEq | ArrayLengthGt | ArrayLengthLt => {
                let (Some(items), MemberValue::Primitive(p)) = (ty.as_elements(), &self.value)
                else {
                    return false;
                };
                let Some(expected) = p.as_i128() else {
                    return false;
                };
                let len = items.len() as i128;
                match self.operator {
                    ArrayLengthEq => len == expected,
                    ArrayLengthGt => len > expected,
                    _ => len < expected,
                }
            }
        }
    }
}

fn elements(ty: &Ty) -> Option<Vec<SortValue>> {
    ty.as_elements()
        .map(|items| items.iter().map(SortValue::from_ty).collect())
}

fn list_contains(list: &MemberValue, value: &SortValue) -> bool {
    match list {
        MemberValue::List(items) => items.iter().any(|item| &item.scalar() == value),
        _ => false,
    }
}
