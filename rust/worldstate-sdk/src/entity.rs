//! Entity and model value types.
//!
//! An [`Entity`] is one indexed record: the scope it lives in, its hashed
//! key and the ordered list of [`Model`] instances attached to it. Each
//! model is a typed member tree ([`Member`] / [`Ty`] / [`Primitive`]).
//! Values are immutable once built; pages and updates own them outright.

use crate::felt::Felt;
use serde::{Deserialize, Serialize};

/// Scalar leaf of a model's member tree.
///
/// 128-bit integers travel as decimal strings so they survive JSON
/// round trips without precision loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(#[serde(with = "decimal")] i128),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(#[serde(with = "decimal")] u128),
    U256(Felt),
    Bool(bool),
    Felt252(Felt),
    ClassHash(Felt),
    ContractAddress(Felt),
    EthAddress(Felt),
}

impl Primitive {
    /// Signed view of integer primitives that fit in an `i128`.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Primitive::I8(v) => Some(v as i128),
            Primitive::I16(v) => Some(v as i128),
            Primitive::I32(v) => Some(v as i128),
            Primitive::I64(v) => Some(v as i128),
            Primitive::I128(v) => Some(v),
            Primitive::U8(v) => Some(v as i128),
            Primitive::U16(v) => Some(v as i128),
            Primitive::U32(v) => Some(v as i128),
            Primitive::U64(v) => Some(v as i128),
            Primitive::U128(v) => i128::try_from(v).ok(),
            _ => None,
        }
    }

    /// Field-element view, used for key matching. Negative integers have no
    /// felt representation here.
    pub fn as_felt(&self) -> Option<Felt> {
        match *self {
            Primitive::U256(f)
            | Primitive::Felt252(f)
            | Primitive::ClassHash(f)
            | Primitive::ContractAddress(f)
            | Primitive::EthAddress(f) => Some(f),
            Primitive::Bool(b) => Some(Felt::from(b as u64)),
            Primitive::U128(v) => Some(Felt::from(v)),
            _ => self
                .as_i128()
                .and_then(|v| u128::try_from(v).ok())
                .map(Felt::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Struct {
    pub name: String,
    pub children: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumOption {
    pub name: String,
    pub ty: Ty,
}

/// An enum value: the declared options plus the index of the selected one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    pub option: Option<u8>,
    pub options: Vec<EnumOption>,
}

impl EnumValue {
    pub fn selected(&self) -> Option<&EnumOption> {
        self.option.and_then(|i| self.options.get(i as usize))
    }
}

/// A node of the member tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Ty {
    Primitive(Primitive),
    Struct(Struct),
    Enum(EnumValue),
    Tuple(Vec<Ty>),
    Array(Vec<Ty>),
    FixedSizeArray(Vec<Ty>),
    ByteArray(String),
}

impl Ty {
    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            Ty::Primitive(p) => Some(p),
            _ => None,
        }
    }

    /// Elements of sequence-like values.
    pub fn as_elements(&self) -> Option<&[Ty]> {
        match self {
            Ty::Tuple(items) | Ty::Array(items) | Ty::FixedSizeArray(items) => Some(items),
            _ => None,
        }
    }

    pub fn child(&self, name: &str) -> Option<&Ty> {
        match self {
            Ty::Struct(s) => s.children.iter().find(|m| m.name == name).map(|m| &m.ty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    #[serde(default)]
    pub key: bool,
    pub ty: Ty,
}

impl Member {
    pub fn new(name: impl Into<String>, ty: Ty) -> Self {
        Self {
            name: name.into(),
            key: false,
            ty,
        }
    }

    pub fn key(name: impl Into<String>, ty: Ty) -> Self {
        Self {
            name: name.into(),
            key: true,
            ty,
        }
    }
}

/// One typed component instance on an entity. `children` keeps schema order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub children: Vec<Member>,
}

impl Model {
    pub fn new(name: impl Into<String>, children: Vec<Member>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.children.iter().find(|m| m.name == name)
    }

    /// Walk a dotted member path through nested structs.
    pub fn resolve<'a, I>(&self, path: I) -> Option<&Ty>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut segments = path.into_iter();
        let mut current = &self.member(segments.next()?)?.ty;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    /// Values of the key members, in schema order.
    pub fn keys(&self) -> Vec<Option<Felt>> {
        self.children
            .iter()
            .filter(|m| m.key)
            .map(|m| m.ty.as_primitive().and_then(Primitive::as_felt))
            .collect()
    }
}

/// One indexed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    world_address: Felt,
    hashed_keys: Felt,
    created_at: u64,
    updated_at: u64,
    executed_at: u64,
    models: Vec<Model>,
}

impl Entity {
    pub fn builder(world_address: Felt, hashed_keys: Felt) -> EntityBuilder {
        EntityBuilder {
            entity: Entity {
                world_address,
                hashed_keys,
                created_at: 0,
                updated_at: 0,
                executed_at: 0,
                models: Vec::new(),
            },
        }
    }

    pub fn world_address(&self) -> Felt {
        self.world_address
    }

    pub fn hashed_keys(&self) -> Felt {
        self.hashed_keys
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn executed_at(&self) -> u64 {
        self.executed_at
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }

    pub(crate) fn retain_models(&mut self, keep: impl Fn(&Model) -> bool) {
        self.models.retain(|m| keep(m));
    }

    pub(crate) fn clear_hashed_keys(&mut self) {
        self.hashed_keys = Felt::ZERO;
    }
}

/// Builds entities for fixtures and in-process indexers. Decoded entities
/// go through [`crate::frame::WireEntity`].
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    entity: Entity,
}

impl EntityBuilder {
    pub fn created_at(mut self, ts: u64) -> Self {
        self.entity.created_at = ts;
        self
    }

    pub fn updated_at(mut self, ts: u64) -> Self {
        self.entity.updated_at = ts;
        self
    }

    pub fn executed_at(mut self, ts: u64) -> Self {
        self.entity.executed_at = ts;
        self
    }

    /// Set all three timestamps at once.
    pub fn at(self, ts: u64) -> Self {
        self.created_at(ts).updated_at(ts).executed_at(ts)
    }

    pub fn model(mut self, model: Model) -> Self {
        self.entity.models.push(model);
        self
    }

    /// Returns `None` when `created_at > updated_at`.
    pub fn build(self) -> Option<Entity> {
        if self.entity.created_at > self.entity.updated_at {
            return None;
        }
        Some(self.entity)
    }
}

pub(crate) mod decimal {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position(x: u32, y: u32) -> Model {
        Model::new(
            "ns-Position",
            vec![
                Member::key("player", Ty::Primitive(Primitive::ContractAddress(Felt::from(7u64)))),
                Member::new(
                    "vec",
                    Ty::Struct(Struct {
                        name: "Vec2".to_string(),
                        children: vec![
                            Member::new("x", Ty::Primitive(Primitive::U32(x))),
                            Member::new("y", Ty::Primitive(Primitive::U32(y))),
                        ],
                    }),
                ),
            ],
        )
    }

    #[test]
    fn test_resolve_nested_member_path() {
        let model = position(3, 9);
        assert_eq!(
            model.resolve(["vec", "y"]),
            Some(&Ty::Primitive(Primitive::U32(9)))
        );
        assert!(model.resolve(["vec", "z"]).is_none());
        assert!(model.resolve(["missing"]).is_none());
    }

    #[test]
    fn test_keys_follow_schema_order() {
        let model = position(1, 2);
        assert_eq!(model.keys(), vec![Some(Felt::from(7u64))]);
    }

    #[test]
    fn test_builder_rejects_inverted_timestamps() {
        let built = Entity::builder(Felt::from(1u64), Felt::from(2u64))
            .created_at(10)
            .updated_at(5)
            .build();
        assert!(built.is_none());

        let entity = Entity::builder(Felt::from(1u64), Felt::from(2u64))
            .at(10)
            .model(position(1, 1))
            .build()
            .unwrap();
        assert_eq!(entity.updated_at(), 10);
        assert!(entity.model("ns-Position").is_some());
    }

    #[test]
    fn test_wide_integers_serialize_as_strings() {
        let ty = Ty::Primitive(Primitive::U128(u128::MAX));
        let json = serde_json::to_value(&ty).unwrap();
        assert_eq!(
            json,
            json!({"type": "primitive", "value": {"type": "u128", "value": u128::MAX.to_string()}})
        );
        let back: Ty = serde_json::from_value(json).unwrap();
        assert_eq!(back, ty);
    }

    #[test]
    fn test_negative_integers_have_no_felt_form() {
        assert_eq!(Primitive::I32(-1).as_felt(), None);
        assert_eq!(Primitive::I32(5).as_felt(), Some(Felt::from(5u64)));
    }
}
