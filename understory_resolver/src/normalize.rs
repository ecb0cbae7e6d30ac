// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Splitting responses into canonical records.
//!
//! Any JSON object carrying both a string `id` and a string `__typename` is
//! an entity. Entities are lifted out of the response into records keyed by
//! [`RecordId`] and replaced by [`Normalized::Ref`]; everything else stays
//! inline. Two responses mentioning the same entity therefore converge on one
//! record.

use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};

/// Field carrying the entity type.
pub const TYPENAME_FIELD: &str = "__typename";
/// Field carrying the entity id.
pub const ID_FIELD: &str = "id";

/// Identity of a canonical record: entity type plus id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    typename: Rc<str>,
    id: Rc<str>,
}

impl RecordId {
    /// Creates a record id.
    #[must_use]
    pub fn new(typename: impl Into<Rc<str>>, id: impl Into<Rc<str>>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }

    /// Returns the entity type.
    #[must_use]
    pub fn typename(&self) -> &str {
        &self.typename
    }

    /// Returns the entity id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the identity fields as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(TYPENAME_FIELD.into(), Value::String(self.typename.to_string()));
        map.insert(ID_FIELD.into(), Value::String(self.id.to_string()));
        Value::Object(map)
    }

    fn of(map: &Map<String, Value>) -> Option<Self> {
        match (map.get(TYPENAME_FIELD), map.get(ID_FIELD)) {
            (Some(Value::String(typename)), Some(Value::String(id))) => {
                Some(Self::new(typename.as_str(), id.as_str()))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({}:{})", self.typename, self.id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

/// A JSON value with entities replaced by references.
#[derive(Clone, Debug, PartialEq)]
pub enum Normalized {
    /// `null`, a boolean, a number or a string.
    Scalar(Value),
    /// A reference to a canonical record.
    Ref(RecordId),
    /// An array.
    List(Vec<Normalized>),
    /// An object that is not an entity.
    Object(BTreeMap<String, Normalized>),
}

/// Fields of one record, as found in a response.
pub type RecordFields = BTreeMap<String, Normalized>;

/// Result of normalizing a response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedResponse {
    /// The response with entities replaced by references.
    pub root: Normalized,
    /// Every entity found, in document order. An entity seen twice appears
    /// twice; later fields win when merged.
    pub records: Vec<(RecordId, RecordFields)>,
}

impl Default for Normalized {
    fn default() -> Self {
        Self::Scalar(Value::Null)
    }
}

/// Normalizes a response.
#[must_use]
pub fn normalize(value: &Value) -> NormalizedResponse {
    let mut records = Vec::new();
    let root = lift(value, &mut records);
    NormalizedResponse { root, records }
}

fn lift(value: &Value, records: &mut Vec<(RecordId, RecordFields)>) -> Normalized {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            Normalized::Scalar(value.clone())
        }
        Value::Array(items) => Normalized::List(items.iter().map(|v| lift(v, records)).collect()),
        Value::Object(map) => {
            let fields: RecordFields = map
                .iter()
                .map(|(name, v)| (name.clone(), lift(v, records)))
                .collect();
            match RecordId::of(map) {
                Some(id) => {
                    records.push((id.clone(), fields));
                    Normalized::Ref(id)
                }
                None => Normalized::Object(fields),
            }
        }
    }
}
