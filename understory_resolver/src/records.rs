// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The canonical record store.
//!
//! Each record is backed by one shape cell (the set of known field names, or
//! `None` once deleted) and one cell per field. Reads go through the
//! reactive store, so a derivation depends on exactly the fields it touched:
//! patching `name` never recomputes a reader of `email`.

use std::cell::RefCell;
use std::collections::BTreeSet;

use hashbrown::HashMap;
use serde_json::{Map, Value, json};
use tracing::debug;
use understory_reactive::{CanonicalKey, Cell, CellSpec, ReadError, Store};

use crate::normalize::{Normalized, RecordFields, RecordId, normalize};

type Shape = Option<BTreeSet<String>>;

/// Node key of a record or record field.
///
/// Identity parts are encoded as one JSON array, so separators inside ids
/// or field names cannot make two keys collide.
fn node_key(id: &RecordId, field: Option<&str>) -> String {
    let parts = match field {
        Some(field) => json!([id.typename(), id.id(), field]),
        None => json!([id.typename(), id.id()]),
    };
    format!("record:{}", CanonicalKey::from_value(&parts))
}

struct RecordCells {
    shape: Cell<Shape>,
    fields: HashMap<String, Cell<Option<Normalized>>>,
}

/// Normalized entities shared by every query of one bridge.
#[derive(Default)]
pub(crate) struct RecordStore {
    records: RefCell<HashMap<RecordId, RecordCells>>,
}

impl RecordStore {
    fn shape_cell(&self, store: &Store, id: &RecordId) -> Cell<Shape> {
        let mut records = self.records.borrow_mut();
        if let Some(cells) = records.get(id) {
            return cells.shape;
        }
        let shape = store.cell(CellSpec::new(node_key(id, None), None::<BTreeSet<String>>));
        records.insert(
            id.clone(),
            RecordCells {
                shape,
                fields: HashMap::new(),
            },
        );
        shape
    }

    fn field_cell(&self, store: &Store, id: &RecordId, field: &str) -> Cell<Option<Normalized>> {
        self.shape_cell(store, id);
        let mut records = self.records.borrow_mut();
        let Some(cells) = records.get_mut(id) else {
            unreachable!("shape cell registered above");
        };
        *cells.fields.entry_ref(field).or_insert_with(|| {
            store.cell(CellSpec::new(node_key(id, Some(field)), None::<Normalized>))
        })
    }

    /// Returns `true` if the record exists. Not tracked.
    pub(crate) fn contains(&self, store: &Store, id: &RecordId) -> bool {
        let shape = self.records.borrow().get(id).map(|cells| cells.shape);
        shape.is_some_and(|shape| matches!(store.get(&shape), Ok(Some(_))))
    }

    /// Writes every record in `records`, field by field, in one batch.
    pub(crate) fn merge(&self, store: &Store, records: Vec<(RecordId, RecordFields)>) {
        if records.is_empty() {
            return;
        }
        let count = records.len();
        store.batch(|s| {
            for (id, fields) in records {
                let shape = self.shape_cell(s, &id);
                s.update(&shape, |current| {
                    let mut names = current.clone().unwrap_or_default();
                    names.extend(fields.keys().cloned());
                    Some(names)
                });
                for (name, value) in fields {
                    let cell = self.field_cell(s, &id, &name);
                    s.set(&cell, Some(value));
                }
            }
        });
        debug!(records = count, "merged records");
    }

    /// Replaces one field of an existing record.
    ///
    /// Entities nested in `value` are merged as records of their own.
    /// Returns `false` without writing if the record does not exist.
    pub(crate) fn patch(&self, store: &Store, id: &RecordId, field: &str, value: &Value) -> bool {
        if !self.contains(store, id) {
            debug!(record = %id, field, "patch of unknown record ignored");
            return false;
        }
        let response = normalize(value);
        let mut fields = RecordFields::new();
        fields.insert(field.to_string(), response.root);
        let mut records = response.records;
        records.push((id.clone(), fields));
        self.merge(store, records);
        true
    }

    /// Deletes a record. Returns `false` if it did not exist.
    pub(crate) fn delete(&self, store: &Store, id: &RecordId) -> bool {
        if !self.contains(store, id) {
            return false;
        }
        let cells: Option<(Cell<Shape>, Vec<Cell<Option<Normalized>>>)> = self
            .records
            .borrow()
            .get(id)
            .map(|c| (c.shape, c.fields.values().copied().collect()));
        if let Some((shape, fields)) = cells {
            store.batch(|s| {
                s.set(&shape, None);
                for field in &fields {
                    s.set(field, None);
                }
            });
        }
        debug!(record = %id, "deleted record");
        true
    }

    /// Tracked read of one field.
    pub(crate) fn field(
        &self,
        store: &Store,
        id: &RecordId,
        field: &str,
    ) -> Result<Option<Value>, ReadError> {
        let shape = self.shape_cell(store, id);
        if store.get(&shape)?.is_none() {
            return Ok(None);
        }
        let cell = self.field_cell(store, id, field);
        match store.get(&cell)? {
            Some(value) => self.materialize(store, &value, &mut vec![id.clone()]).map(Some),
            None => Ok(None),
        }
    }

    /// Tracked read of a whole record, with references resolved.
    pub(crate) fn record(&self, store: &Store, id: &RecordId) -> Result<Option<Value>, ReadError> {
        self.record_value(store, id, &mut Vec::new())
    }

    fn record_value(
        &self,
        store: &Store,
        id: &RecordId,
        path: &mut Vec<RecordId>,
    ) -> Result<Option<Value>, ReadError> {
        let shape = self.shape_cell(store, id);
        let Some(names) = store.get(&shape)? else {
            return Ok(None);
        };
        path.push(id.clone());
        let mut object = Map::new();
        for name in names {
            let cell = self.field_cell(store, id, &name);
            if let Some(value) = store.get(&cell)? {
                object.insert(name, self.materialize(store, &value, path)?);
            }
        }
        path.pop();
        Ok(Some(Value::Object(object)))
    }

    /// Rebuilds JSON from a normalized value, following references.
    ///
    /// A reference back to a record already being rebuilt yields only its
    /// identity fields. A reference to a deleted record yields `null`.
    pub(crate) fn materialize(
        &self,
        store: &Store,
        value: &Normalized,
        path: &mut Vec<RecordId>,
    ) -> Result<Value, ReadError> {
        match value {
            Normalized::Scalar(v) => Ok(v.clone()),
            Normalized::List(items) => items
                .iter()
                .map(|item| self.materialize(store, item, path))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Normalized::Object(fields) => {
                let mut object = Map::new();
                for (name, item) in fields {
                    object.insert(name.clone(), self.materialize(store, item, path)?);
                }
                Ok(Value::Object(object))
            }
            Normalized::Ref(id) if path.contains(id) => Ok(id.to_value()),
            Normalized::Ref(id) => Ok(self.record_value(store, id, path)?.unwrap_or(Value::Null)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.borrow().len()
    }
}
