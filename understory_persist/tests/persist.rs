// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tests for the `understory_persist` crate.

use serde::{Deserialize, Serialize};
use understory_persist::{
    Durability, FileStore, KeyValueStore, MemoryStore, PersistConfig, Persisted, Persistence,
    ValueClass,
};
use understory_reactive::{CellSpec, DerivationSpec, Store};

fn trace() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn layer() -> (Persistence, MemoryStore, MemoryStore) {
    let session = MemoryStore::new();
    let local = MemoryStore::new();
    let persistence = Persistence::new(PersistConfig::default(), session.clone(), local.clone());
    (persistence, session, local)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Viewport {
    zoom: f64,
    columns: Vec<String>,
}

#[test]
fn hydrates_from_storage_on_first_read() {
    trace();
    let (persistence, _, local) = layer();
    local.set(
        "understory.viewport",
        r#"{"zoom":2.0,"columns":["id","label"]}"#.to_string(),
    );

    let store = Store::new();
    let default = Viewport {
        zoom: 1.0,
        columns: Vec::new(),
    };
    let viewport = store.cell(
        CellSpec::new("viewport", default).persisted(
            &persistence,
            Durability::Local,
            ValueClass::Structured,
        ),
    );
    let zoom = store.derivation(DerivationSpec::new("zoom", move |ctx| {
        Ok(ctx.get(&viewport)?.zoom)
    }));

    assert_eq!(store.get(&zoom).unwrap(), 2.0);
    assert_eq!(store.get(&viewport).unwrap().columns, ["id", "label"]);
}

#[test]
fn unusable_stored_values_fall_back_to_the_default() {
    trace();
    let (persistence, _, local) = layer();
    local.set("understory.corrupt", "{not json".to_string());
    local.set("understory.mismatch", "\"seven\"".to_string());
    local.set("understory.shape", "-3".to_string());

    let store = Store::new();
    let spec = |key: &str| {
        CellSpec::new(key, 7_u32).persisted(&persistence, Durability::Local, ValueClass::Number)
    };
    let corrupt = store.cell(spec("corrupt"));
    let mismatch = store.cell(spec("mismatch"));
    let shape = store.cell(spec("shape"));
    let missing = store.cell(spec("missing"));

    for cell in [corrupt, mismatch, shape, missing] {
        assert_eq!(store.get(&cell).unwrap(), 7);
    }
    // Falling back does not rewrite storage.
    assert_eq!(local.get("understory.corrupt").as_deref(), Some("{not json"));
    assert_eq!(local.get("understory.missing"), None);
}

#[test]
fn committed_writes_are_persisted_once_per_batch() {
    let (persistence, _, local) = layer();
    let store = Store::new();
    let theme = store.cell(
        CellSpec::new("theme", String::from("light")).persisted(
            &persistence,
            Durability::Local,
            ValueClass::String,
        ),
    );

    store.batch(|s| {
        s.set(&theme, "dark".to_string());
        assert_eq!(local.get("understory.theme"), None, "staged writes are not persisted");
        s.set(&theme, "sepia".to_string());
    });
    assert_eq!(local.get("understory.theme").as_deref(), Some("\"sepia\""));

    store.update(&theme, |t| format!("{t}-contrast"));
    assert_eq!(
        local.get("understory.theme").as_deref(),
        Some("\"sepia-contrast\"")
    );
}

#[test]
fn durability_selects_the_collaborator() {
    let (persistence, session, local) = layer();
    let store = Store::new();
    let tab = store.cell(CellSpec::new("tab", 0_u8).persisted(
        &persistence,
        Durability::Session,
        ValueClass::Number,
    ));
    let sidebar = store.cell(CellSpec::new("sidebar", true).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Boolean,
    ));

    store.batch(|s| {
        s.set(&tab, 3);
        s.set(&sidebar, false);
    });

    assert_eq!(session.get("understory.tab").as_deref(), Some("3"));
    assert_eq!(local.get("understory.tab"), None);
    assert_eq!(local.get("understory.sidebar").as_deref(), Some("false"));
    assert_eq!(session.get("understory.sidebar"), None);
}

#[test]
fn optional_values_round_trip_through_null() {
    let (persistence, _, local) = layer();
    let store = Store::new();
    let selection = store.cell(CellSpec::new("selection", Some(4_i64)).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Number,
    ));
    store.set(&selection, None);
    assert_eq!(local.get("understory.selection").as_deref(), Some("null"));

    let restarted = Store::new();
    let selection = restarted.cell(CellSpec::new("selection", Some(4_i64)).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Number,
    ));
    assert_eq!(restarted.get(&selection).unwrap(), None);
}

#[test]
fn file_backed_values_survive_a_restart() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let config = PersistConfig {
        namespace: "app".to_string(),
        file: Some(dir.path().join("state.json")),
    };

    {
        let persistence = Persistence::from_config(config.clone()).unwrap();
        let store = Store::new();
        let width = store.cell(CellSpec::new("panel_width", 240_u32).persisted(
            &persistence,
            Durability::Local,
            ValueClass::Number,
        ));
        let scratch = store.cell(CellSpec::new("scratch", 0_u32).persisted(
            &persistence,
            Durability::Session,
            ValueClass::Number,
        ));
        store.batch(|s| {
            s.set(&width, 320);
            s.set(&scratch, 9);
        });
    }

    let file = FileStore::open(dir.path().join("state.json")).unwrap();
    assert_eq!(file.get("app.panel_width").as_deref(), Some("320"));
    assert_eq!(file.get("app.scratch"), None, "session values stay in memory");

    let persistence = Persistence::from_config(config).unwrap();
    let store = Store::new();
    let width = store.cell(CellSpec::new("panel_width", 240_u32).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Number,
    ));
    let scratch = store.cell(CellSpec::new("scratch", 0_u32).persisted(
        &persistence,
        Durability::Session,
        ValueClass::Number,
    ));
    assert_eq!(store.get(&width).unwrap(), 320);
    assert_eq!(store.get(&scratch).unwrap(), 0);
}

#[test]
fn forget_removes_the_stored_value() {
    let (persistence, _, local) = layer();
    let store = Store::new();
    let count = store.cell(CellSpec::new("count", 0_i32).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Number,
    ));
    store.set(&count, 5);
    assert!(!local.is_empty());

    persistence.forget(Durability::Local, "count");
    assert!(local.is_empty());

    let fresh = Store::new();
    let count = fresh.cell(CellSpec::new("count", 0_i32).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Number,
    ));
    assert_eq!(fresh.get(&count).unwrap(), 0);
}

#[test]
fn empty_namespace_uses_bare_keys() {
    let local = MemoryStore::new();
    let persistence = Persistence::new(
        PersistConfig {
            namespace: String::new(),
            file: None,
        },
        MemoryStore::new(),
        local.clone(),
    );
    let store = Store::new();
    let flag = store.cell(CellSpec::new("flag", false).persisted(
        &persistence,
        Durability::Local,
        ValueClass::Boolean,
    ));
    store.set(&flag, true);
    assert_eq!(local.get("flag").as_deref(), Some("true"));
}
