// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Persist: cells backed by key-value storage.
//!
//! A [`PersistEffect`] attached to a cell
//!
//! - hydrates the cell the first time it is touched, if storage holds a value
//!   of the declared [`ValueClass`] that deserializes into the cell type, and
//! - serializes every committed change back to storage.
//!
//! Missing, corrupt or mismatched stored values fall back to the cell's
//! default without surfacing an error. The [`Durability`] tier picks the
//! collaborator: [`MemoryStore`] for session values, [`FileStore`] (or any
//! other [`KeyValueStore`]) for values that survive restarts.
//!
//! ## Example
//!
//! ```rust
//! use understory_persist::{
//!     Durability, KeyValueStore, MemoryStore, PersistConfig, Persisted, Persistence, ValueClass,
//! };
//! use understory_reactive::{CellSpec, Store};
//!
//! let local = MemoryStore::new();
//! local.set("understory.opacity", "0.25".to_string());
//! let persistence = Persistence::new(PersistConfig::default(), MemoryStore::new(), local.clone());
//!
//! let store = Store::new();
//! let opacity = store.cell(
//!     CellSpec::new("opacity", 1.0_f64).persisted(&persistence, Durability::Local, ValueClass::Number),
//! );
//! assert_eq!(store.get(&opacity).unwrap(), 0.25);
//!
//! store.set(&opacity, 0.5);
//! assert_eq!(local.get("understory.opacity").as_deref(), Some("0.5"));
//! ```

mod backend;
mod class;
mod config;
mod effect;
mod error;

pub use backend::{FileStore, KeyValueStore, MemoryStore};
pub use class::ValueClass;
pub use config::PersistConfig;
pub use effect::{Durability, PersistEffect, Persisted, Persistence};
pub use error::{DecodeError, PersistError};
