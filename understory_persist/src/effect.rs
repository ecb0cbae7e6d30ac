// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The persistence cell effect.

use core::fmt;
use core::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use understory_reactive::{CellEffect, CellSpec};

use crate::backend::{FileStore, KeyValueStore, MemoryStore};
use crate::class::ValueClass;
use crate::config::PersistConfig;
use crate::error::PersistError;

/// Which collaborator backs a persisted cell.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Lives as long as the session, e.g. one window or tab.
    Session,
    /// Survives restarts.
    #[default]
    Local,
}

/// The collaborators available to persisted cells.
#[derive(Clone)]
pub struct Persistence {
    config: Rc<PersistConfig>,
    session: Rc<dyn KeyValueStore>,
    local: Rc<dyn KeyValueStore>,
}

impl Persistence {
    /// Creates a persistence layer from explicit collaborators.
    pub fn new(
        config: PersistConfig,
        session: impl KeyValueStore + 'static,
        local: impl KeyValueStore + 'static,
    ) -> Self {
        Self {
            config: Rc::new(config),
            session: Rc::new(session),
            local: Rc::new(local),
        }
    }

    /// Creates a persistence layer with a [`MemoryStore`] for session values
    /// and, if `config.file` is set, a [`FileStore`] for local values.
    pub fn from_config(config: PersistConfig) -> Result<Self, PersistError> {
        let local: Rc<dyn KeyValueStore> = match &config.file {
            Some(path) => Rc::new(FileStore::open(path)?),
            None => Rc::new(MemoryStore::new()),
        };
        Ok(Self {
            config: Rc::new(config),
            session: Rc::new(MemoryStore::new()),
            local,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Returns the collaborator for a durability tier.
    #[must_use]
    pub fn backend(&self, durability: Durability) -> Rc<dyn KeyValueStore> {
        match durability {
            Durability::Session => self.session.clone(),
            Durability::Local => self.local.clone(),
        }
    }

    /// Builds an effect persisting a cell in the given tier.
    #[must_use]
    pub fn effect<T>(&self, durability: Durability, class: ValueClass) -> PersistEffect<T> {
        PersistEffect {
            config: self.config.clone(),
            backend: self.backend(durability),
            durability,
            class,
            _marker: PhantomData,
        }
    }

    /// Removes the stored value of a cell.
    pub fn forget(&self, durability: Durability, cell_key: &str) {
        self.backend(durability)
            .remove(&self.config.storage_key(cell_key));
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Hydrates a cell from storage and writes every committed change back.
///
/// Stored text that is not JSON, does not match the declared
/// [`ValueClass`], or does not deserialize into `T` is ignored and the cell
/// keeps its default.
pub struct PersistEffect<T> {
    config: Rc<PersistConfig>,
    backend: Rc<dyn KeyValueStore>,
    durability: Durability,
    class: ValueClass,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Serialize + DeserializeOwned> CellEffect<T> for PersistEffect<T> {
    fn init(&self, key: &str) -> Option<T> {
        let storage_key = self.config.storage_key(key);
        let raw = self.backend.get(&storage_key)?;
        match self.class.decode(&raw) {
            Ok(value) => {
                debug!(key, durability = ?self.durability, "hydrated cell");
                Some(value)
            }
            Err(error) => {
                debug!(key, %error, "ignoring stored value, using default");
                None
            }
        }
    }

    fn on_write(&self, key: &str, value: &T) {
        let storage_key = self.config.storage_key(key);
        match serde_json::to_string(value) {
            Ok(text) => self.backend.set(&storage_key, text),
            Err(error) => warn!(key, %error, "cell value cannot be persisted"),
        }
    }
}

impl<T> fmt::Debug for PersistEffect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistEffect")
            .field("durability", &self.durability)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

/// Adds persistence to a [`CellSpec`].
pub trait Persisted: Sized {
    /// Attaches a [`PersistEffect`] in `durability` checking `class`.
    #[must_use]
    fn persisted(self, persistence: &Persistence, durability: Durability, class: ValueClass)
    -> Self;
}

impl<T> Persisted for CellSpec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn persisted(
        self,
        persistence: &Persistence,
        durability: Durability,
        class: ValueClass,
    ) -> Self {
        self.effect(persistence.effect::<T>(durability, class))
    }
}
