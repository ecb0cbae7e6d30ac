// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Persistence configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for [`Persistence::from_config`](crate::Persistence::from_config).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Prefix joined to every cell key with `.` to form the storage key.
    /// Empty means cell keys are used as-is.
    pub namespace: String,
    /// File backing [`Durability::Local`](crate::Durability::Local).
    ///
    /// When unset, local values are kept in memory only.
    pub file: Option<PathBuf>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            namespace: String::from("understory"),
            file: None,
        }
    }
}

impl PersistConfig {
    /// Returns the storage key for a cell key.
    #[must_use]
    pub fn storage_key(&self, cell_key: &str) -> String {
        if self.namespace.is_empty() {
            cell_key.to_string()
        } else {
            format!("{}.{cell_key}", self.namespace)
        }
    }
}
