// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Store and family configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`Store`](crate::Store).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Drop the cached value and dependency edges of a derivation once its
    /// last subscriber leaves and nothing else depends on it.
    ///
    /// The next read recomputes from scratch.
    pub release_unobserved: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            release_unobserved: true,
        }
    }
}

/// Eviction policy for a [`Family`](crate::Family).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FamilyPolicy {
    /// Instances live until explicitly reset.
    #[default]
    Unbounded,
    /// Once the family holds more than `capacity` instances, the
    /// least-recently requested ones that have no subscribers and no
    /// dependents are reset.
    EvictUnobserved {
        /// Soft upper bound on live instances.
        capacity: usize,
    },
}
