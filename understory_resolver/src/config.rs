// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bridge configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Keep serving the last resolved value while a refetch is in flight.
    ///
    /// When `false`, a refetch puts the query back into the loading state and
    /// readers suspend until the new response is applied.
    pub retain_on_refetch: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retain_on_refetch: true,
        }
    }
}
