// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request descriptors and the data source seam.

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use understory_reactive::CanonicalKey;

use crate::error::FetchError;

/// An operation name plus its variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Operation to run, e.g. a named query.
    pub operation: String,
    /// Operation variables.
    #[serde(default)]
    pub variables: Value,
}

impl Request {
    /// Creates a request.
    #[must_use]
    pub fn new(operation: impl Into<String>, variables: Value) -> Self {
        Self {
            operation: operation.into(),
            variables,
        }
    }

    /// Returns the canonical key of this request.
    ///
    /// Requests whose variables are structurally equal share a key.
    #[must_use]
    pub fn key(&self) -> CanonicalKey {
        CanonicalKey::from_value(&json!({
            "operation": self.operation,
            "variables": self.variables,
        }))
    }
}

/// Future returned by [`DataSource::fetch`].
pub type FetchFuture = LocalBoxFuture<'static, Result<Value, FetchError>>;

/// An external service answering requests with JSON.
pub trait DataSource {
    /// Starts fetching `request`.
    ///
    /// The returned future may be dropped before completion when the request
    /// is superseded or invalidated.
    fn fetch(&self, request: &Request) -> FetchFuture;
}

impl<F> DataSource for F
where
    F: Fn(&Request) -> FetchFuture,
{
    fn fetch(&self, request: &Request) -> FetchFuture {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_variable_order() {
        let a = Request::new("samples", json!({ "path": "/x", "filters": { "b": 1, "a": 2 } }));
        let b = Request::new("samples", json!({ "filters": { "a": 2, "b": 1 }, "path": "/x" }));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Request::new("labels", a.variables.clone()).key());
    }
}
