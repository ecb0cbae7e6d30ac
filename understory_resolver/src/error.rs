// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Data source failures.

use thiserror::Error;

/// Failure reported by a [`DataSource`](crate::DataSource).
///
/// A failed fetch is cached on its query as a computation error until the
/// query is refetched or invalidated.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request could not be delivered or the connection failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service answered with an error.
    #[error("{operation} failed: {message}")]
    Rejected {
        /// Operation name of the failing request.
        operation: String,
        /// Message reported by the service.
        message: String,
    },
    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Convenience constructor for [`FetchError::Transport`].
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self::Malformed(error.to_string())
    }
}
