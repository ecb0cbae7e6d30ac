// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Resolver: asynchronous data sources as reactive derivations.
//!
//! A [`Bridge`] turns request descriptors into derivations of an
//! [`understory_reactive::Store`]:
//!
//! - The first read of a [`Query`] issues a fetch through the
//!   [`DataSource`] and returns [`ReadError::Suspended`]. Once the response
//!   is applied, reads return it synchronously until the query is
//!   invalidated or refetched.
//! - Responses are normalized ([`normalize`]): JSON objects with a string
//!   `id` and `__typename` become canonical records shared by every query.
//! - [`Bridge::patch`] edits one field of one record locally. Only readers
//!   of that field are invalidated.
//! - A refetch supersedes older fetches of the same query. A response only
//!   lands if it belongs to the newest generation, so out-of-order arrivals
//!   can never overwrite fresher data.
//!
//! ## Example
//!
//! ```rust
//! use futures::FutureExt;
//! use futures::executor::block_on;
//! use serde_json::json;
//! use understory_reactive::Store;
//! use understory_resolver::{Bridge, BridgeConfig, FetchFuture, RecordId, Request};
//!
//! let store = Store::new();
//! let source = |request: &Request| -> FetchFuture {
//!     let id = request.variables["id"].clone();
//!     async move { Ok(json!({ "__typename": "Sample", "id": id, "tags": ["train"] })) }
//!         .boxed_local()
//! };
//! let bridge = Bridge::new(&store, source, BridgeConfig::default());
//!
//! let sample = bridge.request("sample", json!({ "id": "s1" }));
//! assert!(store.get(&sample.node()).unwrap_err().is_suspended());
//!
//! block_on(bridge.settle());
//! assert_eq!(store.get(&sample.node()).unwrap()["tags"], json!(["train"]));
//!
//! bridge.patch(&RecordId::new("Sample", "s1"), "tags", json!(["val"]));
//! assert_eq!(store.get(&sample.node()).unwrap()["tags"], json!(["val"]));
//! ```
//!
//! [`ReadError::Suspended`]: understory_reactive::ReadError::Suspended

mod bridge;
mod config;
mod error;
mod normalize;
mod records;
mod request;
mod task;

pub use bridge::{Bridge, Query};
pub use config::BridgeConfig;
pub use error::FetchError;
pub use normalize::{
    ID_FIELD, Normalized, NormalizedResponse, RecordFields, RecordId, TYPENAME_FIELD, normalize,
};
pub use request::{DataSource, FetchFuture, Request};
pub use task::{CancellationToken, ResolveTask, TaskOutcome};
