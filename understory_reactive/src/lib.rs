// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Reactive: a lazily recomputed graph of cells and derivations.
//!
//! The crate models application state as a dependency graph:
//!
//! - **Cells** ([`Cell`], [`CellSpec`]): independently writable values with a
//!   default, an optional comparator and optional [`CellEffect`]s.
//! - **Derivations** ([`Derivation`], [`DerivationSpec`]): pure functions of
//!   other nodes. Dependencies are recorded from the reads a body performs,
//!   so they may differ from one run to the next. A derivation with a setter
//!   is writable and maps writes onto its upstream cells.
//! - **Families** ([`Family`], [`FamilySpec`]): parameterized derivations
//!   with one live instance per [`CanonicalKey`].
//! - **Batches** ([`Store::batch`]): writes commit atomically; no reader
//!   ever observes part of a batch.
//! - **Suspension** ([`Suspension`]): a read that waits on external data
//!   returns [`ReadError::Suspended`] carrying a future to await.
//!
//! ## Quick Start
//!
//! ```rust
//! use understory_reactive::{CellSpec, DerivationSpec, Store};
//!
//! let store = Store::new();
//!
//! let is_group = store.cell(CellSpec::new("isGroup", false));
//! let slices = store.cell(CellSpec::new("hasGroupSlices", false));
//! let session_slice = store.cell(CellSpec::new("sessionGroupSlice", None::<String>));
//!
//! let group_slice = store.derivation(DerivationSpec::new("groupSlice", move |ctx| {
//!     if ctx.get(&is_group)? && ctx.get(&slices)? {
//!         ctx.get(&session_slice)
//!     } else {
//!         Ok(None)
//!     }
//! }));
//!
//! store.batch(|s| {
//!     s.set(&is_group, true);
//!     s.set(&slices, true);
//!     s.set(&session_slice, Some("left".to_string()));
//! });
//! assert_eq!(store.get(&group_slice).unwrap().as_deref(), Some("left"));
//! ```
//!
//! ## Invalidation
//!
//! A committed write marks every transitive dependent dirty and recomputes
//! nothing. A dirty derivation is brought up to date on its next read by
//! revalidating its dependencies in the order it read them. When a
//! recomputation produces a value equal to the cached one, its dependents are
//! not recomputed (early cutoff).
//!
//! Errors raised by a body, including [`CycleError`]s, are cached like values
//! and returned to every reader until a dependency changes.
//!
//! ## Threading
//!
//! A [`Store`] is single-threaded (`!Send`). Async work is expressed through
//! [`Suspension`] futures polled by the caller's executor.

mod canonical;
mod cell;
mod config;
mod derivation;
mod error;
mod family;
mod graph;
mod id;
mod store;
mod suspense;
mod value;

pub use canonical::{CANONICAL_VERSION, CanonicalKey};
pub use cell::{CellEffect, CellSpec, DefaultValue};
pub use config::{FamilyPolicy, StoreConfig};
pub use derivation::{Ctx, DerivationSpec};
pub use error::{ComputationError, CycleError, ReadError};
pub use family::{Family, FamilySpec};
pub use id::{Cell, Derivation, NodeId, NodeRef, Readable, StoreId};
pub use store::{NodeStatus, Revision, Store, Subscription};
pub use suspense::{SharedReady, Suspension};
