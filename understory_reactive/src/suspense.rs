// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Suspension of reads that wait on external data.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture, Shared};

/// A shared, single-threaded future that completes with `()`.
pub type SharedReady = Shared<LocalBoxFuture<'static, ()>>;

/// A pending read.
///
/// Returned inside [`ReadError::Suspended`](crate::ReadError::Suspended) when a
/// node depends on data that has not arrived. Awaiting the suspension drives
/// the underlying work; once it completes, reading the node again observes
/// the new state. Clones share the same underlying future.
#[derive(Clone)]
pub struct Suspension {
    key: Rc<str>,
    ready: SharedReady,
}

impl Suspension {
    /// Creates a suspension for `key` that completes when `ready` does.
    pub fn new(key: impl Into<Rc<str>>, ready: impl Future<Output = ()> + 'static) -> Self {
        Self::from_shared(key, ready.boxed_local().shared())
    }

    /// Creates a suspension from an already-shared future.
    pub fn from_shared(key: impl Into<Rc<str>>, ready: SharedReady) -> Self {
        Self {
            key: key.into(),
            ready,
        }
    }

    /// Returns the key of the node being waited on.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Future for Suspension {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.ready.poll_unpin(cx)
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiting on `{}`", self.key)
    }
}
