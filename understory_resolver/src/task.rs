// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-flight fetches.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use futures::future::{AbortHandle, FutureExt, LocalBoxFuture, Shared, abortable};
use serde_json::Value;

use crate::error::FetchError;

/// Cancels the fetch of a [`ResolveTask`].
///
/// Cancelling drops the underlying fetch future at its next poll; any
/// response it would have produced is never applied.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    handle: AbortHandle,
}

impl CancellationToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_aborted()
    }
}

/// How a [`ResolveTask`] ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// The response was normalized into the record store.
    Applied,
    /// The data source failed; the failure is cached on the query.
    Failed,
    /// A newer request for the same query was issued; the response was
    /// discarded.
    Superseded,
    /// The task was cancelled before its response arrived.
    Cancelled,
}

/// One fetch of one query generation.
///
/// The fetch only makes progress while the task (or a [`Suspension`] built
/// from it) is polled. Clones share the same underlying work.
///
/// [`Suspension`]: understory_reactive::Suspension
#[derive(Clone)]
pub struct ResolveTask {
    generation: u64,
    token: CancellationToken,
    future: Shared<LocalBoxFuture<'static, TaskOutcome>>,
}

impl ResolveTask {
    /// Wraps `fetch`, handing its result to `apply` unless cancelled first.
    pub(crate) fn spawn(
        generation: u64,
        fetch: impl Future<Output = Result<Value, FetchError>> + 'static,
        apply: impl FnOnce(Result<Value, FetchError>) -> TaskOutcome + 'static,
    ) -> Self {
        let (fetch, handle) = abortable(fetch);
        let future = async move {
            match fetch.await {
                Ok(result) => apply(result),
                Err(_aborted) => TaskOutcome::Cancelled,
            }
        }
        .boxed_local()
        .shared();
        Self {
            generation,
            token: CancellationToken { handle },
            future,
        }
    }

    /// Returns the query generation this task fetches.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the token that cancels this task.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the outcome if the task has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.future.peek().copied()
    }

    /// Returns `true` once the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// Returns `true` while the task may still apply a response.
    pub(crate) fn is_pending(&self) -> bool {
        !self.is_finished() && !self.token.is_cancelled()
    }
}

impl Future for ResolveTask {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskOutcome> {
        self.future.poll_unpin(cx)
    }
}

impl fmt::Debug for ResolveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveTask")
            .field("generation", &self.generation)
            .field("cancelled", &self.token.is_cancelled())
            .field("outcome", &self.outcome())
            .finish()
    }
}
