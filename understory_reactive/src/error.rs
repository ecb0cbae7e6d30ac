// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors surfaced by reads.

use core::error::Error as StdError;
use core::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::suspense::Suspension;

/// Error returned when reading a node.
///
/// Cached errors are cloned out to every reader until a dependency of the
/// failing derivation changes.
#[derive(Clone, Debug, Error)]
pub enum ReadError {
    /// A derivation body failed.
    #[error(transparent)]
    Computation(#[from] ComputationError),
    /// A derivation transitively read itself.
    #[error(transparent)]
    Cycle(#[from] CycleError),
    /// The value depends on external data that has not arrived yet.
    #[error("{0}")]
    Suspended(Suspension),
    /// The handle refers to a family instance that was reset or evicted.
    #[error("node was retired")]
    Retired,
}

impl ReadError {
    /// Returns the suspension if this read is waiting on external data.
    #[must_use]
    pub fn as_suspension(&self) -> Option<&Suspension> {
        match self {
            Self::Suspended(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` if the read is waiting on external data.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    pub(crate) fn with_origin(self, key: &Rc<str>) -> Self {
        match self {
            Self::Computation(e) if e.origin.is_none() => Self::Computation(ComputationError {
                origin: Some(key.clone()),
                ..e
            }),
            other => other,
        }
    }
}

impl From<Suspension> for ReadError {
    fn from(suspension: Suspension) -> Self {
        Self::Suspended(suspension)
    }
}

/// A failure raised inside a derivation body.
///
/// Errors built with [`ComputationError::with_source`] keep the original
/// error, reachable through [`cause`](Self::cause) and
/// [`Error::source`](core::error::Error::source).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComputationError {
    message: Rc<str>,
    origin: Option<Rc<str>>,
    #[source]
    source: Option<Cause>,
}

/// Shared underlying error. Equal only to clones of itself.
#[derive(Clone)]
struct Cause(Rc<dyn StdError>);

impl PartialEq for Cause {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Cause {}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for Cause {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl ComputationError {
    /// Creates a computation error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Rc::from(message.into()),
            origin: None,
            source: None,
        }
    }

    /// Wraps any displayable error, keeping only its message.
    #[must_use]
    pub fn from_error(error: &dyn StdError) -> Self {
        Self::new(error.to_string())
    }

    /// Wraps an error, keeping it as the source.
    #[must_use]
    pub fn with_source(error: impl StdError + 'static) -> Self {
        let mut wrapped = Self::new(error.to_string());
        wrapped.source = Some(Cause(Rc::new(error)));
        wrapped
    }

    /// Returns the wrapped error if it is an `E`.
    #[must_use]
    pub fn cause<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.as_ref()?.0.downcast_ref::<E>()
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the key of the derivation whose body raised the error.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

/// A derivation read a node that was still computing.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", .path.join(" -> "))]
pub struct CycleError {
    path: Vec<String>,
}

impl CycleError {
    pub(crate) fn new(path: Vec<String>) -> Self {
        Self { path }
    }

    /// Returns the keys forming the cycle, starting and ending at the same node.
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_is_attached_once() {
        let err = ReadError::from(ComputationError::new("boom"));
        let inner: Rc<str> = Rc::from("inner");
        let outer: Rc<str> = Rc::from("outer");
        let err = err.with_origin(&inner).with_origin(&outer);
        let ReadError::Computation(e) = err else {
            panic!("expected a computation error");
        };
        assert_eq!(e.origin(), Some("inner"));
        assert_eq!(e.to_string(), "boom");
    }

    #[test]
    fn source_is_kept_and_downcast() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ComputationError::with_source(io);
        assert_eq!(err.message(), "missing");
        assert_eq!(
            err.cause::<std::io::Error>().map(std::io::Error::kind),
            Some(std::io::ErrorKind::NotFound)
        );
        assert!(err.cause::<CycleError>().is_none());
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.clone(), err);
        assert_ne!(ComputationError::new("missing"), err);
    }

    #[test]
    fn cycle_display_lists_path() {
        let err = CycleError::new(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
