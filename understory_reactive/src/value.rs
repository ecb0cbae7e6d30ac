// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Type-erased node value storage.

use core::any::Any;
use core::fmt;
use std::rc::Rc;

/// A type-erased, shared node value.
///
/// Cloning is a reference-count bump; readers receive clones of the inner `T`.
#[derive(Clone)]
pub(crate) struct ErasedValue(Rc<dyn Any>);

impl ErasedValue {
    pub(crate) fn new<T: 'static>(value: T) -> Self {
        Self(Rc::new(value))
    }

    pub(crate) fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for ErasedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedValue").finish_non_exhaustive()
    }
}

/// Erased equality comparator.
pub(crate) type EqFn = Rc<dyn Fn(&ErasedValue, &ErasedValue) -> bool>;

/// Wraps a typed comparator; values of the wrong type never compare equal.
pub(crate) fn erase_eq<T: 'static>(eq: impl Fn(&T, &T) -> bool + 'static) -> EqFn {
    Rc::new(move |a: &ErasedValue, b: &ErasedValue| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => eq(a, b),
            _ => false,
        }
    })
}
