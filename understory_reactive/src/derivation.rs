// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Derivation registration and the tracking context passed to bodies.

use core::any::Any;
use core::fmt;
use std::rc::Rc;

use crate::error::ReadError;
use crate::id::Readable;
use crate::store::Store;
use crate::value::{EqFn, ErasedValue, erase_eq};

/// Tracking context handed to derivation bodies.
///
/// Every read through [`Ctx::get`] is recorded as a dependency of the
/// derivation being computed.
pub struct Ctx<'a> {
    store: &'a Store,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Reads `node` and records it as a dependency.
    pub fn get<N: Readable>(&self, node: &N) -> Result<N::Value, ReadError> {
        self.store.get(node)
    }

    /// Returns the store being read.
    ///
    /// Reads made through the store directly are tracked as well.
    #[must_use]
    pub fn store(&self) -> &'a Store {
        self.store
    }
}

impl fmt::Debug for Ctx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx").finish_non_exhaustive()
    }
}

type Body<T> = Box<dyn Fn(&Ctx<'_>) -> Result<T, ReadError>>;

/// Typed setter, stored behind `dyn Any` and recovered on `set_derived`.
pub(crate) type SetterFn<T> = Box<dyn Fn(&Store, T)>;

/// Registration data for a [`Derivation`](crate::Derivation).
///
/// # Example
///
/// ```rust
/// use understory_reactive::{CellSpec, DerivationSpec, Store};
///
/// let store = Store::new();
/// let celsius = store.cell(CellSpec::new("celsius", 100.0_f64));
/// let fahrenheit = store.derivation(
///     DerivationSpec::new("fahrenheit", move |ctx| Ok(ctx.get(&celsius)? * 9.0 / 5.0 + 32.0))
///         .setter(move |store, f: f64| store.set(&celsius, (f - 32.0) * 5.0 / 9.0)),
/// );
///
/// assert_eq!(store.get(&fahrenheit).unwrap(), 212.0);
/// store.set_derived(&fahrenheit, 32.0);
/// assert_eq!(store.get(&celsius).unwrap(), 0.0);
/// ```
pub struct DerivationSpec<T> {
    pub(crate) key: String,
    body: Body<T>,
    setter: Option<SetterFn<T>>,
    equality: Option<EqFn>,
}

impl<T: Clone + PartialEq + 'static> DerivationSpec<T> {
    /// Creates a derivation spec from a pure body.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        body: impl Fn(&Ctx<'_>) -> Result<T, ReadError> + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            body: Box::new(body),
            setter: None,
            equality: None,
        }
    }
}

impl<T: 'static> DerivationSpec<T> {
    /// Makes the derivation writable.
    ///
    /// The setter maps a value to zero or more upstream writes. It runs
    /// inside a batch; its reads see the last committed state.
    #[must_use]
    pub fn setter(mut self, setter: impl Fn(&Store, T) + 'static) -> Self {
        self.setter = Some(Box::new(setter));
        self
    }

    /// Overrides the comparator used for early cutoff.
    ///
    /// When a recomputed value is equal to the cached one, dependents are
    /// not recomputed. Defaults to `PartialEq`.
    #[must_use]
    pub fn equality(mut self, eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equality = Some(erase_eq(eq));
        self
    }

    pub(crate) fn with_erased_equality(mut self, eq: EqFn) -> Self {
        self.equality = Some(eq);
        self
    }

    /// Returns the registration key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> fmt::Debug for DerivationSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivationSpec")
            .field("key", &self.key)
            .field("writable", &self.setter.is_some())
            .field("custom_equality", &self.equality.is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) type ErasedBody = Rc<dyn Fn(&Ctx<'_>) -> Result<ErasedValue, ReadError>>;

/// A derivation spec lowered to erased parts.
pub(crate) struct ErasedDerivation {
    pub(crate) body: ErasedBody,
    pub(crate) setter: Option<Rc<dyn Any>>,
    pub(crate) equals: EqFn,
}

impl<T: Clone + PartialEq + 'static> DerivationSpec<T> {
    pub(crate) fn erase(self) -> (String, ErasedDerivation) {
        let body = self.body;
        let body: ErasedBody =
            Rc::new(move |ctx: &Ctx<'_>| body(ctx).map(ErasedValue::new));
        let setter = self
            .setter
            .map(|setter| Rc::new(setter) as Rc<dyn Any>);
        let equals = self
            .equality
            .unwrap_or_else(|| erase_eq::<T>(|a, b| a == b));
        (
            self.key,
            ErasedDerivation {
                body,
                setter,
                equals,
            },
        )
    }
}
