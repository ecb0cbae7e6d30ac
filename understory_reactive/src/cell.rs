// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cell registration: defaults, equality and effects.

use core::fmt;
use std::rc::Rc;

use crate::value::{EqFn, ErasedValue, erase_eq};

/// A hook attached to a cell.
///
/// `init` runs once, the first time the cell is read or written, and may
/// supply the initial value. `on_write` runs after every committed change.
/// Effects run in registration order; when several `init` hooks return a
/// value, the last one wins.
pub trait CellEffect<T> {
    /// Returns a value to use instead of the cell's default.
    fn init(&self, key: &str) -> Option<T> {
        let _ = key;
        None
    }

    /// Observes a committed change to the cell.
    fn on_write(&self, key: &str, value: &T) {
        let _ = (key, value);
    }
}

/// How a cell produces its initial value.
pub enum DefaultValue<T> {
    /// A literal default.
    Value(T),
    /// A function evaluated when the cell is first initialized (and on reset).
    Lazy(Box<dyn Fn() -> T>),
}

impl<T: fmt::Debug> fmt::Debug for DefaultValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// Registration data for a [`Cell`](crate::Cell).
///
/// # Example
///
/// ```rust
/// use understory_reactive::{CellSpec, Store};
///
/// let store = Store::new();
/// let zoom = store.cell(
///     CellSpec::new("zoom", 1.0_f64).equality(|a, b| (a - b).abs() < 1e-9),
/// );
/// store.set(&zoom, 1.0 + 1e-12);
/// assert_eq!(store.revision(), 0);
/// ```
pub struct CellSpec<T> {
    pub(crate) key: String,
    pub(crate) default: DefaultValue<T>,
    pub(crate) equality: Option<EqFn>,
    pub(crate) effects: Vec<Box<dyn CellEffect<T>>>,
}

impl<T: Clone + PartialEq + 'static> CellSpec<T> {
    /// Creates a cell spec with a literal default.
    #[must_use]
    pub fn new(key: impl Into<String>, default: T) -> Self {
        Self {
            key: key.into(),
            default: DefaultValue::Value(default),
            equality: None,
            effects: Vec::new(),
        }
    }

    /// Creates a cell spec whose default is computed on initialization.
    #[must_use]
    pub fn with_default_fn(key: impl Into<String>, default: impl Fn() -> T + 'static) -> Self {
        Self {
            key: key.into(),
            default: DefaultValue::Lazy(Box::new(default)),
            equality: None,
            effects: Vec::new(),
        }
    }
}

impl<T: 'static> CellSpec<T> {
    /// Overrides the comparator used to skip no-op writes.
    ///
    /// Defaults to `PartialEq`.
    #[must_use]
    pub fn equality(mut self, eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equality = Some(erase_eq(eq));
        self
    }

    /// Appends an effect.
    #[must_use]
    pub fn effect(mut self, effect: impl CellEffect<T> + 'static) -> Self {
        self.effects.push(Box::new(effect));
        self
    }

    /// Returns the registration key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T: fmt::Debug> fmt::Debug for CellSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellSpec")
            .field("key", &self.key)
            .field("default", &self.default)
            .field("custom_equality", &self.equality.is_some())
            .field("effects", &self.effects.len())
            .finish()
    }
}

/// Effect with its value type erased.
pub(crate) trait ErasedEffect {
    fn init(&self, key: &str) -> Option<ErasedValue>;
    fn on_write(&self, key: &str, value: &ErasedValue);
}

struct TypedEffect<T> {
    effect: Box<dyn CellEffect<T>>,
}

impl<T: 'static> ErasedEffect for TypedEffect<T> {
    fn init(&self, key: &str) -> Option<ErasedValue> {
        self.effect.init(key).map(ErasedValue::new)
    }

    fn on_write(&self, key: &str, value: &ErasedValue) {
        if let Some(value) = value.downcast_ref::<T>() {
            self.effect.on_write(key, value);
        }
    }
}

/// A cell spec lowered to erased parts for storage in the store.
pub(crate) struct ErasedCell {
    pub(crate) default: Rc<dyn Fn() -> ErasedValue>,
    pub(crate) equals: EqFn,
    pub(crate) effects: Rc<[Rc<dyn ErasedEffect>]>,
}

impl<T: Clone + PartialEq + 'static> CellSpec<T> {
    pub(crate) fn erase(self) -> (String, ErasedCell) {
        let default: Rc<dyn Fn() -> ErasedValue> = match self.default {
            DefaultValue::Value(v) => Rc::new(move || ErasedValue::new(v.clone())),
            DefaultValue::Lazy(f) => Rc::new(move || ErasedValue::new(f())),
        };
        let equals = self
            .equality
            .unwrap_or_else(|| erase_eq::<T>(|a, b| a == b));
        let effects: Rc<[Rc<dyn ErasedEffect>]> = self
            .effects
            .into_iter()
            .map(|effect| Rc::new(TypedEffect { effect }) as Rc<dyn ErasedEffect>)
            .collect();
        (
            self.key,
            ErasedCell {
                default,
                equals,
                effects,
            },
        )
    }
}
