// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Node identification types.
//!
//! This module provides [`NodeId`] for runtime node identification and the
//! typed handles [`Cell<T>`] and [`Derivation<T>`] returned at registration.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// A runtime node identifier, dense within one [`Store`](crate::Store).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying index of this node ID.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeId").field(&self.0).finish()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Identity of the [`Store`](crate::Store) a handle was registered in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreId(pub(crate) u64);

/// An untyped reference to a node in a particular store.
///
/// Slots of retired family instances are reused; the generation tells a
/// handle to the retired node apart from a handle to its successor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) store: StoreId,
    pub(crate) id: NodeId,
    pub(crate) generation: u32,
}

impl NodeRef {
    /// Returns the node ID.
    #[must_use]
    #[inline]
    pub fn id(self) -> NodeId {
        self.id
    }

    /// Returns the identity of the owning store.
    #[must_use]
    #[inline]
    pub fn store(self) -> StoreId {
        self.store
    }
}

/// Anything that can be read from a [`Store`](crate::Store).
///
/// Implemented by [`Cell<T>`] and [`Derivation<T>`].
pub trait Readable {
    /// The value type produced by reading this node.
    type Value: Clone + 'static;

    /// Returns the untyped node reference.
    fn node_ref(&self) -> NodeRef;
}

/// A typed handle to an independently writable state cell.
///
/// Handles are `Copy` and cheap; the state lives in the [`Store`](crate::Store).
pub struct Cell<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

/// A typed handle to a memoized derived computation.
pub struct Derivation<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

macro_rules! handle_impls {
    ($name:ident) => {
        impl<T> $name<T> {
            pub(crate) const fn from_ref(node: NodeRef) -> Self {
                Self {
                    node,
                    _marker: PhantomData,
                }
            }

            pub(crate) const fn node(self) -> NodeRef {
                self.node
            }

            /// Returns the underlying node ID.
            #[must_use]
            #[inline]
            pub const fn id(self) -> NodeId {
                self.node.id
            }
        }

        impl<T: Clone + 'static> Readable for $name<T> {
            type Value = T;

            #[inline]
            fn node_ref(&self) -> NodeRef {
                self.node
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> Clone for $name<T> {
            #[inline]
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> PartialEq for $name<T> {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                self.node == other.node
            }
        }

        impl<T> Eq for $name<T> {}

        impl<T> Hash for $name<T> {
            #[inline]
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.node.hash(state);
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.node.id)
                    .field("type", &core::any::type_name::<T>())
                    .finish()
            }
        }
    };
}

handle_impls!(Cell);
handle_impls!(Derivation);
