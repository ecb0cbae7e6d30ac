// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parameterized derivations.
//!
//! A [`Family`] maps each canonicalized parameter to exactly one live
//! [`Derivation`]. Callers may rebuild structurally equal parameters freely;
//! they all land on the same instance, the same cache entry and the same
//! subscriber set.

use core::fmt;
use std::cell::{Cell as Flag, RefCell};
use std::rc::Rc;

use hashbrown::HashMap;
use serde::Serialize;
use tracing::debug;

use crate::canonical::CanonicalKey;
use crate::config::FamilyPolicy;
use crate::derivation::{Ctx, DerivationSpec};
use crate::error::ReadError;
use crate::id::{Derivation, StoreId};
use crate::store::{NodeStatus, Store};
use crate::value::{EqFn, erase_eq};

type FamilyBody<P, T> = Rc<dyn Fn(&Ctx<'_>, &P) -> Result<T, ReadError>>;
type Canonicalize<P> = Rc<dyn Fn(&P) -> CanonicalKey>;

/// Registration data for a [`Family`].
pub struct FamilySpec<P, T> {
    key: String,
    policy: FamilyPolicy,
    canonicalize: Canonicalize<P>,
    body: FamilyBody<P, T>,
    equality: Option<Rc<dyn Fn(&T, &T) -> bool>>,
}

impl<P: Serialize + 'static, T: 'static> FamilySpec<P, T> {
    /// Creates a family keyed by the [`CanonicalKey`] of each parameter.
    ///
    /// # Panics
    ///
    /// [`Family::get`] panics if a parameter cannot be serialized to JSON.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        body: impl Fn(&Ctx<'_>, &P) -> Result<T, ReadError> + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            policy: FamilyPolicy::default(),
            canonicalize: Rc::new(|param: &P| match CanonicalKey::of(param) {
                Ok(key) => key,
                Err(e) => panic!("family parameter cannot be canonicalized: {e}"),
            }),
            body: Rc::new(body),
            equality: None,
        }
    }
}

impl<P: 'static, T: 'static> FamilySpec<P, T> {
    /// Creates a family with a custom canonicalization function.
    ///
    /// `canonicalize` must map structurally equal parameters to equal keys
    /// and distinct parameters to distinct keys.
    #[must_use]
    pub fn with_canonicalize(
        key: impl Into<String>,
        canonicalize: impl Fn(&P) -> CanonicalKey + 'static,
        body: impl Fn(&Ctx<'_>, &P) -> Result<T, ReadError> + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            policy: FamilyPolicy::default(),
            canonicalize: Rc::new(canonicalize),
            body: Rc::new(body),
            equality: None,
        }
    }

    /// Sets the eviction policy.
    #[must_use]
    pub fn policy(mut self, policy: FamilyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the comparator used for early cutoff in every instance.
    #[must_use]
    pub fn equality(mut self, eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equality = Some(Rc::new(eq));
        self
    }

    /// Returns the registration key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<P, T> fmt::Debug for FamilySpec<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FamilySpec")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

struct Instance<T> {
    node: Derivation<T>,
    last_used: u64,
}

struct FamilyInner<P, T> {
    key: String,
    store: StoreId,
    policy: FamilyPolicy,
    canonicalize: Canonicalize<P>,
    body: FamilyBody<P, T>,
    equals: Option<EqFn>,
    instances: RefCell<HashMap<CanonicalKey, Instance<T>>>,
    clock: Flag<u64>,
}

/// A keyed cache of derivations.
///
/// Cloning a `Family` yields another handle to the same cache.
///
/// # Example
///
/// ```rust
/// use understory_reactive::{CellSpec, FamilySpec, Store};
///
/// let store = Store::new();
/// let base = store.cell(CellSpec::new("base", 10_i64));
/// let offset = store.family(FamilySpec::new("offset", move |ctx, by: &i64| {
///     Ok(ctx.get(&base)? + by)
/// }));
///
/// let plus_two = offset.get(&store, &2);
/// assert_eq!(store.get(&plus_two).unwrap(), 12);
/// assert_eq!(offset.get(&store, &2), plus_two);
/// ```
pub struct Family<P, T> {
    inner: Rc<FamilyInner<P, T>>,
}

impl<P, T> Clone for Family<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Store {
    /// Registers a family.
    ///
    /// # Panics
    ///
    /// Panics if a family with the same key is already registered.
    pub fn family<P, T>(&self, spec: FamilySpec<P, T>) -> Family<P, T>
    where
        P: Clone + 'static,
        T: Clone + PartialEq + 'static,
    {
        self.reserve_family(&spec.key);
        let equals = spec.equality.map(|eq| erase_eq(move |a: &T, b: &T| eq(a, b)));
        Family {
            inner: Rc::new(FamilyInner {
                key: spec.key,
                store: self.id(),
                policy: spec.policy,
                canonicalize: spec.canonicalize,
                body: spec.body,
                equals,
                instances: RefCell::new(HashMap::new()),
                clock: Flag::new(0),
            }),
        }
    }
}

impl<P, T> Family<P, T>
where
    P: Clone + 'static,
    T: Clone + PartialEq + 'static,
{
    /// Returns the instance for `param`, creating it on first request.
    ///
    /// # Panics
    ///
    /// Panics if `store` is not the store the family was registered in.
    pub fn get(&self, store: &Store, param: &P) -> Derivation<T> {
        let inner = &*self.inner;
        assert_eq!(
            store.id(),
            inner.store,
            "family `{}` belongs to a different store",
            inner.key
        );
        let canonical = (inner.canonicalize)(param);
        let tick = inner.clock.get() + 1;
        inner.clock.set(tick);

        if let Some(instance) = inner.instances.borrow_mut().get_mut(&canonical) {
            instance.last_used = tick;
            return instance.node;
        }

        let body = inner.body.clone();
        let captured = param.clone();
        let mut spec = DerivationSpec::new(
            format!("{}/{}", inner.key, canonical),
            move |ctx| body(ctx, &captured),
        );
        if let Some(eq) = &inner.equals {
            spec = spec.with_erased_equality(eq.clone());
        }
        let node = store.derivation(spec);
        debug!(family = %inner.key, param = %canonical, "created family instance");
        inner.instances.borrow_mut().insert(
            canonical,
            Instance {
                node,
                last_used: tick,
            },
        );
        self.evict(store, node);
        node
    }

    /// Removes the instance for `param` and detaches its subscribers.
    ///
    /// Dependents are dirtied; their next read builds a fresh instance.
    /// The old handle reads as [`ReadError::Retired`] from then on.
    /// Returns `false` if no instance existed.
    pub fn reset(&self, store: &Store, param: &P) -> bool {
        let canonical = (self.inner.canonicalize)(param);
        let removed = self.inner.instances.borrow_mut().remove(&canonical);
        match removed {
            Some(instance) => {
                store.retire(store.resolve_ref(instance.node.node()));
                debug!(family = %self.inner.key, param = %canonical, "reset family instance");
                true
            }
            None => false,
        }
    }

    /// Removes every instance.
    pub fn reset_all(&self, store: &Store) {
        let drained: Vec<_> = self.inner.instances.borrow_mut().drain().collect();
        for (_, instance) in drained {
            store.retire(store.resolve_ref(instance.node.node()));
        }
        debug!(family = %self.inner.key, "reset all family instances");
    }

    /// Returns `true` if a live instance exists for `param`.
    #[must_use]
    pub fn contains(&self, param: &P) -> bool {
        let canonical = (self.inner.canonicalize)(param);
        self.inner.instances.borrow().contains_key(&canonical)
    }

    /// Returns the number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.instances.borrow().len()
    }

    /// Returns `true` if no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.instances.borrow().is_empty()
    }

    /// Returns the family's registration key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Applies [`FamilyPolicy::EvictUnobserved`] after an insert.
    fn evict(&self, store: &Store, keep: Derivation<T>) {
        let FamilyPolicy::EvictUnobserved { capacity } = self.inner.policy else {
            return;
        };
        let mut candidates: Vec<(u64, CanonicalKey, Derivation<T>)> = {
            let instances = self.inner.instances.borrow();
            if instances.len() <= capacity {
                return;
            }
            instances
                .iter()
                .filter(|(_, instance)| instance.node != keep)
                .map(|(key, instance)| (instance.last_used, key.clone(), instance.node))
                .collect()
        };
        candidates.sort_unstable_by_key(|(last_used, _, _)| *last_used);

        for (_, canonical, node) in candidates {
            if self.inner.instances.borrow().len() <= capacity {
                break;
            }
            let id = store.resolve_ref(node.node());
            if store.is_observed(id) || store.status(&node) == NodeStatus::Computing {
                continue;
            }
            self.inner.instances.borrow_mut().remove(&canonical);
            store.retire(id);
            debug!(family = %self.inner.key, param = %canonical, "evicted family instance");
        }
    }
}

impl<P, T> fmt::Debug for Family<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("key", &self.inner.key)
            .field("policy", &self.inner.policy)
            .field("instances", &self.inner.instances.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellSpec;
    use std::cell::Cell as Counter;

    #[test]
    fn equal_params_share_an_instance() {
        let store = Store::new();
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let len = store.family(FamilySpec::new("len", move |_, s: &String| {
            r.set(r.get() + 1);
            Ok(s.len())
        }));

        let a = len.get(&store, &String::from("abc"));
        let b = len.get(&store, &String::from("abc"));
        assert_eq!(a, b);
        assert_eq!(store.get(&a).unwrap(), 3);
        assert_eq!(store.get(&b).unwrap(), 3);
        assert_eq!(runs.get(), 1);
        assert_eq!(len.len(), 1);
        assert!(len.contains(&String::from("abc")));
        assert!(!len.contains(&String::from("abcd")));
    }

    #[test]
    fn reset_detaches_and_rebuilds() {
        let store = Store::new();
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let twice = store.family(FamilySpec::new("twice", move |_, n: &u32| {
            r.set(r.get() + 1);
            Ok(n * 2)
        }));
        let first = twice.get(&store, &4);
        let sub = store.subscribe(&first, |_| {});
        assert_eq!(store.subscriber_count(&first), 1);

        assert!(twice.reset(&store, &4));
        assert!(!twice.reset(&store, &4));
        assert_eq!(store.subscriber_count(&first), 0);
        assert!(!sub.unsubscribe());
        assert!(twice.is_empty());

        let second = twice.get(&store, &4);
        assert_ne!(first, second);
        assert_eq!(store.get(&second).unwrap(), 8);
        assert_eq!(runs.get(), 2);
        assert!(matches!(store.get(&first), Err(ReadError::Retired)));
        assert_eq!(store.status(&first), NodeStatus::Retired);
    }

    #[test]
    fn evicted_slots_are_reused() {
        let store = Store::new();
        let square = store.family(
            FamilySpec::new("square", |_, n: &u32| Ok(n * n))
                .policy(FamilyPolicy::EvictUnobserved { capacity: 2 }),
        );
        let first = square.get(&store, &0);
        for n in 0..10_000_u32 {
            let node = square.get(&store, &n);
            assert_eq!(store.get(&node).unwrap(), n * n);
        }
        assert_eq!(square.len(), 2);
        assert!(store.len() <= 3, "store grew to {}", store.len());
        assert!(matches!(store.get(&first), Err(ReadError::Retired)));

        let again = square.get(&store, &0);
        assert_ne!(first, again);
        assert_eq!(store.get(&again).unwrap(), 0);
    }

    #[test]
    fn dependents_of_a_retired_instance_rebuild_it() {
        let store = Store::new();
        let base = store.cell(CellSpec::new("base", 1_u32));
        let plus = store.family(FamilySpec::new("plus", move |ctx, n: &u32| {
            Ok(ctx.get(&base)? + n)
        }));
        let p = plus.clone();
        let total = store.derivation(DerivationSpec::new("total", move |ctx| {
            let node = p.get(ctx.store(), &10);
            ctx.get(&node)
        }));
        assert_eq!(store.get(&total).unwrap(), 11);

        assert!(plus.reset(&store, &10));
        assert_eq!(store.status(&total), NodeStatus::Dirty);
        assert_eq!(store.get(&total).unwrap(), 11);
        assert!(plus.contains(&10));

        store.set(&base, 5);
        assert_eq!(store.get(&total).unwrap(), 15);
    }

    #[test]
    #[should_panic(expected = "family `twice` is already registered")]
    fn family_keys_are_unique() {
        let store = Store::new();
        let _first = store.family(FamilySpec::new("twice", |_, n: &u32| Ok(n * 2)));
        let _second = store.family(FamilySpec::new("twice", |_, n: &u32| Ok(n + n)));
    }

    #[test]
    fn eviction_spares_observed_instances() {
        let store = Store::new();
        let square = store.family(
            FamilySpec::new("square", |_, n: &i32| Ok(n * n))
                .policy(FamilyPolicy::EvictUnobserved { capacity: 2 }),
        );
        let one = square.get(&store, &1);
        let _sub = store.subscribe(&one, |_| {});
        let _ = square.get(&store, &2);
        let _ = square.get(&store, &3);

        assert_eq!(square.len(), 2);
        assert!(square.contains(&1), "subscribed instance survives");
        assert!(!square.contains(&2), "least recently used unobserved instance goes");
        assert!(square.contains(&3));
    }

    #[test]
    fn custom_canonicalization() {
        let store = Store::new();
        let lower = store.family(FamilySpec::with_canonicalize(
            "lower",
            |s: &String| CanonicalKey::from_raw(s.to_lowercase()),
            |_, s: &String| Ok(s.to_lowercase()),
        ));
        assert_eq!(
            lower.get(&store, &"ABC".to_string()),
            lower.get(&store, &"abc".to_string())
        );
    }
}
