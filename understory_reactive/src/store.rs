// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The dependency graph engine.
//!
//! # Protocol
//!
//! Writes are staged into a batch. Committing a batch applies every staged
//! value whose comparator reports a change, advances the store revision,
//! marks all transitive dependents dirty, runs on-write effects and finally
//! notifies subscribers. Nothing is recomputed during marking.
//!
//! Reads are lazy. A dirty derivation first revalidates its recorded
//! dependencies in the order it read them; it only reruns its body if one of
//! them changed after the derivation was last verified. A rerun that produces
//! an equal value keeps the old `changed_at` revision, so its own dependents
//! revalidate without recomputing.

use core::any::type_name;
use core::fmt;
use std::cell::{Cell as Flag, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace};

use crate::cell::{CellSpec, ErasedCell};
use crate::config::StoreConfig;
use crate::derivation::{Ctx, DerivationSpec, ErasedDerivation, SetterFn};
use crate::error::{CycleError, ReadError};
use crate::graph::{DepGraph, TraversalScratch};
use crate::id::{Cell, Derivation, NodeId, NodeRef, Readable, StoreId};
use crate::value::ErasedValue;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic counter advanced once per committed change.
pub type Revision = u64;

/// Observable state of a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// The cached value is current. Cells are always clean.
    Clean,
    /// A dependency may have changed, or the value was never computed.
    Dirty,
    /// The body is running.
    Computing,
    /// The last computation is waiting on external data.
    Pending,
    /// The last computation failed; the error is cached.
    Error,
    /// The handle refers to a family instance that was reset or evicted.
    Retired,
}

enum DerivedState {
    Uncomputed,
    Computing,
    Ready(Result<ErasedValue, ReadError>),
}

struct DerivedSlot {
    parts: ErasedDerivation,
    state: DerivedState,
    dirty: bool,
    /// A dependency was retired; revalidation cannot be trusted.
    forced: bool,
    verified_at: Revision,
}

struct CellSlot {
    parts: ErasedCell,
    value: Option<ErasedValue>,
}

enum SlotKind {
    Cell(CellSlot),
    Derived(DerivedSlot),
    /// Freed by [`Store::retire`], waiting for reuse.
    Vacant,
}

struct Slot {
    key: Rc<str>,
    generation: u32,
    changed_at: Revision,
    kind: SlotKind,
}

/// Reads recorded for one running body.
struct Frame {
    node: NodeId,
    reads: Vec<NodeId>,
}

#[derive(Default)]
struct PendingBatch {
    writes: Vec<(NodeId, ErasedValue)>,
}

impl PendingBatch {
    fn stage(&mut self, id: NodeId, value: ErasedValue) {
        match self.writes.iter_mut().find(|(k, _)| *k == id) {
            Some(entry) => entry.1 = value,
            None => self.writes.push((id, value)),
        }
    }

    fn get(&self, id: NodeId) -> Option<ErasedValue> {
        self.writes
            .iter()
            .find(|(k, _)| *k == id)
            .map(|(_, v)| v.clone())
    }
}

type Callback = Rc<dyn Fn(&Store)>;

struct Inner {
    id: StoreId,
    config: StoreConfig,
    nodes: RefCell<Vec<Slot>>,
    free: RefCell<Vec<NodeId>>,
    by_key: RefCell<HashMap<Rc<str>, NodeId>>,
    families: RefCell<HashSet<Rc<str>>>,
    graph: RefCell<DepGraph>,
    scratch: RefCell<TraversalScratch>,
    revision: Flag<Revision>,
    frames: RefCell<Vec<Frame>>,
    verifying: RefCell<Vec<NodeId>>,
    batch: RefCell<Option<PendingBatch>>,
    subscribers: RefCell<HashMap<NodeId, Vec<(u64, Callback)>>>,
    next_subscription: Flag<u64>,
}

/// A reactive state graph.
///
/// `Store` is a cheap-to-clone handle; clones share one graph. Stores are
/// independent of each other, and handles from one store panic when used
/// with another.
///
/// # Example
///
/// ```rust
/// use understory_reactive::{CellSpec, DerivationSpec, Store};
///
/// let store = Store::new();
/// let count = store.cell(CellSpec::new("count", 1_u32));
/// let doubled = store.derivation(DerivationSpec::new("doubled", move |ctx| {
///     Ok(ctx.get(&count)? * 2)
/// }));
///
/// assert_eq!(store.get(&doubled).unwrap(), 2);
/// store.update(&count, |c| c + 1);
/// assert_eq!(store.get(&doubled).unwrap(), 4);
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Rc<Inner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an empty store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates an empty store.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                id: StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed)),
                config,
                nodes: RefCell::new(Vec::new()),
                free: RefCell::new(Vec::new()),
                by_key: RefCell::new(HashMap::new()),
                families: RefCell::new(HashSet::new()),
                graph: RefCell::new(DepGraph::new()),
                scratch: RefCell::new(TraversalScratch::default()),
                revision: Flag::new(0),
                frames: RefCell::new(Vec::new()),
                verifying: RefCell::new(Vec::new()),
                batch: RefCell::new(None),
                subscribers: RefCell::new(HashMap::new()),
                next_subscription: Flag::new(0),
            }),
        }
    }

    /// Returns this store's identity.
    #[must_use]
    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns the current revision.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.inner.revision.get()
    }

    /// Returns the number of live nodes.
    ///
    /// Reset and evicted family instances are not counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.nodes.borrow().len() - self.inner.free.borrow().len()
    }

    /// Returns `true` if no nodes are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if both handles refer to the same store.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Looks up a live node by key.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<NodeId> {
        self.inner.by_key.borrow().get(key).copied()
    }

    /// Returns the registration key of a node.
    pub fn key<N: Readable>(&self, node: &N) -> Rc<str> {
        let id = self.resolve_ref(node.node_ref());
        self.key_of(id)
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Registers a cell.
    ///
    /// # Panics
    ///
    /// Panics if a live node with the same key is already registered.
    pub fn cell<T: Clone + PartialEq + 'static>(&self, spec: CellSpec<T>) -> Cell<T> {
        let (key, parts) = spec.erase();
        let node = self.register(
            key,
            SlotKind::Cell(CellSlot {
                parts,
                value: None,
            }),
        );
        Cell::from_ref(node)
    }

    /// Registers a derivation.
    ///
    /// # Panics
    ///
    /// Panics if a live node with the same key is already registered.
    pub fn derivation<T: Clone + PartialEq + 'static>(
        &self,
        spec: DerivationSpec<T>,
    ) -> Derivation<T> {
        let (key, parts) = spec.erase();
        let node = self.register(
            key,
            SlotKind::Derived(DerivedSlot {
                parts,
                state: DerivedState::Uncomputed,
                dirty: false,
                forced: false,
                verified_at: 0,
            }),
        );
        Derivation::from_ref(node)
    }

    fn register(&self, key: String, kind: SlotKind) -> NodeRef {
        let key: Rc<str> = Rc::from(key);
        let mut by_key = self.inner.by_key.borrow_mut();
        assert!(
            !by_key.contains_key(&key),
            "node `{key}` is already registered"
        );
        let mut nodes = self.inner.nodes.borrow_mut();
        let changed_at = self.revision();
        let (id, generation) = match self.inner.free.borrow_mut().pop() {
            Some(id) => {
                let slot = &mut nodes[id.index()];
                slot.key = key.clone();
                slot.changed_at = changed_at;
                slot.kind = kind;
                (id, slot.generation)
            }
            None => {
                let index = u32::try_from(nodes.len()).expect("too many nodes for NodeId (u32)");
                nodes.push(Slot {
                    key: key.clone(),
                    generation: 0,
                    changed_at,
                    kind,
                });
                (NodeId::new(index), 0)
            }
        };
        by_key.insert(key, id);
        NodeRef {
            store: self.inner.id,
            id,
            generation,
        }
    }

    /// Reserves a family key.
    ///
    /// # Panics
    ///
    /// Panics if a family with the same key is already registered.
    pub(crate) fn reserve_family(&self, key: &str) {
        let inserted = self.inner.families.borrow_mut().insert(Rc::from(key));
        assert!(inserted, "family `{key}` is already registered");
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Reads the current value of a node, recomputing first if it is dirty.
    ///
    /// Inside a derivation body the read is recorded as a dependency.
    /// Inside a batch, reads observe the last committed state.
    ///
    /// # Panics
    ///
    /// Panics if `node` belongs to another store.
    pub fn get<N: Readable>(&self, node: &N) -> Result<N::Value, ReadError> {
        let Some(id) = self.live(node.node_ref()) else {
            return Err(ReadError::Retired);
        };
        self.track(id);
        let value = self.read_erased(id)?;
        Ok(self.downcast::<N::Value>(id, &value))
    }

    /// Reads a node, awaiting suspensions until a value or a failure is
    /// available.
    pub async fn resolve<N: Readable>(&self, node: &N) -> Result<N::Value, ReadError> {
        loop {
            match self.get(node) {
                Err(ReadError::Suspended(suspension)) => suspension.await,
                other => return other,
            }
        }
    }

    /// Returns the status of a node without recomputing it.
    pub fn status<N: Readable>(&self, node: &N) -> NodeStatus {
        let Some(id) = self.live(node.node_ref()) else {
            return NodeStatus::Retired;
        };
        let nodes = self.inner.nodes.borrow();
        match &nodes[id.index()].kind {
            SlotKind::Vacant => NodeStatus::Retired,
            SlotKind::Cell(_) => NodeStatus::Clean,
            SlotKind::Derived(d) => match &d.state {
                DerivedState::Computing => NodeStatus::Computing,
                DerivedState::Uncomputed => NodeStatus::Dirty,
                _ if d.dirty || d.forced => NodeStatus::Dirty,
                DerivedState::Ready(Ok(_)) => NodeStatus::Clean,
                DerivedState::Ready(Err(ReadError::Suspended(_))) => NodeStatus::Pending,
                DerivedState::Ready(Err(_)) => NodeStatus::Error,
            },
        }
    }

    fn track(&self, id: NodeId) {
        if let Some(frame) = self.inner.frames.borrow_mut().last_mut() {
            frame.reads.push(id);
        }
    }

    fn read_erased(&self, id: NodeId) -> Result<ErasedValue, ReadError> {
        if self.is_cell(id) {
            return Ok(self.cell_value(id));
        }
        if self.is_computing(id) {
            return Err(self.cycle_error(id).into());
        }
        self.refresh(id);
        let nodes = self.inner.nodes.borrow();
        match &nodes[id.index()].kind {
            SlotKind::Derived(DerivedSlot {
                state: DerivedState::Ready(result),
                ..
            }) => result.clone(),
            _ => unreachable!("refresh leaves a derivation ready"),
        }
    }

    fn cell_value(&self, id: NodeId) -> ErasedValue {
        self.ensure_cell_init(id);
        let nodes = self.inner.nodes.borrow();
        match &nodes[id.index()].kind {
            SlotKind::Cell(CellSlot {
                value: Some(value), ..
            }) => value.clone(),
            _ => unreachable!("cell initialized above"),
        }
    }

    /// Runs init effects (or the default) the first time a cell is touched.
    fn ensure_cell_init(&self, id: NodeId) {
        let (key, default, effects) = {
            let nodes = self.inner.nodes.borrow();
            let slot = &nodes[id.index()];
            match &slot.kind {
                SlotKind::Cell(cell) if cell.value.is_none() => (
                    slot.key.clone(),
                    cell.parts.default.clone(),
                    cell.parts.effects.clone(),
                ),
                _ => return,
            }
        };
        let mut value = None;
        for effect in effects.iter() {
            if let Some(v) = effect.init(&key) {
                value = Some(v);
            }
        }
        let value = value.unwrap_or_else(|| default());
        let mut nodes = self.inner.nodes.borrow_mut();
        if let SlotKind::Cell(cell) = &mut nodes[id.index()].kind
            && cell.value.is_none()
        {
            cell.value = Some(value);
        }
    }

    /// Brings a derivation up to date.
    fn refresh(&self, id: NodeId) {
        let verified_at = {
            let nodes = self.inner.nodes.borrow();
            let SlotKind::Derived(d) = &nodes[id.index()].kind else {
                return;
            };
            match d.state {
                DerivedState::Computing => return,
                DerivedState::Uncomputed => None,
                DerivedState::Ready(_) if d.forced => None,
                DerivedState::Ready(_) if !d.dirty => return,
                DerivedState::Ready(_) => Some(d.verified_at),
            }
        };
        let Some(verified_at) = verified_at else {
            self.recompute(id);
            return;
        };

        let deps = self.inner.graph.borrow().dependencies(id).to_vec();
        self.inner.verifying.borrow_mut().push(id);
        let stale = deps
            .into_iter()
            .any(|dep| self.changed_since(dep, verified_at));
        self.inner.verifying.borrow_mut().pop();
        if stale {
            self.recompute(id);
            return;
        }

        let revision = self.revision();
        if let SlotKind::Derived(d) = &mut self.inner.nodes.borrow_mut()[id.index()].kind {
            d.dirty = false;
            d.verified_at = revision;
        }
        trace!(node = %self.key_of(id), "revalidated without recompute");
    }

    fn changed_since(&self, dep: NodeId, since: Revision) -> bool {
        if self.is_computing(dep) || self.inner.verifying.borrow().contains(&dep) {
            // A recorded cycle; recomputing will surface it.
            return true;
        }
        self.refresh(dep);
        self.inner.nodes.borrow()[dep.index()].changed_at > since
    }

    fn recompute(&self, id: NodeId) {
        let (key, body, equals, previous) = {
            let mut nodes = self.inner.nodes.borrow_mut();
            let slot = &mut nodes[id.index()];
            let SlotKind::Derived(d) = &mut slot.kind else {
                return;
            };
            let previous = core::mem::replace(&mut d.state, DerivedState::Computing);
            (
                slot.key.clone(),
                d.parts.body.clone(),
                d.parts.equals.clone(),
                previous,
            )
        };

        trace!(node = %key, "recomputing");
        self.inner.frames.borrow_mut().push(Frame {
            node: id,
            reads: Vec::new(),
        });
        let result = body(&Ctx::new(self)).map_err(|e| e.with_origin(&key));
        let reads = self
            .inner
            .frames
            .borrow_mut()
            .pop()
            .map(|frame| frame.reads)
            .unwrap_or_default();
        self.inner.graph.borrow_mut().replace_dependencies(id, reads);

        let changed = match (&previous, &result) {
            (DerivedState::Ready(Ok(old)), Ok(new)) => !equals(old, new),
            _ => true,
        };
        if let Err(error) = &result
            && !error.is_suspended()
        {
            debug!(node = %key, %error, "derivation failed");
        }

        let revision = self.revision();
        let mut nodes = self.inner.nodes.borrow_mut();
        let slot = &mut nodes[id.index()];
        if changed {
            slot.changed_at = revision;
        } else {
            trace!(node = %key, "recomputed an equal value");
        }
        if let SlotKind::Derived(d) = &mut slot.kind {
            d.state = if changed {
                DerivedState::Ready(result)
            } else {
                previous
            };
            d.dirty = false;
            d.forced = false;
            d.verified_at = revision;
        }
    }

    fn cycle_error(&self, id: NodeId) -> CycleError {
        let frames = self.inner.frames.borrow();
        let nodes = self.inner.nodes.borrow();
        let start = frames.iter().position(|f| f.node == id).unwrap_or(0);
        let mut path: Vec<String> = frames[start..]
            .iter()
            .map(|f| nodes[f.node.index()].key.to_string())
            .collect();
        path.push(nodes[id.index()].key.to_string());
        debug!(cycle = ?path, "dependency cycle detected");
        CycleError::new(path)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Writes a cell.
    ///
    /// Outside a batch the write commits immediately. A value equal to the
    /// current one under the cell's comparator is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called while a derivation body is running.
    pub fn set<T: 'static>(&self, cell: &Cell<T>, value: T) {
        let id = self.resolve_ref(cell.node());
        self.stage(id, ErasedValue::new(value));
    }

    /// Writes a cell from its current value.
    ///
    /// Inside a batch, `f` sees the value staged earlier in the same batch.
    pub fn update<T: Clone + 'static>(&self, cell: &Cell<T>, f: impl FnOnce(&T) -> T) {
        let id = self.resolve_ref(cell.node());
        let staged = self.inner.batch.borrow().as_ref().and_then(|b| b.get(id));
        let current = staged.unwrap_or_else(|| self.cell_value(id));
        let current = self.downcast::<T>(id, &current);
        self.stage(id, ErasedValue::new(f(&current)));
    }

    /// Writes a cell back to its default value.
    pub fn reset<T: 'static>(&self, cell: &Cell<T>) {
        let id = self.resolve_ref(cell.node());
        let default = match &self.inner.nodes.borrow()[id.index()].kind {
            SlotKind::Cell(c) => c.parts.default.clone(),
            _ => unreachable!("cell handles point at cells"),
        };
        self.stage(id, default());
    }

    /// Writes through a writable derivation.
    ///
    /// The setter runs inside a batch, so all of its upstream writes commit
    /// together.
    ///
    /// # Panics
    ///
    /// Panics if the derivation was registered without a setter.
    pub fn set_derived<T: 'static>(&self, node: &Derivation<T>, value: T) {
        let id = self.resolve_ref(node.node());
        let setter = match &self.inner.nodes.borrow()[id.index()].kind {
            SlotKind::Derived(d) => d.parts.setter.clone(),
            _ => None,
        };
        let Some(setter) = setter else {
            panic!("derivation `{}` is not writable", self.key_of(id));
        };
        let Some(setter) = setter.downcast_ref::<SetterFn<T>>() else {
            panic!(
                "derivation `{}` does not accept a `{}`",
                self.key_of(id),
                type_name::<T>()
            );
        };
        self.batch(|store| setter(store, value));
    }

    /// Drops the cached value of a derivation and dirties its dependents.
    ///
    /// Invalidating a retired family instance does nothing.
    pub fn invalidate<T>(&self, node: &Derivation<T>) {
        let Some(id) = self.live(node.node()) else {
            return;
        };
        self.invalidate_nodes(&[id]);
    }

    /// Runs `f` as one batch.
    ///
    /// Writes issued inside `f` (including through writable derivations) are
    /// staged and committed together when the outermost batch returns, so no
    /// reader ever observes a subset of them. Nested calls join the
    /// enclosing batch.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let outermost = {
            let mut batch = self.inner.batch.borrow_mut();
            if batch.is_none() {
                *batch = Some(PendingBatch::default());
                true
            } else {
                false
            }
        };
        let out = f(self);
        if outermost {
            let pending = self.inner.batch.borrow_mut().take().unwrap_or_default();
            self.commit(pending);
        }
        out
    }

    /// Returns `true` while a batch is open.
    #[must_use]
    pub fn in_batch(&self) -> bool {
        self.inner.batch.borrow().is_some()
    }

    fn stage(&self, id: NodeId, value: ErasedValue) {
        assert!(
            self.inner.frames.borrow().is_empty(),
            "cannot write `{}` while a derivation is computing",
            self.key_of(id)
        );
        {
            let mut batch = self.inner.batch.borrow_mut();
            if let Some(pending) = batch.as_mut() {
                pending.stage(id, value);
                return;
            }
        }
        self.batch(|store| store.stage(id, value));
    }

    fn commit(&self, pending: PendingBatch) {
        if pending.writes.is_empty() {
            return;
        }
        let revision = self.revision() + 1;
        let mut changed = Vec::new();
        let mut effects = Vec::new();
        for (id, value) in pending.writes {
            self.ensure_cell_init(id);
            let (equals, current) = {
                let nodes = self.inner.nodes.borrow();
                let SlotKind::Cell(cell) = &nodes[id.index()].kind else {
                    continue;
                };
                (cell.parts.equals.clone(), cell.value.clone())
            };
            if let Some(current) = &current
                && equals(current, &value)
            {
                continue;
            }
            let mut nodes = self.inner.nodes.borrow_mut();
            let slot = &mut nodes[id.index()];
            slot.changed_at = revision;
            if let SlotKind::Cell(cell) = &mut slot.kind {
                cell.value = Some(value.clone());
                if !cell.parts.effects.is_empty() {
                    effects.push((slot.key.clone(), cell.parts.effects.clone(), value));
                }
            }
            changed.push(id);
        }
        if changed.is_empty() {
            trace!("batch committed without changes");
            return;
        }

        self.inner.revision.set(revision);
        let dirtied = self.mark_dependents(&changed);
        debug!(
            revision,
            writes = changed.len(),
            dirtied = dirtied.len(),
            "committed batch"
        );
        for (key, effects, value) in effects {
            for effect in effects.iter() {
                effect.on_write(&key, &value);
            }
        }
        self.notify(&changed, &dirtied);
    }

    /// Marks every transitive dependent of `roots` dirty.
    fn mark_dependents(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let graph = self.inner.graph.borrow();
        let mut scratch = self.inner.scratch.borrow_mut();
        let mut nodes = self.inner.nodes.borrow_mut();
        let mut dirtied = Vec::new();
        graph.for_each_transitive_dependent(roots, &mut scratch, |id| {
            if let SlotKind::Derived(d) = &mut nodes[id.index()].kind {
                d.dirty = true;
            }
            dirtied.push(id);
        });
        dirtied
    }

    /// Drops cached state of `roots` and dirties their dependents as one
    /// change.
    fn invalidate_nodes(&self, roots: &[NodeId]) {
        let revision = self.revision() + 1;
        self.inner.revision.set(revision);
        {
            let mut nodes = self.inner.nodes.borrow_mut();
            for root in roots {
                let slot = &mut nodes[root.index()];
                if let SlotKind::Derived(d) = &mut slot.kind
                    && !matches!(d.state, DerivedState::Computing)
                {
                    d.state = DerivedState::Uncomputed;
                    d.dirty = false;
                    slot.changed_at = revision;
                }
            }
        }
        let dirtied = self.mark_dependents(roots);
        debug!(revision, roots = roots.len(), dirtied = dirtied.len(), "invalidated");
        self.notify(roots, &dirtied);
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Registers `callback` to run after a committed change to `node`.
    ///
    /// For derivations, the callback fires only when the recomputed value
    /// (or error) differs from the previous one. Subscribing evaluates the
    /// derivation so its dependencies are wired up.
    pub fn subscribe<N: Readable>(
        &self,
        node: &N,
        callback: impl Fn(&Self) + 'static,
    ) -> Subscription {
        let id = self.resolve_ref(node.node_ref());
        let sub = self.inner.next_subscription.get() + 1;
        self.inner.next_subscription.set(sub);
        self.inner
            .subscribers
            .borrow_mut()
            .entry(id)
            .or_default()
            .push((sub, Rc::new(callback)));
        if !self.is_cell(id) && !self.is_computing(id) {
            let _ = self.read_erased(id);
        }
        Subscription {
            store: Rc::downgrade(&self.inner),
            node: id,
            id: sub,
        }
    }

    /// Returns the number of subscribers of `node`.
    pub fn subscriber_count<N: Readable>(&self, node: &N) -> usize {
        let Some(id) = self.live(node.node_ref()) else {
            return 0;
        };
        self.inner
            .subscribers
            .borrow()
            .get(&id)
            .map_or(0, Vec::len)
    }

    fn unsubscribe(&self, node: NodeId, sub: u64) -> bool {
        let (removed, now_empty) = {
            let mut subs = self.inner.subscribers.borrow_mut();
            let Some(list) = subs.get_mut(&node) else {
                return false;
            };
            let before = list.len();
            list.retain(|(s, _)| *s != sub);
            let removed = list.len() != before;
            let empty = list.is_empty();
            if empty {
                subs.remove(&node);
            }
            (removed, empty)
        };
        if removed && now_empty && self.inner.config.release_unobserved {
            self.release(node);
        }
        removed
    }

    /// Runs callbacks of subscribed nodes touched by a change.
    fn notify(&self, changed: &[NodeId], dirtied: &[NodeId]) {
        if !self.inner.frames.borrow().is_empty() {
            return;
        }
        let mut targets: Vec<(NodeId, Vec<Callback>)> = {
            let subs = self.inner.subscribers.borrow();
            if subs.is_empty() {
                return;
            }
            changed
                .iter()
                .chain(dirtied)
                .filter_map(|id| {
                    subs.get(id)
                        .map(|list| (*id, list.iter().map(|(_, cb)| cb.clone()).collect()))
                })
                .collect()
        };
        targets.sort_by_key(|(id, _)| *id);
        targets.dedup_by_key(|(id, _)| *id);

        for (id, callbacks) in targets {
            let fire = if self.is_cell(id) {
                true
            } else {
                let before = self.changed_at(id);
                let _ = self.read_erased(id);
                self.changed_at(id) != before
            };
            if fire {
                for callback in &callbacks {
                    callback(self);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Returns `true` if the node has subscribers or dependents, or is in
    /// use by a computation or revalidation in progress.
    pub(crate) fn is_observed(&self, id: NodeId) -> bool {
        self.inner
            .subscribers
            .borrow()
            .get(&id)
            .is_some_and(|list| !list.is_empty())
            || self.inner.graph.borrow().has_dependents(id)
            || self.inner.verifying.borrow().contains(&id)
            || self
                .inner
                .frames
                .borrow()
                .iter()
                .any(|frame| frame.node == id || frame.reads.contains(&id))
    }

    /// Drops the cache of an unobserved derivation, cascading upstream.
    fn release(&self, id: NodeId) {
        if self.is_observed(id) {
            return;
        }
        {
            let mut nodes = self.inner.nodes.borrow_mut();
            let SlotKind::Derived(d) = &mut nodes[id.index()].kind else {
                return;
            };
            if matches!(d.state, DerivedState::Computing) {
                return;
            }
            d.state = DerivedState::Uncomputed;
            d.dirty = false;
        }
        let deps = self.inner.graph.borrow_mut().clear_dependencies(id);
        trace!(node = %self.key_of(id), "released unobserved derivation");
        for dep in deps {
            self.release(dep);
        }
    }

    /// Unregisters a derivation and frees its slot for reuse.
    ///
    /// Subscribers are detached and transitive dependents dirtied. Direct
    /// dependents lose their edge to the node, so they recompute on their
    /// next read instead of revalidating. Handles to the node read as
    /// [`ReadError::Retired`] afterwards.
    pub(crate) fn retire(&self, id: NodeId) {
        self.inner.subscribers.borrow_mut().remove(&id);
        let key = self.key_of(id);
        self.inner.by_key.borrow_mut().remove(&key);
        if self.is_computing(id) {
            // Still on the stack; keep the slot, only the key is released.
            debug!(node = %key, "retired while computing");
            return;
        }

        let revision = self.revision() + 1;
        self.inner.revision.set(revision);
        let dirtied = self.mark_dependents(&[id]);
        let dependents = {
            let mut graph = self.inner.graph.borrow_mut();
            graph.clear_dependencies(id);
            graph.detach_dependents(id)
        };
        let freed = {
            let mut nodes = self.inner.nodes.borrow_mut();
            for dependent in dependents {
                if let SlotKind::Derived(d) = &mut nodes[dependent.index()].kind {
                    d.forced = true;
                }
            }
            let slot = &mut nodes[id.index()];
            slot.key = Rc::from("");
            slot.generation = slot.generation.wrapping_add(1);
            slot.changed_at = revision;
            core::mem::replace(&mut slot.kind, SlotKind::Vacant)
        };
        // The body and its captures may own handles of their own.
        drop(freed);
        self.inner.free.borrow_mut().push(id);
        debug!(node = %key, dirtied = dirtied.len(), "retired");
        self.notify(&[], &dirtied);
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Returns the node ID of a live handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to another store or was retired.
    pub(crate) fn resolve_ref(&self, node: NodeRef) -> NodeId {
        match self.live(node) {
            Some(id) => id,
            None => panic!("node handle was retired"),
        }
    }

    /// Returns the node ID of a handle, or `None` if it was retired.
    fn live(&self, node: NodeRef) -> Option<NodeId> {
        assert_eq!(
            node.store, self.inner.id,
            "node handle belongs to a different store"
        );
        let nodes = self.inner.nodes.borrow();
        let slot = &nodes[node.id.index()];
        (slot.generation == node.generation && !matches!(slot.kind, SlotKind::Vacant))
            .then_some(node.id)
    }

    fn key_of(&self, id: NodeId) -> Rc<str> {
        self.inner.nodes.borrow()[id.index()].key.clone()
    }

    fn changed_at(&self, id: NodeId) -> Revision {
        self.inner.nodes.borrow()[id.index()].changed_at
    }

    fn is_cell(&self, id: NodeId) -> bool {
        matches!(self.inner.nodes.borrow()[id.index()].kind, SlotKind::Cell(_))
    }

    fn is_computing(&self, id: NodeId) -> bool {
        matches!(
            self.inner.nodes.borrow()[id.index()].kind,
            SlotKind::Derived(DerivedSlot {
                state: DerivedState::Computing,
                ..
            })
        )
    }

    fn downcast<T: Clone + 'static>(&self, id: NodeId, value: &ErasedValue) -> T {
        match value.downcast_ref::<T>() {
            Some(v) => v.clone(),
            None => panic!(
                "node `{}` does not hold a `{}`",
                self.key_of(id),
                type_name::<T>()
            ),
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("nodes", &self.len())
            .field("revision", &self.inner.revision.get())
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`Store::subscribe`].
///
/// Dropping the handle leaves the callback registered.
#[must_use = "call `unsubscribe` to remove the callback"]
pub struct Subscription {
    store: Weak<Inner>,
    node: NodeId,
    id: u64,
}

impl Subscription {
    /// Returns the subscribed node.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Removes the callback.
    ///
    /// Returns `false` if it was already removed or the store is gone.
    pub fn unsubscribe(self) -> bool {
        match self.store.upgrade() {
            Some(inner) => Store { inner }.unsubscribe(self.node, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("node", &self.node)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputationError;
    use std::cell::Cell as Counter;

    #[test]
    fn equal_write_does_not_dirty_dependents() {
        let store = Store::new();
        let a = store.cell(CellSpec::new("a", 1_u32));
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let d = store.derivation(DerivationSpec::new("d", move |ctx| {
            r.set(r.get() + 1);
            ctx.get(&a)
        }));

        assert_eq!(store.get(&d).unwrap(), 1);
        store.set(&a, 1);
        assert_eq!(store.status(&d), NodeStatus::Clean);
        assert_eq!(store.revision(), 0);
        assert_eq!(store.get(&d).unwrap(), 1);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn write_dirties_transitively_without_recomputing() {
        let store = Store::new();
        let a = store.cell(CellSpec::new("a", 1_i32));
        let b = store.derivation(DerivationSpec::new("b", move |ctx| Ok(ctx.get(&a)? + 1)));
        let c = store.derivation(DerivationSpec::new("c", move |ctx| Ok(ctx.get(&b)? * 10)));

        assert_eq!(store.get(&c).unwrap(), 20);
        store.set(&a, 5);
        assert_eq!(store.status(&b), NodeStatus::Dirty);
        assert_eq!(store.status(&c), NodeStatus::Dirty);
        assert_eq!(store.get(&c).unwrap(), 60);
        assert_eq!(store.status(&b), NodeStatus::Clean);
    }

    #[test]
    fn early_cutoff_skips_downstream_recompute() {
        let store = Store::new();
        let n = store.cell(CellSpec::new("n", 2_i32));
        let parity = store.derivation(DerivationSpec::new("parity", move |ctx| {
            Ok(ctx.get(&n)? % 2 == 0)
        }));
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let label = store.derivation(DerivationSpec::new("label", move |ctx| {
            r.set(r.get() + 1);
            Ok(if ctx.get(&parity)? { "even" } else { "odd" })
        }));

        assert_eq!(store.get(&label).unwrap(), "even");
        store.set(&n, 4);
        assert_eq!(store.get(&label).unwrap(), "even");
        assert_eq!(runs.get(), 1);
        store.set(&n, 5);
        assert_eq!(store.get(&label).unwrap(), "odd");
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dependencies_are_retracked_on_each_run() {
        let store = Store::new();
        let use_left = store.cell(CellSpec::new("use_left", true));
        let left = store.cell(CellSpec::new("left", 1_u8));
        let right = store.cell(CellSpec::new("right", 2_u8));
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let pick = store.derivation(DerivationSpec::new("pick", move |ctx| {
            r.set(r.get() + 1);
            if ctx.get(&use_left)? {
                ctx.get(&left)
            } else {
                ctx.get(&right)
            }
        }));

        assert_eq!(store.get(&pick).unwrap(), 1);
        // `right` was not read, so writing it leaves `pick` clean.
        store.set(&right, 7);
        assert_eq!(store.status(&pick), NodeStatus::Clean);

        store.set(&use_left, false);
        assert_eq!(store.get(&pick).unwrap(), 7);
        store.set(&left, 9);
        assert_eq!(store.status(&pick), NodeStatus::Clean);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn errors_are_cached_until_a_dependency_changes() {
        let store = Store::new();
        let divisor = store.cell(CellSpec::new("divisor", 0_i32));
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let quotient = store.derivation(DerivationSpec::new("quotient", move |ctx| {
            r.set(r.get() + 1);
            let d = ctx.get(&divisor)?;
            if d == 0 {
                return Err(ComputationError::new("division by zero").into());
            }
            Ok(100 / d)
        }));

        let err = store.get(&quotient).unwrap_err();
        let ReadError::Computation(e) = &err else {
            panic!("expected computation error, got {err:?}");
        };
        assert_eq!(e.origin(), Some("quotient"));
        assert_eq!(store.status(&quotient), NodeStatus::Error);
        assert!(store.get(&quotient).is_err());
        assert_eq!(runs.get(), 1);

        store.set(&divisor, 4);
        assert_eq!(store.get(&quotient).unwrap(), 25);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn self_cycle_is_reported_on_first_read() {
        let store = Store::new();
        let slot: Rc<Counter<Option<Derivation<u32>>>> = Rc::new(Counter::new(None));
        let s = slot.clone();
        let looped = store.derivation(DerivationSpec::new("looped", move |ctx| {
            let me = s.get().expect("handle installed before first read");
            Ok(ctx.get(&me)? + 1)
        }));
        slot.set(Some(looped));

        let err = store.get(&looped).unwrap_err();
        let ReadError::Cycle(cycle) = err else {
            panic!("expected a cycle error");
        };
        assert_eq!(cycle.path(), &["looped".to_string(), "looped".to_string()]);
    }

    #[test]
    fn mutual_cycle_reports_full_path() {
        let store = Store::new();
        let slot: Rc<Counter<Option<Derivation<u32>>>> = Rc::new(Counter::new(None));
        let s = slot.clone();
        let a = store.derivation(DerivationSpec::new("a", move |ctx| {
            ctx.get(&s.get().expect("b installed"))
        }));
        let b = store.derivation(DerivationSpec::new("b", move |ctx| ctx.get(&a)));
        slot.set(Some(b));

        match store.get(&a) {
            Err(ReadError::Cycle(cycle)) => {
                assert_eq!(cycle.path(), &["a".to_string(), "b".to_string(), "a".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(store.status(&b), NodeStatus::Error);
    }

    #[test]
    fn batch_reads_see_committed_state() {
        let store = Store::new();
        let a = store.cell(CellSpec::new("a", 1_u32));
        store.batch(|s| {
            s.set(&a, 2);
            assert_eq!(s.get(&a).unwrap(), 1);
            s.update(&a, |v| v + 10);
        });
        assert_eq!(store.get(&a).unwrap(), 12);
        assert_eq!(store.revision(), 1);
    }

    #[test]
    #[should_panic(expected = "while a derivation is computing")]
    fn writing_inside_a_body_panics() {
        let store = Store::new();
        let a = store.cell(CellSpec::new("a", 1_u32));
        let d = store.derivation(DerivationSpec::new("d", move |ctx| {
            ctx.store().set(&a, 2);
            Ok(0_u32)
        }));
        let _ = store.get(&d);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_keys_panic() {
        let store = Store::new();
        let _ = store.cell(CellSpec::new("a", 1_u32));
        let _ = store.cell(CellSpec::new("a", 2_u32));
    }

    #[test]
    #[should_panic(expected = "different store")]
    fn foreign_handles_panic() {
        let one = Store::new();
        let two = Store::new();
        let a = one.cell(CellSpec::new("a", 1_u32));
        let _ = two.get(&a);
    }

    #[test]
    fn subscribers_fire_only_on_value_change() {
        let store = Store::new();
        let n = store.cell(CellSpec::new("n", 1_i32));
        let sign = store.derivation(DerivationSpec::new("sign", move |ctx| {
            Ok(ctx.get(&n)?.signum())
        }));
        let fired = Rc::new(Counter::new(0));
        let f = fired.clone();
        let sub = store.subscribe(&sign, move |_| f.set(f.get() + 1));

        store.set(&n, 2);
        assert_eq!(fired.get(), 0);
        store.set(&n, -3);
        assert_eq!(fired.get(), 1);
        assert_eq!(store.subscriber_count(&sign), 1);

        assert!(sub.unsubscribe());
        store.set(&n, 3);
        assert_eq!(fired.get(), 1);
        assert_eq!(store.subscriber_count(&sign), 0);
    }

    #[test]
    fn unobserved_derivations_are_released() {
        let store = Store::new();
        let n = store.cell(CellSpec::new("n", 1_i32));
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let d = store.derivation(DerivationSpec::new("d", move |ctx| {
            r.set(r.get() + 1);
            ctx.get(&n)
        }));
        let sub = store.subscribe(&d, |_| {});
        assert_eq!(store.get(&d).unwrap(), 1);
        assert!(sub.unsubscribe());
        assert_eq!(store.status(&d), NodeStatus::Dirty);

        // Released: writes no longer reach it, and the next read recomputes.
        store.set(&n, 2);
        assert_eq!(store.get(&d).unwrap(), 2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn invalidate_forces_recompute() {
        let store = Store::new();
        let runs = Rc::new(Counter::new(0));
        let r = runs.clone();
        let d = store.derivation(DerivationSpec::new("d", move |_| {
            r.set(r.get() + 1);
            Ok(r.get())
        }));
        assert_eq!(store.get(&d).unwrap(), 1);
        store.invalidate(&d);
        assert_eq!(store.get(&d).unwrap(), 2);
    }

    #[test]
    fn reset_restores_default() {
        let store = Store::new();
        let a = store.cell(CellSpec::with_default_fn("a", || String::from("fresh")));
        store.set(&a, String::from("edited"));
        store.reset(&a);
        assert_eq!(store.get(&a).unwrap(), "fresh");
    }
}
