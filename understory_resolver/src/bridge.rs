// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Queries backed by a [`DataSource`].

use core::fmt;
use std::cell::{Cell as Flag, RefCell};
use std::rc::{Rc, Weak};

use futures::FutureExt;
use futures::future::join_all;
use hashbrown::HashMap;
use serde_json::Value;
use tracing::debug;
use understory_reactive::{
    CanonicalKey, Cell, CellSpec, ComputationError, Ctx, Derivation, DerivationSpec, ReadError,
    Store, Suspension,
};

use crate::config::BridgeConfig;
use crate::error::FetchError;
use crate::normalize::{Normalized, RecordId, normalize};
use crate::records::RecordStore;
use crate::request::{DataSource, Request};
use crate::task::{ResolveTask, TaskOutcome};

/// Reactive state of one query.
#[derive(Clone, Debug, PartialEq)]
enum Phase {
    /// Nothing fetched yet, or invalidated.
    Idle,
    /// A refetch is in flight and the old value is not retained.
    Loading,
    Resolved(Normalized),
    Failed(FetchError),
}

struct QueryState {
    request: Request,
    key: Rc<str>,
    phase: Cell<Phase>,
    /// Generation of the most recently issued fetch.
    latest: Flag<u64>,
    inflight: RefCell<Option<ResolveTask>>,
}

struct BridgeInner {
    store: Store,
    source: Box<dyn DataSource>,
    config: BridgeConfig,
    records: RecordStore,
    queries: RefCell<HashMap<CanonicalKey, (Rc<QueryState>, Query)>>,
    tasks: RefCell<Vec<ResolveTask>>,
}

/// Connects a [`DataSource`] to a [`Store`].
///
/// Every distinct request becomes one derivation producing the response as
/// JSON. Entities in responses are normalized into a record store shared by
/// all queries of the bridge, so queries touching the same entity observe
/// the same values and local [`patch`](Self::patch)es.
///
/// Fetches run only while something polls them: await a read with
/// [`Store::resolve`], or drive everything in flight with
/// [`settle`](Self::settle).
#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

/// Handle to one request's derivation.
#[derive(Clone, Debug)]
pub struct Query {
    key: CanonicalKey,
    node: Derivation<Value>,
}

impl Query {
    /// Returns the derivation producing the response.
    #[must_use]
    pub fn node(&self) -> Derivation<Value> {
        self.node
    }

    /// Returns the canonical key of the request.
    #[must_use]
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }
}

impl Bridge {
    /// Creates a bridge feeding `store`.
    pub fn new(store: &Store, source: impl DataSource + 'static, config: BridgeConfig) -> Self {
        Self {
            inner: Rc::new(BridgeInner {
                store: store.clone(),
                source: Box::new(source),
                config,
                records: RecordStore::default(),
                queries: RefCell::new(HashMap::new()),
                tasks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Returns the store this bridge writes to.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Returns the query for `operation` with `variables`, registering it on
    /// first use.
    ///
    /// The first read of [`Query::node`] issues the fetch and suspends.
    pub fn request(&self, operation: impl Into<String>, variables: Value) -> Query {
        let request = Request::new(operation, variables);
        let key = request.key();
        if let Some((_, query)) = self.inner.queries.borrow().get(&key) {
            return query.clone();
        }

        let node_key: Rc<str> = Rc::from(format!("query:{key}"));
        let phase = self
            .inner
            .store
            .cell(CellSpec::new(format!("{node_key}#phase"), Phase::Idle));
        let state = Rc::new(QueryState {
            request,
            key: node_key.clone(),
            phase,
            latest: Flag::new(0),
            inflight: RefCell::new(None),
        });
        let weak = Rc::downgrade(&self.inner);
        let body_state = state.clone();
        let node = self.inner.store.derivation(DerivationSpec::new(
            node_key.to_string(),
            move |ctx| read_query(ctx, &weak, &body_state),
        ));
        let query = Query {
            key: key.clone(),
            node,
        };
        self.inner
            .queries
            .borrow_mut()
            .insert(key, (state, query.clone()));
        query
    }

    /// Issues a newer fetch for `query`, cancelling any older one.
    ///
    /// With [`BridgeConfig::retain_on_refetch`] the previous value stays
    /// readable until the new response is applied.
    pub fn refetch(&self, query: &Query) -> ResolveTask {
        let state = self.state(query);
        let task = issue(&self.inner, &state);
        let keep = self.inner.config.retain_on_refetch
            && matches!(self.inner.store.get(&state.phase), Ok(Phase::Resolved(_)));
        if keep {
            // Readers holding the old suspension must pick up the new one.
            self.inner.store.invalidate(&query.node);
        } else {
            self.inner.store.set(&state.phase, Phase::Loading);
            self.inner.store.invalidate(&query.node);
        }
        task
    }

    /// Drops the resolved value of `query` and cancels any fetch in flight.
    ///
    /// The next read issues a new fetch.
    pub fn invalidate(&self, query: &Query) {
        let state = self.state(query);
        state.latest.set(state.latest.get() + 1);
        if let Some(task) = state.inflight.borrow_mut().take() {
            task.token().cancel();
        }
        self.inner.store.set(&state.phase, Phase::Idle);
        self.inner.store.invalidate(&query.node);
        debug!(query = %state.key, "invalidated query");
    }

    /// Replaces one field of a canonical record.
    ///
    /// Every derivation that read that field is invalidated; other fields of
    /// the record are untouched. Returns `false` (and writes nothing) if the
    /// record does not exist.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a derivation body.
    pub fn patch(&self, id: &RecordId, field: &str, value: Value) -> bool {
        self.inner.records.patch(&self.inner.store, id, field, &value)
    }

    /// Deletes a canonical record. References to it read as `null`.
    pub fn delete_record(&self, id: &RecordId) -> bool {
        self.inner.records.delete(&self.inner.store, id)
    }

    /// Reads one field of a record, tracked as a dependency when called from
    /// a derivation body.
    pub fn field(&self, id: &RecordId, field: &str) -> Result<Option<Value>, ReadError> {
        self.inner.records.field(&self.inner.store, id, field)
    }

    /// Reads a whole record with references resolved.
    pub fn record(&self, id: &RecordId) -> Result<Option<Value>, ReadError> {
        self.inner.records.record(&self.inner.store, id)
    }

    /// Returns the number of fetches that may still apply a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .tasks
            .borrow()
            .iter()
            .filter(|task| task.is_pending())
            .count()
    }

    /// Drives every fetch in flight to completion.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<ResolveTask> = {
                let mut tasks = self.inner.tasks.borrow_mut();
                tasks.retain(ResolveTask::is_pending);
                tasks.clone()
            };
            if pending.is_empty() {
                return;
            }
            join_all(pending).await;
        }
    }

    fn state(&self, query: &Query) -> Rc<QueryState> {
        match self.inner.queries.borrow().get(&query.key) {
            Some((state, _)) => state.clone(),
            None => panic!("query `{}` belongs to a different bridge", query.key),
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.inner.config)
            .field("queries", &self.inner.queries.borrow().len())
            .field("records", &self.inner.records.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

fn read_query(
    ctx: &Ctx<'_>,
    bridge: &Weak<BridgeInner>,
    state: &Rc<QueryState>,
) -> Result<Value, ReadError> {
    let Some(inner) = bridge.upgrade() else {
        return Err(ComputationError::new("resolver bridge was dropped").into());
    };
    match ctx.get(&state.phase)? {
        Phase::Resolved(root) => inner.records.materialize(ctx.store(), &root, &mut Vec::new()),
        Phase::Failed(error) => Err(ComputationError::with_source(error).into()),
        Phase::Idle | Phase::Loading => {
            let inflight = state.inflight.borrow().clone();
            let task = match inflight {
                Some(task) => task,
                None => issue(&inner, state),
            };
            Err(Suspension::new(state.key.clone(), task.map(drop)).into())
        }
    }
}

/// Starts a new generation for `state`, cancelling the previous one.
fn issue(inner: &Rc<BridgeInner>, state: &Rc<QueryState>) -> ResolveTask {
    let generation = state.latest.get() + 1;
    state.latest.set(generation);
    if let Some(old) = state.inflight.borrow_mut().take() {
        old.token().cancel();
    }

    let fetch = inner.source.fetch(&state.request);
    let weak = Rc::downgrade(inner);
    let target = state.clone();
    let task = ResolveTask::spawn(generation, fetch, move |result| match weak.upgrade() {
        Some(inner) => apply(&inner, &target, generation, result),
        None => TaskOutcome::Cancelled,
    });
    *state.inflight.borrow_mut() = Some(task.clone());
    {
        let mut tasks = inner.tasks.borrow_mut();
        tasks.retain(ResolveTask::is_pending);
        tasks.push(task.clone());
    }
    debug!(query = %state.key, generation, "issued fetch");
    task
}

/// Writes a response into the store if it belongs to the latest generation.
fn apply(
    inner: &BridgeInner,
    state: &QueryState,
    generation: u64,
    result: Result<Value, FetchError>,
) -> TaskOutcome {
    let latest = state.latest.get();
    if generation != latest {
        debug!(query = %state.key, generation, latest, "discarded stale response");
        return TaskOutcome::Superseded;
    }
    state.inflight.borrow_mut().take();

    match result {
        Ok(value) => {
            let response = normalize(&value);
            inner.store.batch(|s| {
                inner.records.merge(s, response.records);
                s.set(&state.phase, Phase::Resolved(response.root));
            });
            debug!(query = %state.key, generation, "applied response");
            TaskOutcome::Applied
        }
        Err(error) => {
            debug!(query = %state.key, generation, %error, "fetch failed");
            inner.store.set(&state.phase, Phase::Failed(error));
            TaskOutcome::Failed
        }
    }
}
