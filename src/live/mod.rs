//! Live queries.
//!
//! A live query keeps a predicate's result set current across commits
//! and tells its listeners what changed. All live queries are refreshed
//! in one coalesced pass per committed write, scheduled by the write
//! worker and executed as a read job, so a burst of commits costs one
//! pass and every query in a pass sees the same snapshot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::DbResult;
use crate::query::{Conjunct, Predicate, execute_within, planner};
use crate::sqlite::job::ExecGate;
use crate::store::Engine;
use crate::tx::TransactionContext;
use crate::types::{Icn, ItemId, ItemSet, diff_sorted, intersect_sorted, union_sorted};

/// What changed in one live query between two passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEvent {
    /// Items that now match and did not before, ascending.
    pub added: Vec<ItemId>,
    /// Items that matched before and no longer do, ascending.
    pub removed: Vec<ItemId>,
    /// The snapshot the pass evaluated at.
    pub icn: Icn,
}

/// Callbacks of one live query subscription.
///
/// The first notification is always a snapshot of the full result set;
/// after that each pass delivers either a change event or, when nothing
/// about this query changed, a bare ICN so the listener knows how
/// current its view is.
pub trait LiveListener: Send + Sync {
    fn on_snapshot(&self, items: &[ItemId], icn: Icn);
    fn on_changed(&self, event: &LiveEvent);
    fn on_icn_passed(&self, _icn: Icn) {}
}

/// Queries with the same meaning share one cached result set, so the
/// key is the normalized predicate, not the written one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey(Vec<Vec<Conjunct>>);

fn canonical(predicate: &Predicate, max_depth: usize) -> DbResult<QueryKey> {
    let dnf = planner::normalize(predicate, max_depth)?;
    let mut disjuncts = dnf.disjuncts;
    for conjuncts in &mut disjuncts {
        conjuncts.sort();
        conjuncts.dedup();
    }
    disjuncts.sort();
    disjuncts.dedup();
    Ok(QueryKey(disjuncts))
}

struct ListenerEntry {
    id: u64,
    gate: ExecGate,
    listener: Arc<dyn LiveListener>,
    /// First delivery for this listener is the full result set.
    snapshot_pending: bool,
}

struct LiveState {
    /// Result set as of `validated`; `None` forces a full reload.
    cached: Option<Vec<ItemId>>,
    validated: Icn,
    /// Items the identified-object terms resolved to last pass. Identity
    /// can move between items, so a changed resolution also reloads.
    resolution: Option<Vec<Option<ItemId>>>,
    listeners: Vec<ListenerEntry>,
}

struct LiveQuery {
    predicate: Predicate,
    ids: Vec<String>,
    state: Mutex<LiveState>,
}

enum Notice {
    Snapshot(Vec<ItemId>, Icn),
    Changed(Arc<LiveEvent>),
    Passed(Icn),
}

type Delivery = (ExecGate, Arc<dyn LiveListener>, Notice);

pub(crate) struct LiveManager {
    queries: Mutex<HashMap<QueryKey, Arc<LiveQuery>>>,
    /// A refresh pass is queued; commits until it runs fold into it.
    pass_requested: AtomicBool,
    next_listener: AtomicU64,
}

impl LiveManager {
    pub(crate) fn new() -> LiveManager {
        LiveManager {
            queries: Mutex::new(HashMap::new()),
            pass_requested: AtomicBool::new(false),
            next_listener: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(
        &self,
        engine: &Arc<Engine>,
        predicate: Predicate,
        gate: ExecGate,
        listener: Arc<dyn LiveListener>,
    ) -> DbResult<LiveQueryHandle> {
        // Reject unknown handles here instead of failing every refresh
        // pass later.
        for attr in predicate.attrs() {
            engine.attrs.require(attr)?;
        }
        let key = canonical(&predicate, engine.config.max_predicate_depth)?;
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut queries = self.queries.lock();
        let query = queries.entry(key.clone()).or_insert_with(|| {
            Arc::new(LiveQuery {
                ids: predicate.identified_ids(),
                predicate,
                state: Mutex::new(LiveState {
                    cached: None,
                    validated: Icn::ZERO,
                    resolution: None,
                    listeners: Vec::new(),
                }),
            })
        });
        query.state.lock().listeners.push(ListenerEntry {
            id,
            gate,
            listener,
            snapshot_pending: true,
        });
        tracing::debug!(listener = id, queries = queries.len(), "live query subscribed");
        Ok(LiveQueryHandle { engine: Arc::downgrade(engine), key, listener: id })
    }

    fn unsubscribe(&self, key: &QueryKey, listener: u64) {
        let mut queries = self.queries.lock();
        let Some(query) = queries.get(key) else { return };
        let mut state = query.state.lock();
        state.listeners.retain(|entry| entry.id != listener);
        let empty = state.listeners.is_empty();
        drop(state);
        if empty {
            queries.remove(key);
            tracing::debug!(listener, "last listener gone, live query dropped");
        }
    }

    /// Whether a refresh pass needs scheduling. At most one pass is
    /// pending at a time; commits while one is queued coalesce into it.
    pub(crate) fn request_pass(&self) -> bool {
        if self.queries.lock().is_empty() {
            return false;
        }
        !self.pass_requested.swap(true, Ordering::SeqCst)
    }

    /// One refresh pass over every registered query. Runs as a read job
    /// so all queries see the same snapshot.
    pub(crate) fn run_pass(&self, ctx: &mut TransactionContext<'_>) -> DbResult<()> {
        self.pass_requested.store(false, Ordering::SeqCst);
        let queries: Vec<Arc<LiveQuery>> = self.queries.lock().values().cloned().collect();
        for query in queries {
            ctx.ensure_alive()?;
            match self.evaluate(ctx, &query) {
                Ok(deliveries) => deliver(deliveries),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    // One broken query must not starve the others; its
                    // next pass reloads from scratch.
                    tracing::warn!(error = %err, "live query evaluation failed");
                    query.state.lock().cached = None;
                }
            }
        }
        Ok(())
    }

    fn evaluate(
        &self,
        ctx: &mut TransactionContext<'_>,
        query: &LiveQuery,
    ) -> DbResult<Vec<Delivery>> {
        let target = ctx.icn();
        let resolution: Vec<Option<ItemId>> = query
            .ids
            .iter()
            .map(|id| ctx.resolve(id))
            .collect::<DbResult<_>>()?;
        let mut state = query.state.lock();
        let reload =
            state.cached.is_none() || state.resolution.as_deref() != Some(resolution.as_slice());
        let (added, removed) = if reload {
            // Full reloads go through the filter tree so repeated passes
            // over the same predicate reuse its materialized table.
            let matching = ctx.filter_items(&query.predicate)?;
            let diffs = match &state.cached {
                Some(old) => (diff_sorted(&matching, old), diff_sorted(old, &matching)),
                None => (Vec::new(), Vec::new()),
            };
            state.cached = Some(matching);
            diffs
        } else {
            let changed = ctx.changed_since(state.validated)?;
            if changed.is_empty() {
                (Vec::new(), Vec::new())
            } else {
                let matching = match execute_within(
                    ctx,
                    &query.predicate,
                    &ItemSet::Sorted(changed.clone()),
                )? {
                    ItemSet::Sorted(items) => items,
                    ItemSet::All => changed.clone(),
                };
                let cached = state.cached.as_ref().unwrap();
                let added = diff_sorted(&matching, cached);
                let removed = intersect_sorted(&diff_sorted(&changed, &matching), cached);
                let next = union_sorted(&diff_sorted(cached, &removed), &added);
                state.cached = Some(next);
                (added, removed)
            }
        };
        state.resolution = Some(resolution);
        state.validated = target;

        let event = if added.is_empty() && removed.is_empty() {
            None
        } else {
            Some(Arc::new(LiveEvent { added, removed, icn: target }))
        };
        let cached = state.cached.clone().unwrap_or_default();
        let mut deliveries = Vec::with_capacity(state.listeners.len());
        for entry in &mut state.listeners {
            let notice = if entry.snapshot_pending {
                entry.snapshot_pending = false;
                Notice::Snapshot(cached.clone(), target)
            } else if let Some(event) = &event {
                Notice::Changed(Arc::clone(event))
            } else {
                Notice::Passed(target)
            };
            deliveries.push((entry.gate, Arc::clone(&entry.listener), notice));
        }
        Ok(deliveries)
    }
}

/// Callbacks run after the query lock is released, so a listener may
/// subscribe or drop handles from inside its own notification.
fn deliver(deliveries: Vec<Delivery>) {
    for (gate, listener, notice) in deliveries {
        match gate {
            ExecGate::Inline => notify(&listener, notice),
            ExecGate::Detached => {
                std::thread::spawn(move || notify(&listener, notice));
            }
        }
    }
}

fn notify(listener: &Arc<dyn LiveListener>, notice: Notice) {
    match notice {
        Notice::Snapshot(items, icn) => listener.on_snapshot(&items, icn),
        Notice::Changed(event) => listener.on_changed(&event),
        Notice::Passed(icn) => listener.on_icn_passed(icn),
    }
}

/// Keeps one subscription alive; dropping it unsubscribes, and the
/// query itself goes away with its last listener.
pub struct LiveQueryHandle {
    engine: Weak<Engine>,
    key: QueryKey,
    listener: u64,
}

impl Drop for LiveQueryHandle {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.live.unsubscribe(&self.key, self.listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrHandle;
    use crate::value::Value;

    fn eq(attr: u32, value: i64) -> Predicate {
        Predicate::equals(AttrHandle(attr), Value::Int(value))
    }

    #[test]
    fn commuted_predicates_share_a_key() {
        let a = canonical(&Predicate::and(vec![eq(1, 5), eq(2, 9)]), 8).unwrap();
        let b = canonical(&Predicate::and(vec![eq(2, 9), eq(1, 5)]), 8).unwrap();
        assert_eq!(a, b);
        let c = canonical(&Predicate::and(vec![eq(1, 5), eq(2, 8)]), 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn or_order_does_not_matter_either() {
        let a = canonical(&Predicate::or(vec![eq(1, 1), eq(2, 2)]), 8).unwrap();
        let b = canonical(&Predicate::or(vec![eq(2, 2), eq(1, 1)]), 8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pass_requests_coalesce_until_the_pass_runs() {
        let manager = LiveManager::new();
        // No queries registered: nothing to refresh.
        assert!(!manager.request_pass());

        manager.queries.lock().insert(
            canonical(&eq(1, 1), 8).unwrap(),
            Arc::new(LiveQuery {
                predicate: eq(1, 1),
                ids: Vec::new(),
                state: Mutex::new(LiveState {
                    cached: None,
                    validated: Icn::ZERO,
                    resolution: None,
                    listeners: Vec::new(),
                }),
            }),
        );
        assert!(manager.request_pass());
        assert!(!manager.request_pass(), "second commit folds into the pending pass");
        manager.pass_requested.store(false, Ordering::SeqCst);
        assert!(manager.request_pass());
    }
}
