//! Write-transaction triggers.
//!
//! A trigger couples a predicate with a body. After every commit-bound
//! write settles its changes, the worker narrows the touched items to
//! those matching the predicate and runs the body inside the same
//! transaction, so trigger writes commit or roll back with the work
//! that caused them.

use std::sync::Arc;

use crate::error::DbResult;
use crate::query::{Predicate, execute_within};
use crate::tx::TransactionContext;
use crate::types::{ItemId, ItemSet};

type TriggerBody = dyn Fn(&mut TransactionContext<'_>, &[ItemId]) -> DbResult<()> + Send + Sync;

/// A trigger definition handed to the store before or after start.
pub struct TriggerDef {
    name: String,
    predicate: Predicate,
    /// Run the body once over all currently matching items when the
    /// trigger is installed.
    run_on_existing: bool,
    body: Box<TriggerBody>,
}

impl TriggerDef {
    pub fn new(
        name: impl Into<String>,
        predicate: Predicate,
        body: impl Fn(&mut TransactionContext<'_>, &[ItemId]) -> DbResult<()> + Send + Sync + 'static,
    ) -> TriggerDef {
        TriggerDef {
            name: name.into(),
            predicate,
            run_on_existing: false,
            body: Box::new(body),
        }
    }

    /// Also applies the body to every item already matching when the
    /// trigger is installed, inside the installation transaction.
    pub fn run_on_existing(mut self) -> TriggerDef {
        self.run_on_existing = true;
        self
    }
}

/// Installed trigger, shared between the store and the write worker.
pub(crate) struct TriggerEntry {
    name: String,
    predicate: Predicate,
    run_on_existing: bool,
    body: Box<TriggerBody>,
}

impl TriggerEntry {
    pub(crate) fn from_def(def: TriggerDef) -> Arc<TriggerEntry> {
        Arc::new(TriggerEntry {
            name: def.name,
            predicate: def.predicate,
            run_on_existing: def.run_on_existing,
            body: def.body,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Runs once in the installation transaction.
    pub(crate) fn install(&self, ctx: &mut TransactionContext<'_>) -> DbResult<()> {
        if !self.run_on_existing {
            return Ok(());
        }
        let matching = ctx.query(&self.predicate)?;
        if matching.is_empty() {
            return Ok(());
        }
        tracing::debug!(trigger = %self.name, items = matching.len(), "running trigger over existing items");
        (self.body)(ctx, &matching)
    }

    /// Runs at the end of a write transaction over the items it touched.
    /// The body only fires when some touched item matches the predicate,
    /// and only sees the matching subset.
    pub(crate) fn on_changed(
        &self,
        ctx: &mut TransactionContext<'_>,
        touched: &[ItemId],
    ) -> DbResult<()> {
        if touched.is_empty() {
            return Ok(());
        }
        let universe = ItemSet::Sorted(touched.to_vec());
        let matching = match execute_within(ctx, &self.predicate, &universe)? {
            ItemSet::All => touched.to_vec(),
            ItemSet::Sorted(items) => items,
        };
        if matching.is_empty() {
            return Ok(());
        }
        tracing::trace!(trigger = %self.name, items = matching.len(), "trigger fired");
        (self.body)(ctx, &matching)
    }
}
