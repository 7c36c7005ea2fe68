//! Schema-less item storage over SQLite.
//!
//! An item is an opaque id; everything it is or has lives in attribute
//! values, stored in shared physical tables keyed by `(kind,
//! composition)`. On top of that sit a single-writer job scheduler with
//! priorities, cancellation, and hurry-up; per-commit change tracking
//! through a monotonic item change number; a predicate compiler that
//! runs queries as cost-ordered operator chains; passive caches
//! validated against the change number; live queries that push result
//! changes to listeners; and shared materialized filter tables for
//! repeated reads.
//!
//! ```no_run
//! use itemdb::{Attribute, ItemStore, Predicate, ScalarKind, Value};
//!
//! # fn main() -> itemdb::DbResult<()> {
//! let store = ItemStore::in_memory();
//! let title = store.register_attribute(Attribute::scalar("note:title", ScalarKind::Str))?;
//! store.start()?;
//!
//! let item = store.write(move |ctx| {
//!     let item = ctx.next_item()?;
//!     ctx.write_value(item, title, Some(&Value::Str("groceries".into())))?;
//!     Ok(item)
//! })?;
//!
//! let found = store.read(move |ctx| {
//!     ctx.query(&Predicate::equals(title, Value::Str("groceries".into())))
//! })?;
//! assert_eq!(found, vec![item]);
//! # Ok(())
//! # }
//! ```

pub mod attr;
pub mod config;
pub mod error;
pub mod query;
pub mod types;
pub mod value;

mod cache;
mod filter;
mod housekeeping;
mod live;
mod sqlite;
mod store;
mod trigger;
mod tx;

pub use attr::{AttrHandle, Attribute, AttributeRegistry, IdentifiedObject};
pub use attr::{SYS_COMPOSITION, SYS_ID, SYS_KIND, SYS_PROPAGATING};
pub use config::ItemdbConfig;
pub use error::{DbError, DbErrorCode, DbResult};
pub use live::{LiveEvent, LiveListener, LiveQueryHandle};
pub use query::{CompareOp, Predicate, Term};
pub use sqlite::DbLocation;
pub use sqlite::job::{ExecGate, JobHandle};
pub use store::{ItemDump, ItemStore, StoreDump};
pub use trigger::TriggerDef;
pub use tx::TransactionContext;
pub use types::{Icn, ItemId, Priority};
pub use value::{
    AttributeMap, CodecRegistry, Composition, ScalarKind, Value, ValueCodec,
};
