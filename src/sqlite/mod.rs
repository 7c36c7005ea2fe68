//! Connection handling and the job scheduler.
//!
//! All database work funnels through worker-owned connections: one
//! writable connection, an optional read-only one so reads never wait
//! behind a long write, and for file stores a housekeeping connection
//! that keeps maintenance off the writer. Workers are plain threads;
//! jobs are submitted from any thread and complete through latches or
//! callbacks.

pub(crate) mod job;
pub(crate) mod queue;
pub(crate) mod schema;
pub(crate) mod select;

use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ItemdbConfig;
use crate::error::DbResult;

/// Where the database lives.
///
/// In-memory databases are private to one connection, so they run
/// without a read connection and are never reincarnated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    Memory,
}

impl DbLocation {
    pub fn file(path: impl Into<PathBuf>) -> DbLocation {
        DbLocation::File(path.into())
    }

    pub(crate) fn is_memory(&self) -> bool {
        matches!(self, DbLocation::Memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnRole {
    Write,
    Read,
    /// Writable connection for maintenance passes on file stores. The
    /// writer already bootstrapped the schema, so this one does not.
    Housekeeping,
}

/// Opens and provisions a connection for one worker.
pub(crate) fn open_connection(
    location: &DbLocation,
    role: ConnRole,
    config: &ItemdbConfig,
) -> DbResult<Connection> {
    let conn = match (location, role) {
        (DbLocation::Memory, _) => Connection::open_in_memory()?,
        (DbLocation::File(path), ConnRole::Write | ConnRole::Housekeeping) => {
            Connection::open(path)?
        }
        (DbLocation::File(path), ConnRole::Read) => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?,
    };
    rusqlite::vtab::array::load_module(&conn)?;
    apply_pragmas(&conn, role, config)?;
    if role == ConnRole::Write {
        schema::bootstrap(&conn)?;
    }
    tracing::debug!(?role, memory = location.is_memory(), "opened connection");
    Ok(conn)
}

fn apply_pragmas(conn: &Connection, role: ConnRole, config: &ItemdbConfig) -> DbResult<()> {
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    if role == ConnRole::Write {
        // page_size only takes effect before the first table is created.
        conn.pragma_update(None, "page_size", config.page_size)?;
        // PERSIST skips journal deletion on commit, trading a little disk
        // for fewer filesystem operations on every write.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "PERSIST", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("persist") && !mode.eq_ignore_ascii_case("memory") {
            tracing::warn!(mode, "journal_mode PERSIST not honored");
        }
    }
    conn.pragma_update(None, "cache_size", config.cache_size)?;
    if let Some(dir) = &config.temp_store_dir {
        conn.pragma_update(None, "temp_store_directory", dir.to_string_lossy().as_ref())?;
    }
    Ok(())
}
