use thiserror::Error;

/// Stable machine-readable codes for every error the store can surface.
/// The string forms are part of the public contract: callers may match on
/// them and they must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorCode {
    Sqlite,
    Io,
    MissingCodec,
    Unexecutable,
    Lifecycle,
    Cancelled,
    QueueDown,
    Timeout,
    AttributeConfig,
    TableRegistry,
    Validation,
    Migration,
}

impl DbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DbErrorCode::Sqlite => "sqlite",
            DbErrorCode::Io => "io",
            DbErrorCode::MissingCodec => "missing_codec",
            DbErrorCode::Unexecutable => "unexecutable",
            DbErrorCode::Lifecycle => "lifecycle",
            DbErrorCode::Cancelled => "cancelled",
            DbErrorCode::QueueDown => "queue_down",
            DbErrorCode::Timeout => "timeout",
            DbErrorCode::AttributeConfig => "attribute_config",
            DbErrorCode::TableRegistry => "table_registry",
            DbErrorCode::Validation => "validation",
            DbErrorCode::Migration => "migration",
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An attribute's scalar kind has no registered value codec. Fatal to
    /// the transaction that first touches the attribute, not to the store.
    #[error("no value codec registered for scalar kind {kind} (attribute '{attribute}')")]
    MissingCodec { attribute: String, kind: String },

    /// The predicate compiler found a term no factory can execute, or a
    /// negated form an operator refuses to support.
    #[error("unexecutable predicate: {reason}")]
    Unexecutable { reason: String },

    /// Operation submitted while the store was not in a state to accept it.
    #[error("lifecycle: {reason}")]
    Lifecycle { reason: String },

    /// The job was cancelled before or during execution. Not a failure:
    /// callers should treat this as "unsuccessful, no error".
    #[error("cancelled")]
    Cancelled,

    /// The owning connection's worker died and took the job with it.
    #[error("connection worker is down: {reason}")]
    QueueDown { reason: String },

    #[error("timed out waiting for job completion")]
    Timeout,

    #[error("attribute configuration: {reason}")]
    AttributeConfig { reason: String },

    #[error("table registry: {reason}")]
    TableRegistry { reason: String },

    #[error("{0}")]
    Validation(String),

    #[error("migration '{name}' failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    pub fn code(&self) -> DbErrorCode {
        match self {
            DbError::Sqlite(_) => DbErrorCode::Sqlite,
            DbError::Io(_) => DbErrorCode::Io,
            DbError::MissingCodec { .. } => DbErrorCode::MissingCodec,
            DbError::Unexecutable { .. } => DbErrorCode::Unexecutable,
            DbError::Lifecycle { .. } => DbErrorCode::Lifecycle,
            DbError::Cancelled => DbErrorCode::Cancelled,
            DbError::QueueDown { .. } => DbErrorCode::QueueDown,
            DbError::Timeout => DbErrorCode::Timeout,
            DbError::AttributeConfig { .. } => DbErrorCode::AttributeConfig,
            DbError::TableRegistry { .. } => DbErrorCode::TableRegistry,
            DbError::Validation(_) => DbErrorCode::Validation,
            DbError::Migration { .. } => DbErrorCode::Migration,
        }
    }

    /// Cancellation travels as an error value for plumbing purposes but is
    /// not a failure; callers branching on job outcome should check this
    /// before treating the result as broken.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DbError::Cancelled)
    }

    pub fn lifecycle(reason: impl Into<String>) -> DbError {
        DbError::Lifecycle {
            reason: reason.into(),
        }
    }

    pub fn unexecutable(reason: impl Into<String>) -> DbError {
        DbError::Unexecutable {
            reason: reason.into(),
        }
    }

    pub(crate) fn attr_config(reason: impl Into<String>) -> DbError {
        DbError::AttributeConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn table_registry(reason: impl Into<String>) -> DbError {
        DbError::TableRegistry {
            reason: reason.into(),
        }
    }

    pub(crate) fn queue_down(reason: impl Into<String>) -> DbError {
        DbError::QueueDown {
            reason: reason.into(),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let cases = [
            (DbErrorCode::Sqlite, "sqlite"),
            (DbErrorCode::Io, "io"),
            (DbErrorCode::MissingCodec, "missing_codec"),
            (DbErrorCode::Unexecutable, "unexecutable"),
            (DbErrorCode::Lifecycle, "lifecycle"),
            (DbErrorCode::Cancelled, "cancelled"),
            (DbErrorCode::QueueDown, "queue_down"),
            (DbErrorCode::Timeout, "timeout"),
            (DbErrorCode::AttributeConfig, "attribute_config"),
            (DbErrorCode::TableRegistry, "table_registry"),
            (DbErrorCode::Validation, "validation"),
            (DbErrorCode::Migration, "migration"),
        ];
        for (code, s) in cases {
            assert_eq!(code.as_str(), s);
        }
    }

    #[test]
    fn cancelled_is_not_a_failure() {
        let err = DbError::Cancelled;
        assert!(err.is_cancelled());
        assert_eq!(err.code(), DbErrorCode::Cancelled);
        assert!(!DbError::Timeout.is_cancelled());
    }

    #[test]
    fn migration_errors_carry_their_cause() {
        let inner = DbError::Validation("bad shape".into());
        let err = DbError::Migration {
            name: "widen-titles".into(),
            source: Box::new(inner),
        };
        assert_eq!(err.code(), DbErrorCode::Migration);
        assert!(err.to_string().contains("widen-titles"));
    }
}
