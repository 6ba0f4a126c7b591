use std::time::Duration;

use thiserror::Error;

/// Failure reported by an [`Instance`](crate::Instance) or a
/// [`DistributedLock`](crate::DistributedLock) implementation.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("could not build connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::BuildError),

    /// A table holds at least one row, so it was not dropped.
    #[error("table {schema}.{table} has at least one row")]
    TableNotEmpty { schema: String, table: String },

    #[error("lock {name} not acquired within {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("lock {name} is not held by this session")]
    LockNotHeld { name: String },

    #[error("invalid connection params {params:?}: {reason}")]
    InvalidParams { params: String, reason: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure injected by [`MemoryInstance::fail_next`](crate::memory::MemoryInstance::fail_next).
    #[error("injected failure in {0}")]
    Injected(&'static str),
}

/// Errors surfaced by a temp schema workspace.
///
/// Every variant but [`Error::Configuration`] names the instance and the
/// schema (or lock) it concerns.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid workspace options: {0}")]
    Configuration(String),

    #[error("unable to lock temporary schema on {instance}: lock {lock_name} not acquired within {timeout:?}")]
    LockTimeout {
        instance: String,
        lock_name: String,
        timeout: Duration,
    },

    #[error("unable to lock temporary schema on {instance}: {source}")]
    Lock {
        instance: String,
        lock_name: String,
        source: InstanceError,
    },

    #[error("temporary schema {schema} on {instance} is not empty: table {table} has rows")]
    NonEmptySchema {
        instance: String,
        schema: String,
        table: String,
    },

    #[error("unable to check for existence of temporary schema {schema} on {instance}: {source}")]
    SchemaCheck {
        instance: String,
        schema: String,
        source: InstanceError,
    },

    #[error("cannot create temporary schema {schema} on {instance}: {source}")]
    SchemaCreation {
        instance: String,
        schema: String,
        source: InstanceError,
    },

    #[error("cannot drop temporary schema {schema} on {instance}: {source}")]
    SchemaDrop {
        instance: String,
        schema: String,
        source: InstanceError,
    },

    #[error("unable to release lock {lock_name} on {instance}: {source}")]
    LockRelease {
        instance: String,
        lock_name: String,
        source: InstanceError,
    },

    #[error("cannot connect to temporary schema {schema} on {instance}: {source}")]
    Connect {
        instance: String,
        schema: String,
        source: InstanceError,
    },

    #[error("cannot introspect temporary schema {schema} on {instance}: {source}")]
    Introspect {
        instance: String,
        schema: String,
        source: InstanceError,
    },
}

impl Error {
    /// Maps a lock acquisition failure, lifting timeouts out of the source.
    pub(crate) fn lock_failed(
        instance: impl ToString,
        lock_name: &str,
        timeout: Duration,
        source: InstanceError,
    ) -> Self {
        match source {
            InstanceError::LockTimeout { .. } => Error::LockTimeout {
                instance: instance.to_string(),
                lock_name: lock_name.to_owned(),
                timeout,
            },
            source => Error::Lock {
                instance: instance.to_string(),
                lock_name: lock_name.to_owned(),
                source,
            },
        }
    }

    /// Maps a drop failure, lifting row-count guard hits to
    /// [`Error::NonEmptySchema`].
    pub(crate) fn drop_failed(instance: impl ToString, schema: &str, source: InstanceError) -> Self {
        match source {
            InstanceError::TableNotEmpty { table, .. } => Error::NonEmptySchema {
                instance: instance.to_string(),
                schema: schema.to_owned(),
                table,
            },
            source => Error::SchemaDrop {
                instance: instance.to_string(),
                schema: schema.to_owned(),
                source,
            },
        }
    }

    /// Returns true if this error came from the row-count guard.
    pub fn is_non_empty_schema(&self) -> bool {
        matches!(self, Error::NonEmptySchema { .. })
    }
}
