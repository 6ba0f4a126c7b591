//! The temp schema workspace and its lifecycle.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Error;
use crate::instance::{DistributedLock, Instance};
use crate::options::Options;
use crate::snapshot::SchemaSnapshot;

/// Prefix of every temp schema lock name.
pub const LOCK_NAMESPACE: &str = "dibs";

/// Name of the lock guarding a temp schema.
///
/// Two workspaces targeting the same schema name on the same instance derive
/// the same lock name, so they serialize.
pub fn lock_name(schema_name: &str) -> String {
    format!("{LOCK_NAMESPACE}.{schema_name}")
}

/// A scratch schema that can be queried, introspected, then cleaned up.
pub trait Workspace: Send {
    type Pool;

    /// Opens a connection pool to the workspace schema. `params` may be empty.
    fn connection_pool(&self, params: &str) -> impl Future<Output = crate::Result<Self::Pool>> + Send;

    /// Introspects the workspace schema. Never cached.
    fn introspect_schema(&self) -> impl Future<Output = crate::Result<SchemaSnapshot>> + Send;

    /// Tears the workspace down. The workspace cannot be used afterwards.
    fn cleanup(self) -> impl Future<Output = crate::Result<()>> + Send
    where
        Self: Sized;
}

/// A workspace living in a schema of an existing instance.
///
/// The schema is guarded by a named lock for as long as the workspace is
/// alive. On cleanup the schema is dropped, or, with
/// [`keep_schema`](Options::keep_schema), only its tables are, so that the
/// next workspace can reuse it. Tables are only ever dropped when they are
/// empty, except when the whole schema goes away.
pub struct TempSchema<I: Instance, L: DistributedLock<I>> {
    schema_name: String,
    keep_schema: bool,
    instance: Arc<I>,
    locker: Arc<L>,
    lock: Option<L::Handle>,
}

impl<I: Instance, L: DistributedLock<I>> TempSchema<I, L> {
    /// Locks the schema, then creates it, or empties it if it already exists.
    ///
    /// Fails with [`Error::NonEmptySchema`] if an existing table has rows;
    /// nothing is dropped in that case. The lock is released on every
    /// failure after it was acquired.
    pub async fn provision(options: Options<I>, locker: Arc<L>) -> crate::Result<Self> {
        let instance = options.validate()?;
        let lock_name = lock_name(&options.schema_name);

        let handle = locker
            .acquire(&instance, &lock_name, options.lock_wait_timeout)
            .await
            .map_err(|source| {
                Error::lock_failed(&instance, &lock_name, options.lock_wait_timeout, source)
            })?;

        match prepare_schema(&*instance, &options).await {
            Ok(()) => {
                info!(
                    instance = %instance,
                    schema = %options.schema_name,
                    keep_schema = options.keep_schema,
                    "temporary schema ready"
                );
                Ok(Self {
                    schema_name: options.schema_name,
                    keep_schema: options.keep_schema,
                    instance,
                    locker,
                    lock: Some(handle),
                })
            }
            Err(err) => {
                if let Err(release_err) = locker.release(handle, &lock_name).await {
                    warn!(
                        instance = %instance,
                        lock = %lock_name,
                        error = %release_err,
                        "failed to release lock after provisioning failure"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn keep_schema(&self) -> bool {
        self.keep_schema
    }

    pub fn lock_name(&self) -> String {
        lock_name(&self.schema_name)
    }

    pub fn instance(&self) -> &Arc<I> {
        &self.instance
    }

    pub async fn connection_pool(&self, params: &str) -> crate::Result<I::Pool> {
        self.instance
            .connect(&self.schema_name, params)
            .await
            .map_err(|source| Error::Connect {
                instance: self.instance.to_string(),
                schema: self.schema_name.clone(),
                source,
            })
    }

    pub async fn introspect_schema(&self) -> crate::Result<SchemaSnapshot> {
        self.instance
            .schema(&self.schema_name)
            .await
            .map_err(|source| Error::Introspect {
                instance: self.instance.to_string(),
                schema: self.schema_name.clone(),
                source,
            })
    }

    /// Drops the schema (or only its tables, with `keep_schema`), then
    /// releases the lock.
    ///
    /// The lock is released even if the drop fails. A drop failure takes
    /// priority over a release failure; the latter is only logged then.
    pub async fn cleanup(mut self) -> crate::Result<()> {
        let dropped = if self.keep_schema {
            self.instance
                .drop_tables_in_schema(&self.schema_name, true)
                .await
        } else {
            // The schema itself goes away, so its contents are not checked.
            self.instance.drop_schema(&self.schema_name, false).await
        };
        let dropped =
            dropped.map_err(|source| Error::drop_failed(&self.instance, &self.schema_name, source));

        let lock_name = self.lock_name();
        let released = match self.lock.take() {
            Some(handle) => self.locker.release(handle, &lock_name).await,
            None => Ok(()),
        };

        match (dropped, released) {
            (Ok(()), Ok(())) => {
                info!(
                    instance = %self.instance,
                    schema = %self.schema_name,
                    "temporary schema cleaned up"
                );
                Ok(())
            }
            (Ok(()), Err(source)) => Err(Error::LockRelease {
                instance: self.instance.to_string(),
                lock_name,
                source,
            }),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(
                    instance = %self.instance,
                    lock = %lock_name,
                    error = %release_err,
                    cleanup_error = %err,
                    "failed to release lock after cleanup failure"
                );
                Err(err)
            }
        }
    }
}

async fn prepare_schema<I: Instance>(instance: &I, options: &Options<I>) -> crate::Result<()> {
    let schema = options.schema_name.as_str();

    let exists = instance
        .has_schema(schema)
        .await
        .map_err(|source| Error::SchemaCheck {
            instance: instance.to_string(),
            schema: schema.to_owned(),
            source,
        })?;

    if exists {
        // Only empty tables go; a row anywhere means someone else is using it.
        instance
            .drop_tables_in_schema(schema, true)
            .await
            .map_err(|source| Error::drop_failed(instance, schema, source))
    } else {
        instance
            .create_schema(
                schema,
                &options.default_character_set,
                &options.default_collation,
            )
            .await
            .map_err(|source| Error::SchemaCreation {
                instance: instance.to_string(),
                schema: schema.to_owned(),
                source,
            })
    }
}

impl<I: Instance, L: DistributedLock<I>> Drop for TempSchema<I, L> {
    fn drop(&mut self) {
        if self.lock.is_some() {
            warn!(
                instance = %self.instance,
                schema = %self.schema_name,
                "temporary schema dropped without cleanup"
            );
        }
    }
}

impl<I: Instance, L: DistributedLock<I>> Workspace for TempSchema<I, L> {
    type Pool = I::Pool;

    fn connection_pool(&self, params: &str) -> impl Future<Output = crate::Result<I::Pool>> + Send {
        TempSchema::connection_pool(self, params)
    }

    fn introspect_schema(&self) -> impl Future<Output = crate::Result<SchemaSnapshot>> + Send {
        TempSchema::introspect_schema(self)
    }

    fn cleanup(self) -> impl Future<Output = crate::Result<()>> + Send {
        TempSchema::cleanup(self)
    }
}
