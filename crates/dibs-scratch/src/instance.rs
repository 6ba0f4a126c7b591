//! Capabilities a temp schema workspace is built on.
//!
//! A workspace never talks to a database directly. It drives an [`Instance`]
//! (schema CRUD, connections, introspection) and a [`DistributedLock`]
//! (named mutual exclusion scoped to that instance). The crate ships a
//! Postgres implementation of both in [`crate::pg`] and an in-process fake
//! in [`crate::memory`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::InstanceError;
use crate::snapshot::SchemaSnapshot;

/// A database connection target.
///
/// `Display` is used as the instance identity in error messages, so it
/// should never include credentials.
pub trait Instance: fmt::Display + Send + Sync {
    /// Connection pool handed out by [`Instance::connect`].
    type Pool: Send;

    /// Returns whether a schema with this name exists.
    fn has_schema(&self, name: &str) -> impl Future<Output = Result<bool, InstanceError>> + Send;

    /// Creates a schema. An empty `charset` or `collation` means the server
    /// default.
    fn create_schema(
        &self,
        name: &str,
        charset: &str,
        collation: &str,
    ) -> impl Future<Output = Result<(), InstanceError>> + Send;

    /// Drops a schema and everything in it.
    ///
    /// With `only_if_empty`, fails with [`InstanceError::TableNotEmpty`]
    /// (and drops nothing) if any table has a row. The check covers the
    /// tables that exist once the check starts; callers that need a hard
    /// guarantee hold the schema's lock so nobody else creates tables.
    fn drop_schema(
        &self,
        name: &str,
        only_if_empty: bool,
    ) -> impl Future<Output = Result<(), InstanceError>> + Send;

    /// Drops every table of a schema, keeping the schema itself.
    ///
    /// With `only_if_empty`, fails with [`InstanceError::TableNotEmpty`]
    /// (and drops nothing) if any table has a row.
    fn drop_tables_in_schema(
        &self,
        name: &str,
        only_if_empty: bool,
    ) -> impl Future<Output = Result<(), InstanceError>> + Send;

    /// Opens a pool scoped to `schema`. `params` is passed through verbatim.
    fn connect(
        &self,
        schema: &str,
        params: &str,
    ) -> impl Future<Output = Result<Self::Pool, InstanceError>> + Send;

    /// Introspects a schema as it is right now.
    fn schema(&self, name: &str)
    -> impl Future<Output = Result<SchemaSnapshot, InstanceError>> + Send;
}

/// Named mutual exclusion scoped to an instance.
///
/// Acquiring hands out a handle owned by the caller; releasing consumes it,
/// so a handle can be released at most once.
pub trait DistributedLock<I: Instance>: Send + Sync {
    type Handle: Send + Sync;

    /// Waits up to `timeout` for the lock. Gives up with
    /// [`InstanceError::LockTimeout`].
    fn acquire(
        &self,
        instance: &I,
        lock_name: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Handle, InstanceError>> + Send;

    fn release(
        &self,
        handle: Self::Handle,
        lock_name: &str,
    ) -> impl Future<Output = Result<(), InstanceError>> + Send;
}
