//! Exclusively-leased scratch schemas for schema diffing.
//!
//! Diffing a desired schema against a live one needs somewhere to apply the
//! desired DDL first. A [`TempSchema`] is that somewhere: a schema on an
//! existing instance, guarded by a named lock, created (or emptied) on
//! [`provision`](TempSchema::provision) and dropped on
//! [`cleanup`](TempSchema::cleanup).
//!
//! The workspace refuses to drop a table that holds rows. A row in the temp
//! schema means a human or another process is using it, and that is worth
//! failing loudly over.
//!
//! # Example
//!
//! ```ignore
//! use dibs_scratch::{Options, TempSchema, pg::{PgAdvisoryLock, PgInstance}};
//!
//! let instance = Arc::new(PgInstance::from_url(&database_url)?);
//! let options = Options::new(instance)
//!     .schema_name("_dibs_tmp")
//!     .lock_wait_timeout(Duration::from_secs(5));
//!
//! let ws = TempSchema::provision(options, Arc::new(PgAdvisoryLock)).await?;
//! let pool = ws.connection_pool("").await?;
//! pool.get().await?.batch_execute(&desired_sql).await?;
//! let desired = ws.introspect_schema().await?;
//! ws.cleanup().await?;
//! ```
//!
//! # Lifecycle
//!
//! - **Provision**: acquire the lock `dibs.<schema>`, then create the schema,
//!   or drop its (empty) tables if it already exists. Any failure after the
//!   lock was acquired releases it.
//! - **Active**: hand out connection pools and introspect, as often as needed.
//! - **Cleanup**: drop the schema, or only its tables with
//!   [`keep_schema`](Options::keep_schema), then release the lock whatever
//!   happened.

mod error;
mod instance;
pub mod memory;
mod options;
pub mod pg;
mod snapshot;
mod traced;
mod workspace;

pub use error::{Error, InstanceError};
pub use instance::{DistributedLock, Instance};
pub use options::{DEFAULT_LOCK_WAIT_TIMEOUT, DEFAULT_SCHEMA_NAME, Options};
pub use snapshot::{ColumnSnapshot, IndexSnapshot, SchemaSnapshot, TableSnapshot};
pub use traced::{TracedObject, TracedPool};
pub use workspace::{LOCK_NAMESPACE, TempSchema, Workspace, lock_name};

/// Result type for workspace operations.
pub type Result<T> = std::result::Result<T, Error>;
