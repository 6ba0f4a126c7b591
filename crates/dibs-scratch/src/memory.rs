//! In-process instance and lock, for tests.
//!
//! [`MemoryInstance`] keeps schemas, tables and row counts in memory.
//! [`MemoryLock`] is a named lock keyed by instance and lock name. Both
//! count what happened to them, so tests can assert that no lock leaked.
//!
//! ```ignore
//! let instance = Arc::new(MemoryInstance::new("primary"));
//! let locker = Arc::new(MemoryLock::new());
//! let ws = TempSchema::provision(Options::new(instance.clone()), locker.clone()).await?;
//! ws.cleanup().await?;
//! assert_eq!(locker.held_count(), 0);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::InstanceError;
use crate::instance::{DistributedLock, Instance};
use crate::snapshot::{ColumnSnapshot, SchemaSnapshot, TableSnapshot};

/// Instance operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    HasSchema,
    CreateSchema,
    DropSchema,
    DropTables,
    Connect,
    Introspect,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::HasSchema => "has_schema",
            Operation::CreateSchema => "create_schema",
            Operation::DropSchema => "drop_schema",
            Operation::DropTables => "drop_tables_in_schema",
            Operation::Connect => "connect",
            Operation::Introspect => "schema",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemorySchema {
    charset: String,
    collation: String,
    tables: IndexMap<String, MemoryTable>,
}

impl MemorySchema {
    fn first_non_empty_table(&self) -> Option<&str> {
        self.tables
            .iter()
            .find(|(_, table)| table.rows > 0)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<ColumnSnapshot>,
    rows: u64,
}

#[derive(Default)]
struct State {
    schemas: BTreeMap<String, MemorySchema>,
    failures: HashSet<Operation>,
}

/// A fake instance holding its schemas in memory.
pub struct MemoryInstance {
    name: String,
    state: Mutex<State>,
}

/// What [`MemoryInstance::connect`] hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPool {
    pub schema: String,
    pub params: String,
}

impl MemoryInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `operation` fail with
    /// [`InstanceError::Injected`].
    pub fn fail_next(&self, operation: Operation) {
        self.state().failures.insert(operation);
    }

    fn check(state: &mut State, operation: Operation) -> Result<(), InstanceError> {
        if state.failures.remove(&operation) {
            return Err(InstanceError::Injected(operation.as_str()));
        }
        Ok(())
    }

    pub fn contains_schema(&self, schema: &str) -> bool {
        self.state().schemas.contains_key(schema)
    }

    /// Creates a schema directly, bypassing any workspace.
    pub fn create_schema_unchecked(&self, schema: &str) {
        self.state().schemas.entry(schema.to_owned()).or_default();
    }

    /// Creates (or replaces) an empty table, creating the schema if needed.
    pub fn create_table(&self, schema: &str, table: &str, columns: Vec<ColumnSnapshot>) {
        self.state()
            .schemas
            .entry(schema.to_owned())
            .or_default()
            .tables
            .insert(table.to_owned(), MemoryTable { columns, rows: 0 });
    }

    /// Adds rows to an existing table. Returns false if there is no such table.
    pub fn insert_rows(&self, schema: &str, table: &str, rows: u64) -> bool {
        let mut state = self.state();
        match state
            .schemas
            .get_mut(schema)
            .and_then(|s| s.tables.get_mut(table))
        {
            Some(t) => {
                t.rows += rows;
                true
            }
            None => false,
        }
    }

    pub fn table_names(&self, schema: &str) -> Vec<String> {
        self.state()
            .schemas
            .get(schema)
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Charset and collation a schema was created with.
    pub fn schema_encoding(&self, schema: &str) -> Option<(String, String)> {
        self.state()
            .schemas
            .get(schema)
            .map(|s| (s.charset.clone(), s.collation.clone()))
    }
}

impl fmt::Display for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory://{}", self.name)
    }
}

impl Instance for MemoryInstance {
    type Pool = MemoryPool;

    async fn has_schema(&self, name: &str) -> Result<bool, InstanceError> {
        let mut state = self.state();
        Self::check(&mut state, Operation::HasSchema)?;
        Ok(state.schemas.contains_key(name))
    }

    async fn create_schema(
        &self,
        name: &str,
        charset: &str,
        collation: &str,
    ) -> Result<(), InstanceError> {
        let mut state = self.state();
        Self::check(&mut state, Operation::CreateSchema)?;
        if state.schemas.contains_key(name) {
            return Err(InstanceError::Unsupported(format!(
                "schema {name} already exists"
            )));
        }
        state.schemas.insert(
            name.to_owned(),
            MemorySchema {
                charset: charset.to_owned(),
                collation: collation.to_owned(),
                tables: IndexMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_schema(&self, name: &str, only_if_empty: bool) -> Result<(), InstanceError> {
        let mut state = self.state();
        Self::check(&mut state, Operation::DropSchema)?;
        if only_if_empty {
            if let Some(table) = state.schemas.get(name).and_then(|s| s.first_non_empty_table()) {
                return Err(InstanceError::TableNotEmpty {
                    schema: name.to_owned(),
                    table: table.to_owned(),
                });
            }
        }
        state.schemas.remove(name);
        Ok(())
    }

    async fn drop_tables_in_schema(
        &self,
        name: &str,
        only_if_empty: bool,
    ) -> Result<(), InstanceError> {
        let mut state = self.state();
        Self::check(&mut state, Operation::DropTables)?;
        let Some(schema) = state.schemas.get_mut(name) else {
            return Ok(());
        };
        if only_if_empty {
            if let Some(table) = schema.first_non_empty_table() {
                return Err(InstanceError::TableNotEmpty {
                    schema: name.to_owned(),
                    table: table.to_owned(),
                });
            }
        }
        schema.tables.clear();
        Ok(())
    }

    async fn connect(&self, schema: &str, params: &str) -> Result<MemoryPool, InstanceError> {
        let mut state = self.state();
        Self::check(&mut state, Operation::Connect)?;
        Ok(MemoryPool {
            schema: schema.to_owned(),
            params: params.to_owned(),
        })
    }

    async fn schema(&self, name: &str) -> Result<SchemaSnapshot, InstanceError> {
        let mut state = self.state();
        Self::check(&mut state, Operation::Introspect)?;
        let mut snapshot = SchemaSnapshot::new(name);
        if let Some(schema) = state.schemas.get(name) {
            for (table_name, table) in &schema.tables {
                snapshot.tables.insert(
                    table_name.clone(),
                    TableSnapshot {
                        name: table_name.clone(),
                        columns: table.columns.clone(),
                        indexes: Vec::new(),
                    },
                );
            }
        }
        Ok(snapshot)
    }
}

#[derive(Default)]
struct LockState {
    held: Mutex<HashSet<String>>,
    released: Notify,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    fail_next_release: AtomicBool,
}

impl LockState {
    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlock(&self, key: &str) -> bool {
        let removed = self.held().remove(key);
        if removed {
            self.released.notify_waiters();
        }
        removed
    }
}

/// Named locks shared by every [`MemoryInstance`] they are used with.
///
/// Keys are scoped by instance, so the same lock name on two instances does
/// not contend.
#[derive(Default)]
pub struct MemoryLock {
    state: Arc<LockState>,
}

/// A held [`MemoryLock`]. Dropping it without releasing frees the lock, like
/// a database session going away.
pub struct MemoryLockHandle {
    key: String,
    state: Arc<LockState>,
    released: bool,
}

impl MemoryLockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for MemoryLockHandle {
    fn drop(&mut self) {
        if !self.released {
            self.state.unlock(&self.key);
        }
    }
}

fn lock_key(instance: &MemoryInstance, lock_name: &str) -> String {
    format!("{instance}/{lock_name}")
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, instance: &MemoryInstance, lock_name: &str) -> bool {
        self.state.held().contains(&lock_key(instance, lock_name))
    }

    pub fn held_count(&self) -> usize {
        self.state.held().len()
    }

    /// Number of successful acquisitions.
    pub fn acquire_count(&self) -> usize {
        self.state.acquires.load(Ordering::SeqCst)
    }

    /// Number of explicit releases, failed ones included.
    pub fn release_count(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    /// Makes the next release report an error. The lock is still freed.
    pub fn fail_next_release(&self) {
        self.state.fail_next_release.store(true, Ordering::SeqCst);
    }
}

impl DistributedLock<MemoryInstance> for MemoryLock {
    type Handle = MemoryLockHandle;

    async fn acquire(
        &self,
        instance: &MemoryInstance,
        lock_name: &str,
        timeout: Duration,
    ) -> Result<MemoryLockHandle, InstanceError> {
        let key = lock_key(instance, lock_name);
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a release in between
            // is not missed.
            let mut released = pin!(self.state.released.notified());
            released.as_mut().enable();

            if self.state.held().insert(key.clone()) {
                self.state.acquires.fetch_add(1, Ordering::SeqCst);
                return Ok(MemoryLockHandle {
                    key,
                    state: self.state.clone(),
                    released: false,
                });
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(InstanceError::LockTimeout {
                    name: lock_name.to_owned(),
                    timeout,
                });
            }
        }
    }

    async fn release(
        &self,
        mut handle: MemoryLockHandle,
        lock_name: &str,
    ) -> Result<(), InstanceError> {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        handle.released = true;
        let was_held = self.state.unlock(&handle.key);

        if self.state.fail_next_release.swap(false, Ordering::SeqCst) {
            return Err(InstanceError::Injected("release"));
        }
        if !was_held {
            return Err(InstanceError::LockNotHeld {
                name: lock_name.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_contends_per_instance() {
        let a = MemoryInstance::new("a");
        let b = MemoryInstance::new("b");
        let locker = MemoryLock::new();

        let held = locker.acquire(&a, "dibs.x", Duration::ZERO).await.unwrap();
        let err = locker.acquire(&a, "dibs.x", Duration::ZERO).await.err().unwrap();
        assert!(matches!(err, InstanceError::LockTimeout { .. }));

        let other = locker.acquire(&b, "dibs.x", Duration::ZERO).await.unwrap();
        assert_eq!(locker.held_count(), 2);

        locker.release(held, "dibs.x").await.unwrap();
        locker.release(other, "dibs.x").await.unwrap();
        assert_eq!(locker.held_count(), 0);
        assert_eq!(locker.release_count(), 2);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let instance = Arc::new(MemoryInstance::new("a"));
        let locker = Arc::new(MemoryLock::new());
        let held = locker
            .acquire(&instance, "dibs.x", Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let instance = instance.clone();
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .acquire(&instance, "dibs.x", Duration::from_secs(5))
                    .await
                    .map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        locker.release(held, "dibs.x").await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_lock() {
        let instance = MemoryInstance::new("a");
        let locker = MemoryLock::new();
        let held = locker
            .acquire(&instance, "dibs.x", Duration::ZERO)
            .await
            .unwrap();
        drop(held);
        assert!(!locker.is_held(&instance, "dibs.x"));
        assert_eq!(locker.release_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_tables_only_if_empty_drops_nothing() {
        let instance = MemoryInstance::new("a");
        instance.create_table("s", "empty", vec![]);
        instance.create_table("s", "full", vec![]);
        instance.insert_rows("s", "full", 3);

        let err = instance.drop_tables_in_schema("s", true).await.unwrap_err();
        assert!(matches!(err, InstanceError::TableNotEmpty { ref table, .. } if table == "full"));
        assert_eq!(instance.table_names("s"), vec!["empty", "full"]);

        instance.drop_tables_in_schema("s", false).await.unwrap();
        assert!(instance.table_names("s").is_empty());
        assert!(instance.contains_schema("s"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let instance = MemoryInstance::new("a");
        instance.fail_next(Operation::HasSchema);
        assert!(instance.has_schema("s").await.is_err());
        assert!(!instance.has_schema("s").await.unwrap());
    }
}
