//! Postgres advisory locks.

use std::time::Duration;

use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{Instrument, debug};

use super::PgInstance;
use crate::error::InstanceError;
use crate::instance::DistributedLock;

/// Maps a lock name to the `bigint` key Postgres advisory locks use: the
/// first 8 bytes of its blake3 hash, big-endian.
pub fn advisory_key(lock_name: &str) -> i64 {
    let hash = blake3::hash(lock_name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    i64::from_be_bytes(bytes)
}

/// Milliseconds for `SET lock_timeout`: at least 1 (0 disables the timeout)
/// and at most what the setting accepts.
fn lock_timeout_ms(timeout: Duration) -> u128 {
    timeout.as_millis().clamp(1, i32::MAX as u128)
}

/// Session-level advisory locks on a [`PgInstance`].
///
/// Each acquisition opens its own session, so the lock goes away with the
/// session if the handle is dropped without being released.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgAdvisoryLock;

/// A held advisory lock and the session holding it.
pub struct PgLockHandle {
    client: Client,
    key: i64,
}

impl PgLockHandle {
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl PgAdvisoryLock {
    pub fn new() -> Self {
        Self
    }

    async fn connect(instance: &PgInstance) -> Result<Client, InstanceError> {
        let (client, connection) = instance.config().connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("advisory lock session closed: {e}");
            }
        });
        Ok(client)
    }
}

impl DistributedLock<PgInstance> for PgAdvisoryLock {
    type Handle = PgLockHandle;

    async fn acquire(
        &self,
        instance: &PgInstance,
        lock_name: &str,
        timeout: Duration,
    ) -> Result<PgLockHandle, InstanceError> {
        let key = advisory_key(lock_name);
        let client = Self::connect(instance).await?;
        let span = tracing::debug_span!("db.advisory_lock", lock = %lock_name, key, ?timeout);

        let acquired = async {
            if timeout.is_zero() {
                // lock_timeout = 0 would wait forever
                let row = client
                    .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
                    .await?;
                return Ok::<bool, tokio_postgres::Error>(row.get(0));
            }

            client
                .batch_execute(&format!(
                    "SET lock_timeout = '{}ms'",
                    lock_timeout_ms(timeout)
                ))
                .await?;
            match client.execute("SELECT pg_advisory_lock($1)", &[&key]).await {
                Ok(_) => Ok(true),
                Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => Ok(false),
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await?;

        if !acquired {
            return Err(InstanceError::LockTimeout {
                name: lock_name.to_owned(),
                timeout,
            });
        }
        debug!(lock = %lock_name, key, "advisory lock acquired");
        Ok(PgLockHandle { client, key })
    }

    async fn release(&self, handle: PgLockHandle, lock_name: &str) -> Result<(), InstanceError> {
        let span = tracing::debug_span!("db.advisory_unlock", lock = %lock_name, key = handle.key);
        let row = handle
            .client
            .query_one("SELECT pg_advisory_unlock($1)", &[&handle.key])
            .instrument(span)
            .await?;
        if !row.get::<_, bool>(0) {
            return Err(InstanceError::LockNotHeld {
                name: lock_name.to_owned(),
            });
        }
        Ok(())
    }
}
