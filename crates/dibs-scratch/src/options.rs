use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Schema name used when none is configured.
pub const DEFAULT_SCHEMA_NAME: &str = "_dibs_tmp";

/// How long provisioning waits for the schema lock by default.
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options accepted by [`TempSchema::provision`](crate::TempSchema::provision).
///
/// ```ignore
/// let options = Options::new(instance)
///     .schema_name("_dibs_tmp")
///     .keep_schema(true)
///     .lock_wait_timeout(Duration::from_secs(5));
/// ```
pub struct Options<I> {
    /// Target instance. Required.
    pub instance: Option<Arc<I>>,

    pub schema_name: String,

    /// On cleanup, drop only the tables and keep the schema around for the
    /// next workspace.
    pub keep_schema: bool,

    pub lock_wait_timeout: Duration,

    /// Empty means the server default.
    pub default_character_set: String,

    /// Empty means the server default.
    pub default_collation: String,
}

impl<I> Options<I> {
    pub fn new(instance: Arc<I>) -> Self {
        Self {
            instance: Some(instance),
            ..Self::default()
        }
    }

    pub fn schema_name(mut self, name: impl Into<String>) -> Self {
        self.schema_name = name.into();
        self
    }

    pub fn keep_schema(mut self, keep: bool) -> Self {
        self.keep_schema = keep;
        self
    }

    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn default_character_set(mut self, charset: impl Into<String>) -> Self {
        self.default_character_set = charset.into();
        self
    }

    pub fn default_collation(mut self, collation: impl Into<String>) -> Self {
        self.default_collation = collation.into();
        self
    }

    /// Checks required inputs, returning the instance.
    pub(crate) fn validate(&self) -> Result<Arc<I>, Error> {
        let instance = self
            .instance
            .clone()
            .ok_or_else(|| Error::Configuration("no instance defined in options".to_owned()))?;
        if self.schema_name.is_empty() {
            return Err(Error::Configuration("schema name is empty".to_owned()));
        }
        Ok(instance)
    }
}

impl<I> Default for Options<I> {
    fn default() -> Self {
        Self {
            instance: None,
            schema_name: DEFAULT_SCHEMA_NAME.to_owned(),
            keep_schema: false,
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
            default_character_set: String::new(),
            default_collation: String::new(),
        }
    }
}

impl<I> Clone for Options<I> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            schema_name: self.schema_name.clone(),
            keep_schema: self.keep_schema,
            lock_wait_timeout: self.lock_wait_timeout,
            default_character_set: self.default_character_set.clone(),
            default_collation: self.default_collation.clone(),
        }
    }
}
