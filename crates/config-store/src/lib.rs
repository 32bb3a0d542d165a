//! Key/value parameter store.
//!
//! Both the Controller and the Board Agent own one. They are reconciled only
//! through explicit `set`/`setall` commands. Listeners observe every mutation
//! synchronously, after the write lock has been released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use astropi_protocol::{Config, ConfigValue, ValueKind};
use tracing::trace;

/// Errors returned by [`ConfigStore`] lookups.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    NotFound(String),

    #[error("{key} holds a {actual:?}, expected {expected:?}")]
    WrongType {
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("{key} must not be negative, got {value}")]
    Negative { key: String, value: i64 },
}

/// A mutation reported to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Set { key: String, value: ConfigValue },
    Removed { key: String },
    /// Several keys changed at once; `keys` lists every key added, changed
    /// or dropped.
    Replaced { keys: Vec<String> },
}

impl ConfigChange {
    /// Returns `true` if the change touches `key`.
    pub fn touches(&self, key: &str) -> bool {
        match self {
            Self::Set { key: k, .. } | Self::Removed { key: k } => k == key,
            Self::Replaced { keys } => keys.iter().any(|k| k == key),
        }
    }
}

/// Handle returned by [`ConfigStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ConfigChange) + Send + Sync>;

#[derive(Default)]
struct Inner {
    values: RwLock<Config>,
    listeners: RwLock<BTreeMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

/// Thread-safe config store. Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("values", &self.snapshot())
            .finish()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `config`.
    pub fn with_config(config: Config) -> Self {
        let store = Self::new();
        *store.inner.values.write().unwrap_or_else(PoisonError::into_inner) = config;
        store
    }

    /// Stores `value` under `key`, creating the key if needed. Returns the
    /// previous value.
    pub fn set(&self, key: impl Into<String>, value: ConfigValue) -> Option<ConfigValue> {
        let key = key.into();
        let old = self
            .inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.clone());
        trace!(%key, %value, "config set");
        self.notify(&ConfigChange::Set { key, value });
        old
    }

    /// Replaces the whole map in one step. Keys `config` does not mention
    /// are dropped.
    pub fn set_all(&self, config: Config) {
        let mut keys: Vec<String> = config.keys().cloned().collect();
        let old = std::mem::replace(
            &mut *self
                .inner
                .values
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            config,
        );
        let dropped: Vec<String> = old.into_keys().filter(|k| !keys.contains(k)).collect();
        keys.extend(dropped);
        trace!(count = keys.len(), "config replaced");
        self.notify(&ConfigChange::Replaced { keys });
    }

    /// Merges `config` into the map, keeping keys it does not mention.
    pub fn merge(&self, config: Config) {
        let keys: Vec<String> = config.keys().cloned().collect();
        self.inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(config);
        self.notify(&ConfigChange::Replaced { keys });
    }

    pub fn remove(&self, key: &str) -> Option<ConfigValue> {
        let old = self
            .inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if old.is_some() {
            self.notify(&ConfigChange::Removed {
                key: key.to_string(),
            });
        }
        old
    }

    pub fn get(&self, key: &str) -> Result<ConfigValue, ConfigError> {
        self.inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    /// Reads an integer value.
    pub fn get_i64(&self, key: &str) -> Result<i64, ConfigError> {
        let value = self.get(key)?;
        value.as_i64().ok_or(ConfigError::WrongType {
            key: key.to_string(),
            expected: ValueKind::Int,
            actual: value.kind(),
        })
    }

    /// Reads a non-negative integer value.
    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigError> {
        let value = self.get_i64(key)?;
        u64::try_from(value).map_err(|_| ConfigError::Negative {
            key: key.to_string(),
            value,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the whole map.
    pub fn snapshot(&self) -> Config {
        self.inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers a listener called after every mutation, on the mutating
    /// thread.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConfigChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    fn notify(&self, change: &ConfigChange) {
        // Clone the list so listeners may subscribe or mutate the store.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}
