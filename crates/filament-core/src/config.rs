//! Typed configuration registry
//!
//! Each recognized option is a named [`ConfigVar`] with a default, a
//! current value, and change listeners. The first `lookup` of a key also
//! consults the environment: `tcp.connect.timeout` can be overridden with
//! `FILAMENT_TCP_CONNECT_TIMEOUT`, `fiber.stack_size` with
//! `FILAMENT_FIBER_STACK_SIZE`, and so on.
//!
//! ```ignore
//! let stack = filament_core::config::lookup("fiber.stack_size", 128 * 1024u32, "fiber stack size");
//! stack.add_listener(|old, new| log::info!("stack size {} -> {}", old, new));
//! stack.set(256 * 1024);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Bound for types storable in a [`ConfigVar`].
pub trait ConfigValue: Clone + fmt::Debug + FromStr + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + FromStr + Send + Sync + 'static> ConfigValue for T {}

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A single typed configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
    next_listener_id: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: &str, description: &str, value: T) -> Self {
        ConfigVar {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(value),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value, cloned out from under the lock.
    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value and notify listeners with (old, new).
    ///
    /// Listeners run on the calling thread, outside the value lock.
    pub fn set(&self, new: T) {
        let old = {
            let mut guard = self.value.write();
            let old = guard.clone();
            *guard = new.clone();
            old
        };
        let listeners = self.listeners.read().clone();
        for (_, listener) in listeners.iter() {
            listener(&old, &new);
        }
    }

    /// Register a change listener; returns a key for `remove_listener`.
    pub fn add_listener(&self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        let key = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((key, Arc::new(f)));
        key
    }

    pub fn remove_listener(&self, key: u64) {
        self.listeners.write().retain(|(k, _)| *k != key);
    }
}

impl<T: ConfigValue> fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.value.read())
            .finish()
    }
}

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 9);
    key.push_str("FILAMENT_");
    for c in name.chars() {
        key.push(match c {
            '.' => '_',
            c => c.to_ascii_uppercase(),
        });
    }
    key
}

/// Look up (or register) a configuration variable.
///
/// The first call for a key registers it with `default`, applying any
/// `FILAMENT_*` environment override. Later calls return the same
/// variable.
///
/// # Panics
///
/// Panics if `name` contains characters outside `[a-z0-9._]`, or if the
/// key was previously registered with a different type. Both are
/// programming faults.
pub fn lookup<T: ConfigValue>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>> {
    assert!(
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_'),
        "invalid config key: {:?}",
        name
    );

    let mut registry = registry().write();
    if let Some(existing) = registry.get(name) {
        return existing
            .clone()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config key {:?} registered with a different type", name));
    }

    let mut value = default;
    let key = env_key(name);
    if let Ok(raw) = std::env::var(&key) {
        match raw.parse::<T>() {
            Ok(v) => value = v,
            Err(_) => log::warn!("ignoring unparsable env override {}={:?}", key, raw),
        }
    }

    let var = Arc::new(ConfigVar::new(name, description, value));
    registry.insert(name.to_string(), var.clone() as Arc<dyn Any + Send + Sync>);
    var
}
