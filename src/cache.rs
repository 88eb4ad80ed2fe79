//! Named, typed, TTL-expiring caches.
//!
//! [`CacheStore`] is the seam the service helper talks to. [`TtlCache`] is the
//! in-process default, and [`CacheManager`] hands out caches by name so that a
//! handle which lost its live reference can find the same cache again.

use crate::config::CacheSettings;
use crate::error::CacheError;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, trace};

/// A thread-safe key/value store whose entries expire.
///
/// Implementations must make each single-key operation atomic. Nothing is
/// guaranteed across keys.
pub trait CacheStore<V>: Send + Sync {
  fn name(&self) -> &str;

  fn get(&self, key: &str) -> Option<V>;

  fn put(&self, key: &str, value: V);

  /// Stores `value` unless a live entry exists. Returns true if stored.
  fn put_if_absent(&self, key: &str, value: V) -> bool;

  fn remove(&self, key: &str) -> Option<V>;

  /// Removes the entry only if `predicate` holds for its current value.
  fn remove_if(&self, key: &str, predicate: &dyn Fn(&V) -> bool) -> bool;

  fn contains_key(&self, key: &str) -> bool;

  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn clear(&self);
}

struct CacheEntry<V> {
  value: V,
  expires_at: Instant,
}

impl<V> CacheEntry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    now >= self.expires_at
  }
}

/// In-process [`CacheStore`] backed by a `DashMap`.
///
/// Expired entries are dropped lazily on access. When `max_entries` is set and
/// the cache is full, expired entries are purged first and then the entry
/// closest to expiry is evicted.
pub struct TtlCache<V> {
  name: String,
  ttl: Duration,
  max_entries: Option<usize>,
  entries: DashMap<String, CacheEntry<V>>,
}

impl<V> fmt::Debug for TtlCache<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TtlCache")
      .field("name", &self.name)
      .field("ttl", &self.ttl)
      .field("max_entries", &self.max_entries)
      .field("len", &self.entries.len())
      .finish()
  }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
  pub fn new(name: &str, ttl: Duration) -> Self {
    Self::with_max_entries(name, ttl, None)
  }

  pub fn with_max_entries(name: &str, ttl: Duration, max_entries: Option<usize>) -> Self {
    Self {
      name: name.to_string(),
      ttl,
      max_entries: max_entries.filter(|max| *max > 0),
      entries: DashMap::new(),
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  fn new_entry(&self, value: V) -> CacheEntry<V> {
    CacheEntry {
      value,
      expires_at: Instant::now() + self.ttl,
    }
  }

  fn make_room_for(&self, key: &str) {
    let Some(max) = self.max_entries else {
      return;
    };
    if self.entries.len() < max || self.entries.contains_key(key) {
      return;
    }
    let now = Instant::now();
    self.entries.retain(|_, entry| !entry.is_expired(now));
    if self.entries.len() < max {
      return;
    }
    let oldest = self
      .entries
      .iter()
      .min_by_key(|entry| entry.value().expires_at)
      .map(|entry| entry.key().clone());
    if let Some(oldest) = oldest {
      trace!(cache = %self.name, key = %oldest, "Evicting entry to respect max entries.");
      self.entries.remove(&oldest);
    }
  }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> for TtlCache<V> {
  fn name(&self) -> &str {
    &self.name
  }

  fn get(&self, key: &str) -> Option<V> {
    let now = Instant::now();
    if let Some(entry) = self.entries.get(key) {
      if !entry.is_expired(now) {
        return Some(entry.value.clone());
      }
    }
    self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    None
  }

  fn put(&self, key: &str, value: V) {
    self.make_room_for(key);
    self.entries.insert(key.to_string(), self.new_entry(value));
  }

  fn put_if_absent(&self, key: &str, value: V) -> bool {
    self.make_room_for(key);
    let now = Instant::now();
    match self.entries.entry(key.to_string()) {
      Entry::Occupied(mut occupied) => {
        if occupied.get().is_expired(now) {
          occupied.insert(self.new_entry(value));
          true
        } else {
          false
        }
      }
      Entry::Vacant(vacant) => {
        vacant.insert(self.new_entry(value));
        true
      }
    }
  }

  fn remove(&self, key: &str) -> Option<V> {
    let now = Instant::now();
    self
      .entries
      .remove(key)
      .filter(|(_, entry)| !entry.is_expired(now))
      .map(|(_, entry)| entry.value)
  }

  fn remove_if(&self, key: &str, predicate: &dyn Fn(&V) -> bool) -> bool {
    self.entries.remove_if(key, |_, entry| predicate(&entry.value)).is_some()
  }

  fn contains_key(&self, key: &str) -> bool {
    let now = Instant::now();
    self.entries.get(key).is_some_and(|entry| !entry.is_expired(now))
  }

  fn len(&self) -> usize {
    let now = Instant::now();
    self.entries.iter().filter(|entry| !entry.value().is_expired(now)).count()
  }

  fn clear(&self) {
    self.entries.clear();
  }
}

/// Shared handle to a typed named cache.
pub type SharedCache<V> = Arc<dyn CacheStore<V>>;

/// Hands out named caches, creating them on first request.
///
/// Each name is bound to one value type. Asking for an existing name with a
/// different type is an error rather than a silent second cache.
pub struct CacheManager {
  settings: CacheSettings,
  caches: DashMap<String, Arc<dyn Any + Send + Sync>>,
  clear_hooks: DashMap<String, Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for CacheManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names: Vec<String> = self.caches.iter().map(|entry| entry.key().clone()).collect();
    f.debug_struct("CacheManager").field("caches", &names).finish()
  }
}

impl Default for CacheManager {
  fn default() -> Self {
    Self::new(CacheSettings::default())
  }
}

impl CacheManager {
  pub fn new(settings: CacheSettings) -> Self {
    Self {
      settings,
      caches: DashMap::new(),
      clear_hooks: DashMap::new(),
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  /// Returns the cache called `name`, creating it with the configured duration.
  pub fn get_or_create_default<V>(&self, name: &str) -> Result<SharedCache<V>, CacheError>
  where
    V: Clone + Send + Sync + 'static,
  {
    self.get_or_create(name, self.settings.default_duration.as_duration())
  }

  /// Returns the cache called `name`, creating it if needed.
  ///
  /// A per-name duration in the configuration wins over `duration`. The
  /// duration of an existing cache is never changed.
  pub fn get_or_create<V>(&self, name: &str, duration: Duration) -> Result<SharedCache<V>, CacheError>
  where
    V: Clone + Send + Sync + 'static,
  {
    if let Some(existing) = self.lookup::<V>(name) {
      return existing;
    }
    let ttl = self.settings.duration_for(name, duration);
    let max_entries = self.settings.max_entries_for(name);
    let store: SharedCache<V> = Arc::new(TtlCache::<V>::with_max_entries(name, ttl, max_entries));
    self.insert_if_absent(name, store)
  }

  /// Returns an already created cache without ever creating one.
  pub fn existing<V>(&self, name: &str) -> Result<SharedCache<V>, CacheError>
  where
    V: Clone + Send + Sync + 'static,
  {
    self
      .lookup::<V>(name)
      .unwrap_or_else(|| Err(CacheError::NotFound(name.to_string())))
  }

  /// Registers a host supplied store under its name. An existing cache of the
  /// same name is kept and returned instead.
  pub fn register<V>(&self, store: SharedCache<V>) -> Result<SharedCache<V>, CacheError>
  where
    V: Clone + Send + Sync + 'static,
  {
    let name = store.name().to_string();
    self.insert_if_absent(&name, store)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.caches.contains_key(name)
  }

  /// Clears every cache. Used on process shutdown to release held results.
  pub fn release(&self) {
    info!("Releasing {} caches.", self.clear_hooks.len());
    for hook in self.clear_hooks.iter() {
      (hook.value())();
    }
  }

  fn lookup<V>(&self, name: &str) -> Option<Result<SharedCache<V>, CacheError>>
  where
    V: Clone + Send + Sync + 'static,
  {
    let entry = self.caches.get(name)?;
    Some(Self::downcast::<V>(name, entry.value()))
  }

  fn insert_if_absent<V>(&self, name: &str, store: SharedCache<V>) -> Result<SharedCache<V>, CacheError>
  where
    V: Clone + Send + Sync + 'static,
  {
    let entry = self
      .caches
      .entry(name.to_string())
      .or_insert_with(|| {
        debug!(cache = %name, "Creating cache.");
        let hook_store = store.clone();
        self
          .clear_hooks
          .insert(name.to_string(), Arc::new(move || hook_store.clear()));
        Arc::new(store) as Arc<dyn Any + Send + Sync>
      })
      .clone();
    Self::downcast::<V>(name, &entry)
  }

  fn downcast<V>(name: &str, erased: &Arc<dyn Any + Send + Sync>) -> Result<SharedCache<V>, CacheError>
  where
    V: Clone + Send + Sync + 'static,
  {
    erased
      .downcast_ref::<SharedCache<V>>()
      .cloned()
      .ok_or_else(|| CacheError::IncompatibleType { name: name.to_string() })
  }
}
