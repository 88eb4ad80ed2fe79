//! Configuration for pools, caches, the service helper and logical pools.
//!
//! Everything is deserialized from TOML with serde and every field has a default,
//! so an empty document yields a usable configuration with one elastic `default` pool.

use crate::error::ConfigError;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Name of the pool used when none is configured.
pub const DEFAULT_POOL_NAME: &str = "default";
/// Worker count for `fixed` pools with a missing or non-positive `max_threads`.
pub const DEFAULT_MAX_THREADS: usize = 20;
/// Queue length for `fixed` pools (synchronous hand-off).
pub const DEFAULT_QUEUE_LENGTH: i64 = 0;
/// Result holder cache time to live, in seconds.
pub const DEFAULT_RESULT_DURATION_SECS: u64 = 1800;
/// In-progress marker cache time to live, in seconds.
pub const DEFAULT_IN_PROGRESS_DURATION_SECS: u64 = 300;
pub const DEFAULT_LOGICAL_WAIT_INTERVAL_MS: u64 = 300;
pub const DEFAULT_LOGICAL_MAX_WAIT_INTERVALS: u32 = 200;

/// The worker layout of a named pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum PoolKind {
  /// One worker with an unbounded queue.
  Single,
  /// A fixed number of workers with a configurable queue.
  Fixed,
  /// Elastic: grows on demand, no bounded queue. Also used for unrecognized kinds.
  #[default]
  Cached,
}

impl From<String> for PoolKind {
  fn from(value: String) -> Self {
    match value.trim().to_lowercase().as_str() {
      "single" => PoolKind::Single,
      "fixed" => PoolKind::Fixed,
      _ => PoolKind::Cached,
    }
  }
}

/// How a pool buffers submissions that cannot start immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
  Unbounded,
  /// No buffering: a submission is only accepted if a worker is free.
  SynchronousHandoff,
  Bounded(usize),
}

impl QueuePolicy {
  /// Negative lengths are unbounded, zero is a synchronous hand-off.
  pub fn from_length(length: i64) -> Self {
    match length {
      l if l < 0 => QueuePolicy::Unbounded,
      0 => QueuePolicy::SynchronousHandoff,
      l => QueuePolicy::Bounded(l as usize),
    }
  }
}

/// Raw per-pool settings as they appear in the configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
  pub kind: PoolKind,
  pub max_threads: i64,
  pub queue: i64,
}

impl Default for PoolSettings {
  fn default() -> Self {
    Self {
      kind: PoolKind::Cached,
      max_threads: DEFAULT_MAX_THREADS as i64,
      queue: DEFAULT_QUEUE_LENGTH,
    }
  }
}

impl PoolSettings {
  pub fn single() -> Self {
    Self {
      kind: PoolKind::Single,
      ..Self::default()
    }
  }

  pub fn fixed(max_threads: i64, queue: i64) -> Self {
    Self {
      kind: PoolKind::Fixed,
      max_threads,
      queue,
    }
  }

  pub fn cached() -> Self {
    Self::default()
  }
}

/// A fully resolved pool layout. Built once per pool (and again if the pool is rebuilt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDescriptor {
  pub name: String,
  pub kind: PoolKind,
  /// `None` means unlimited workers.
  pub max_threads: Option<usize>,
  pub queue: QueuePolicy,
}

impl PoolDescriptor {
  pub fn from_settings(name: &str, settings: &PoolSettings) -> Self {
    let (max_threads, queue) = match settings.kind {
      PoolKind::Single => (Some(1), QueuePolicy::Unbounded),
      PoolKind::Fixed => {
        let max = if settings.max_threads < 1 {
          DEFAULT_MAX_THREADS
        } else {
          usize::try_from(settings.max_threads).unwrap_or(usize::MAX)
        };
        (Some(max), QueuePolicy::from_length(settings.queue))
      }
      PoolKind::Cached => (None, QueuePolicy::Unbounded),
    };
    Self {
      name: name.to_string(),
      kind: settings.kind,
      max_threads,
      queue,
    }
  }

  /// Maximum number of tasks admitted at once (running plus queued), if bounded.
  pub fn admission_limit(&self) -> Option<usize> {
    let workers = self.max_threads?;
    match self.queue {
      QueuePolicy::Unbounded => None,
      QueuePolicy::SynchronousHandoff => Some(workers),
      QueuePolicy::Bounded(length) => Some(workers.saturating_add(length)),
    }
  }
}

/// Time unit of a [`DurationSetting`]. Unknown unit strings fall back to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum TimeUnit {
  Days,
  Hours,
  Minutes,
  #[default]
  Seconds,
  Millis,
  Nanos,
}

impl From<String> for TimeUnit {
  fn from(value: String) -> Self {
    match value.trim() {
      "d" => TimeUnit::Days,
      "h" => TimeUnit::Hours,
      "m" => TimeUnit::Minutes,
      "mi" => TimeUnit::Millis,
      "n" => TimeUnit::Nanos,
      _ => TimeUnit::Seconds,
    }
  }
}

/// An `{ amount, unit }` pair, e.g. `{ amount = 30, unit = "m" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DurationSetting {
  pub amount: u64,
  #[serde(default)]
  pub unit: TimeUnit,
}

impl DurationSetting {
  pub const fn seconds(amount: u64) -> Self {
    Self {
      amount,
      unit: TimeUnit::Seconds,
    }
  }

  pub fn as_duration(&self) -> Duration {
    match self.unit {
      TimeUnit::Days => Duration::from_secs(self.amount.saturating_mul(86_400)),
      TimeUnit::Hours => Duration::from_secs(self.amount.saturating_mul(3_600)),
      TimeUnit::Minutes => Duration::from_secs(self.amount.saturating_mul(60)),
      TimeUnit::Seconds => Duration::from_secs(self.amount),
      TimeUnit::Millis => Duration::from_millis(self.amount),
      TimeUnit::Nanos => Duration::from_nanos(self.amount),
    }
  }
}

/// Settings for the service invocation helper.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
  pub result_cache_duration: DurationSetting,
  /// Track in-flight async cached calls so concurrent callers share one execution.
  pub in_progress_enabled: bool,
  pub in_progress_duration: DurationSetting,
}

impl Default for ServiceSettings {
  fn default() -> Self {
    Self {
      result_cache_duration: DurationSetting::seconds(DEFAULT_RESULT_DURATION_SECS),
      in_progress_enabled: false,
      in_progress_duration: DurationSetting::seconds(DEFAULT_IN_PROGRESS_DURATION_SECS),
    }
  }
}

/// Per-cache overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NamedCacheSettings {
  pub duration: Option<DurationSetting>,
  pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub default_duration: DurationSetting,
  pub named: HashMap<String, NamedCacheSettings>,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      default_duration: DurationSetting::seconds(DEFAULT_RESULT_DURATION_SECS),
      named: HashMap::new(),
    }
  }
}

impl CacheSettings {
  /// The configured duration for `name`, or `fallback` when it has no override.
  pub fn duration_for(&self, name: &str, fallback: Duration) -> Duration {
    self
      .named
      .get(name)
      .and_then(|settings| settings.duration)
      .map(|duration| duration.as_duration())
      .unwrap_or(fallback)
  }

  pub fn max_entries_for(&self, name: &str) -> Option<usize> {
    self.named.get(name).and_then(|settings| settings.max_entries)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogicalPoolSettings {
  pub wait_interval_ms: u64,
  pub max_wait_intervals: u32,
}

impl Default for LogicalPoolSettings {
  fn default() -> Self {
    Self {
      wait_interval_ms: DEFAULT_LOGICAL_WAIT_INTERVAL_MS,
      max_wait_intervals: DEFAULT_LOGICAL_MAX_WAIT_INTERVALS,
    }
  }
}

impl LogicalPoolSettings {
  pub fn wait_interval(&self) -> Duration {
    Duration::from_millis(self.wait_interval_ms)
  }
}

/// Top level configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TaskMasterConfig {
  pub default_pool: String,
  pub pool_names: Vec<String>,
  pub pools: HashMap<String, PoolSettings>,
  pub service: ServiceSettings,
  pub caches: CacheSettings,
  pub logical: LogicalPoolSettings,
}

impl Default for TaskMasterConfig {
  fn default() -> Self {
    Self {
      default_pool: DEFAULT_POOL_NAME.to_string(),
      pool_names: Vec::new(),
      pools: HashMap::new(),
      service: ServiceSettings::default(),
      caches: CacheSettings::default(),
      logical: LogicalPoolSettings::default(),
    }
  }
}

impl TaskMasterConfig {
  pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(source)?)
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let source = std::fs::read_to_string(path)?;
    Self::from_toml_str(&source)
  }

  /// Adds (or replaces) a named pool and lists it in `pool_names`.
  pub fn with_pool(mut self, name: &str, settings: PoolSettings) -> Self {
    if !self.pool_names.iter().any(|existing| existing == name) {
      self.pool_names.push(name.to_string());
    }
    self.pools.insert(name.to_string(), settings);
    self
  }

  pub fn with_default_pool(mut self, name: &str) -> Self {
    self.default_pool = name.to_string();
    self
  }

  pub fn with_in_progress_tracking(mut self, enabled: bool) -> Self {
    self.service.in_progress_enabled = enabled;
    self
  }

  /// Every pool the registry builds at startup: the listed names plus the default pool.
  pub fn configured_pools(&self) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(self.pool_names.len() + 1);
    for name in self.pool_names.iter().chain(std::iter::once(&self.default_pool)) {
      if !names.contains(name) {
        names.push(name.clone());
      }
    }
    names
  }

  pub fn descriptor(&self, name: &str) -> PoolDescriptor {
    let settings = self.pools.get(name).cloned().unwrap_or_default();
    PoolDescriptor::from_settings(name, &settings)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = TaskMasterConfig::from_toml_str("").unwrap();
    assert_eq!(config, TaskMasterConfig::default());
    assert_eq!(config.configured_pools(), vec!["default".to_string()]);
    assert_eq!(config.descriptor("default").kind, PoolKind::Cached);
    assert!(!config.service.in_progress_enabled);
  }

  #[test]
  fn test_full_document() {
    let source = r#"
      default_pool = "main"
      pool_names = ["reports", "io"]

      [pools.reports]
      kind = "fixed"
      max_threads = 2
      queue = 0

      [pools.io]
      kind = "FIXED"
      max_threads = -3
      queue = -1

      [pools.main]
      kind = "single"

      [service]
      result_cache_duration = { amount = 30, unit = "m" }
      in_progress_enabled = true

      [caches.named.short]
      duration = { amount = 250, unit = "mi" }
      max_entries = 10

      [logical]
      wait_interval_ms = 5
      max_wait_intervals = 3
    "#;
    let config = TaskMasterConfig::from_toml_str(source).unwrap();

    assert_eq!(config.configured_pools(), vec!["reports", "io", "main"]);

    let reports = config.descriptor("reports");
    assert_eq!(reports.max_threads, Some(2));
    assert_eq!(reports.queue, QueuePolicy::SynchronousHandoff);
    assert_eq!(reports.admission_limit(), Some(2));

    let io = config.descriptor("io");
    assert_eq!(io.max_threads, Some(DEFAULT_MAX_THREADS));
    assert_eq!(io.queue, QueuePolicy::Unbounded);
    assert_eq!(io.admission_limit(), None);

    let main = config.descriptor("main");
    assert_eq!(main.kind, PoolKind::Single);
    assert_eq!(main.max_threads, Some(1));

    assert_eq!(config.service.result_cache_duration.as_duration(), Duration::from_secs(1800));
    assert!(config.service.in_progress_enabled);
    assert_eq!(config.service.in_progress_duration.as_duration(), Duration::from_secs(300));

    assert_eq!(
      config.caches.duration_for("short", Duration::from_secs(1)),
      Duration::from_millis(250)
    );
    assert_eq!(config.caches.duration_for("other", Duration::from_secs(1)), Duration::from_secs(1));
    assert_eq!(config.caches.max_entries_for("short"), Some(10));
    assert_eq!(config.logical.wait_interval(), Duration::from_millis(5));
  }

  #[test]
  fn test_unknown_kind_is_elastic() {
    let config = TaskMasterConfig::from_toml_str("[pools.x]\nkind = \"work-stealing\"\n").unwrap();
    let descriptor = config.descriptor("x");
    assert_eq!(descriptor.kind, PoolKind::Cached);
    assert_eq!(descriptor.max_threads, None);
  }

  #[test]
  fn test_bounded_queue_limit() {
    let descriptor = PoolDescriptor::from_settings("b", &PoolSettings::fixed(3, 4));
    assert_eq!(descriptor.queue, QueuePolicy::Bounded(4));
    assert_eq!(descriptor.admission_limit(), Some(7));
  }

  #[test]
  fn test_unknown_unit_falls_back_to_seconds() {
    let setting: DurationSetting = toml::from_str("amount = 7\nunit = \"fortnights\"\n").unwrap();
    assert_eq!(setting.as_duration(), Duration::from_secs(7));
  }
}
