//! Result envelopes for service calls.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A captured action failure.
///
/// The live error is kept while the failure stays in process. It is not
/// serialized, so a failure that crosses a serialization boundary comes back
/// as a plain message plus the original type name.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceFailure {
  message: String,
  type_name: String,
  #[serde(skip)]
  source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl ServiceFailure {
  /// A failure with no live source.
  pub fn new(message: impl Into<String>, type_name: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      type_name: type_name.into(),
      source: None,
    }
  }

  pub fn from_error<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    Self {
      message: error.to_string(),
      type_name: std::any::type_name::<E>().to_string(),
      source: Some(Arc::new(error)),
    }
  }

  /// Builds a failure from a `catch_unwind` payload.
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
      (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
      text.clone()
    } else {
      "action panicked".to_string()
    };
    Self::new(message, "panic")
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  /// Type name of the error the action returned.
  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  /// True while the original error is still attached.
  pub fn has_source(&self) -> bool {
    self.source.is_some()
  }

  /// Downcasts the original error, if it is still attached.
  pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
    self.source.as_deref()?.downcast_ref::<E>()
  }
}

impl fmt::Debug for ServiceFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServiceFailure")
      .field("message", &self.message)
      .field("type_name", &self.type_name)
      .field("has_source", &self.source.is_some())
      .finish()
  }
}

impl fmt::Display for ServiceFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

impl PartialEq for ServiceFailure {
  fn eq(&self, other: &Self) -> bool {
    self.message == other.message && self.type_name == other.type_name
  }
}

impl StdError for ServiceFailure {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    self
      .source
      .as_deref()
      .map(|source| source as &(dyn StdError + 'static))
  }
}

/// Immutable success-or-failure envelope for a service call, tagged with the
/// call's metadata (the criteria).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultHolder<M, T> {
  Success { meta: M, value: T },
  Failure { meta: M, failure: ServiceFailure },
}

impl<M, T> ResultHolder<M, T> {
  pub fn success(meta: M, value: T) -> Self {
    ResultHolder::Success { meta, value }
  }

  pub fn failure(meta: M, failure: ServiceFailure) -> Self {
    ResultHolder::Failure { meta, failure }
  }

  pub fn meta(&self) -> &M {
    match self {
      ResultHolder::Success { meta, .. } | ResultHolder::Failure { meta, .. } => meta,
    }
  }

  pub fn value(&self) -> Option<&T> {
    match self {
      ResultHolder::Success { value, .. } => Some(value),
      ResultHolder::Failure { .. } => None,
    }
  }

  pub fn failure_ref(&self) -> Option<&ServiceFailure> {
    match self {
      ResultHolder::Success { .. } => None,
      ResultHolder::Failure { failure, .. } => Some(failure),
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, ResultHolder::Success { .. })
  }

  pub fn is_failure(&self) -> bool {
    !self.is_success()
  }

  /// Whether this holder may be served from (or stored into) a result cache.
  pub fn is_cacheable(&self, cache_failures: bool) -> bool {
    self.is_success() || cache_failures
  }

  pub fn into_result(self) -> Result<T, ServiceFailure> {
    match self {
      ResultHolder::Success { value, .. } => Ok(value),
      ResultHolder::Failure { failure, .. } => Err(failure),
    }
  }
}

/// Write-once carrier filled in by a background task.
///
/// The task owns the carrier while it runs. Only the first `set_*` call has
/// any effect; the carrier is turned into a [`ResultHolder`] once the task
/// completes.
#[derive(Debug, Clone)]
pub struct ResultCarrier<M, T> {
  meta: M,
  outcome: Option<Result<T, ServiceFailure>>,
}

impl<M, T> ResultCarrier<M, T> {
  pub fn new(meta: M) -> Self {
    Self { meta, outcome: None }
  }

  pub fn meta(&self) -> &M {
    &self.meta
  }

  pub fn is_set(&self) -> bool {
    self.outcome.is_some()
  }

  /// Records a successful value. Returns false if an outcome was already recorded.
  pub fn set_result(&mut self, value: T) -> bool {
    self.record(Ok(value))
  }

  /// Records a failure. Returns false if an outcome was already recorded.
  pub fn set_failure(&mut self, failure: ServiceFailure) -> bool {
    self.record(Err(failure))
  }

  fn record(&mut self, outcome: Result<T, ServiceFailure>) -> bool {
    if self.outcome.is_some() {
      return false;
    }
    self.outcome = Some(outcome);
    true
  }

  pub fn into_holder(self) -> ResultHolder<M, T> {
    match self.outcome {
      Some(Ok(value)) => ResultHolder::success(self.meta, value),
      Some(Err(failure)) => ResultHolder::failure(self.meta, failure),
      None => ResultHolder::failure(
        self.meta,
        ServiceFailure::new("no result was recorded for the task", "ResultCarrier"),
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("upstream unavailable: {0}")]
  struct UpstreamError(u16);

  #[test]
  fn test_failure_keeps_source_in_process() {
    let failure = ServiceFailure::from_error(UpstreamError(503));
    assert_eq!(failure.message(), "upstream unavailable: 503");
    assert!(failure.type_name().ends_with("UpstreamError"));
    assert_eq!(failure.downcast_ref::<UpstreamError>().map(|e| e.0), Some(503));
  }

  #[test]
  fn test_failure_downgraded_across_serialization() {
    let holder: ResultHolder<String, u32> =
      ResultHolder::failure("criteria".to_string(), ServiceFailure::from_error(UpstreamError(500)));
    let json = serde_json::to_string(&holder).unwrap();
    let back: ResultHolder<String, u32> = serde_json::from_str(&json).unwrap();

    assert_eq!(back, holder);
    let failure = back.failure_ref().unwrap();
    assert!(!failure.has_source());
    assert!(failure.downcast_ref::<UpstreamError>().is_none());
    assert_eq!(failure.message(), "upstream unavailable: 500");
  }

  #[test]
  fn test_carrier_is_write_once() {
    let mut carrier = ResultCarrier::<&str, u32>::new("m");
    assert!(carrier.set_result(1));
    assert!(!carrier.set_failure(ServiceFailure::new("late", "x")));
    assert!(!carrier.set_result(2));
    assert_eq!(carrier.into_holder(), ResultHolder::success("m", 1));
  }

  #[test]
  fn test_empty_carrier_becomes_failure() {
    let holder = ResultCarrier::<u8, u8>::new(0).into_holder();
    assert!(holder.is_failure());
    assert!(!holder.is_cacheable(false));
    assert!(holder.is_cacheable(true));
  }

  #[test]
  fn test_panic_payload_message() {
    let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
    let failure = ServiceFailure::from_panic(payload);
    assert_eq!(failure.message(), "kaboom");
    assert_eq!(failure.type_name(), "panic");
  }
}
