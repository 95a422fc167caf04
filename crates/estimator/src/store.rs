//! Access to the sensor readings store.

use crate::errors::{EstimateError, Result};
use crate::types::{BoundingBox, SensorReading, TimeRange};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Source of sensor readings
pub trait SensorStore: Send + Sync {
    /// Readings located in `bbox` and measured within `range`, in no particular order
    fn fetch(&self, bbox: &BoundingBox, range: &TimeRange) -> Result<Vec<SensorReading>>;
}

/// Readings held in memory
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    readings: Vec<SensorReading>,
}

impl MemoryStore {
    /// Store serving the given readings
    pub fn new(readings: Vec<SensorReading>) -> Self {
        MemoryStore { readings }
    }

    /// Load readings from a JSON array of readings
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let readings: Vec<SensorReading> = serde_json::from_str(&content)?;
        debug!(
            "Loaded {} readings from {}",
            readings.len(),
            path.as_ref().display()
        );
        Ok(MemoryStore { readings })
    }

    /// Number of readings
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl SensorStore for MemoryStore {
    fn fetch(&self, bbox: &BoundingBox, range: &TimeRange) -> Result<Vec<SensorReading>> {
        Ok(self
            .readings
            .iter()
            .filter(|r| bbox.contains(r.latitude, r.longitude) && range.contains(&r.timestamp))
            .cloned()
            .collect())
    }
}

/// Bounded retries with exponential backoff and overall timeout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: usize,
    /// Wait before the first retry, doubled at each retry
    pub initial_backoff_ms: u64,
    /// Upper bound of the wait between two attempts
    pub max_backoff_ms: u64,
    /// Overall time budget of a fetch, attempts still running past it are abandoned
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy making a single attempt
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        }
    }

    /// Wait before retry number `retry` (starting at 0)
    pub fn backoff(&self, retry: usize) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32) as u32).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Store wrapper retrying failed fetches according to a [RetryPolicy]
///
/// Each attempt runs on its own thread so that a store which does not answer cannot hold
/// the caller past the policy timeout.
#[derive(Clone, Debug)]
pub struct RetryingStore<S> {
    inner: Arc<S>,
    policy: RetryPolicy,
}

impl<S: SensorStore + 'static> RetryingStore<S> {
    /// Wrap `inner` with the given policy
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        RetryingStore {
            inner: Arc::new(inner),
            policy,
        }
    }

    /// Wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// One fetch waited for at most `budget`, `None` when it did not answer in time
    fn attempt(
        &self,
        bbox: &BoundingBox,
        range: &TimeRange,
        budget: Duration,
    ) -> Result<Option<Result<Vec<SensorReading>>>> {
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let (bbox, range) = (*bbox, *range);
        thread::Builder::new()
            .name("pmkrig-store-fetch".to_string())
            .spawn(move || {
                // the receiver is gone when the attempt was abandoned
                sender.send(inner.fetch(&bbox, &range)).ok();
            })?;
        match receiver.recv_timeout(budget) {
            Ok(res) => Ok(Some(res)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(Some(Err(EstimateError::Store(
                "sensor store fetch panicked".to_string(),
            )))),
        }
    }
}

impl<S: SensorStore + 'static> SensorStore for RetryingStore<S> {
    fn fetch(&self, bbox: &BoundingBox, range: &TimeRange) -> Result<Vec<SensorReading>> {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.policy.timeout_ms);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let budget = timeout.saturating_sub(start.elapsed());
            let err = match self.attempt(bbox, range, budget)? {
                Some(Ok(readings)) => return Ok(readings),
                Some(Err(err)) => err,
                None => {
                    warn!("Sensor store fetch abandoned after {:?}", start.elapsed());
                    return Err(EstimateError::StoreTimeout {
                        attempts,
                        elapsed: start.elapsed(),
                    });
                }
            };
            if attempts > self.policy.max_retries {
                return Err(EstimateError::Store(format!(
                    "{err} (after {attempts} attempts)"
                )));
            }
            let wait = self.policy.backoff(attempts - 1);
            if start.elapsed() + wait >= timeout {
                return Err(EstimateError::StoreTimeout {
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
            warn!("Sensor store fetch failed ({err}), retry {attempts} in {wait:?}");
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hours;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reading(id: &str, lat: f64, h: i64) -> SensorReading {
        SensorReading {
            sensor_id: id.to_string(),
            latitude: lat,
            longitude: -111.9,
            elevation: None,
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(h),
            value: 10.,
            sensor_model: None,
            sensor_source: None,
        }
    }

    /// Fails a given number of times before serving an empty result
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl SensorStore for Flaky {
        fn fetch(&self, _: &BoundingBox, _: &TimeRange) -> Result<Vec<SensorReading>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(EstimateError::Store("unavailable".to_string()))
            } else {
                Ok(vec![])
            }
        }
    }

    /// Answers after a delay
    struct Slow(Duration);

    impl SensorStore for Slow {
        fn fetch(&self, _: &BoundingBox, _: &TimeRange) -> Result<Vec<SensorReading>> {
            std::thread::sleep(self.0);
            Ok(vec![])
        }
    }

    #[test]
    fn test_memory_store_filters() {
        let store = MemoryStore::new(vec![
            reading("a", 40.7, 0),
            reading("b", 42., 0),
            reading("c", 40.7, 10),
        ]);
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + hours(2.));
        let bbox = BoundingBox::around(40.7, -111.9, 10_000.);
        let found = store.fetch(&bbox, &range).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sensor_id, "a");
    }

    #[test]
    fn test_backoff() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(80), Duration::from_millis(350));
    }

    #[test]
    fn test_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            timeout_ms: 10_000,
        };
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + hours(1.));
        let bbox = BoundingBox::around(40.7, -111.9, 1000.);

        let store = RetryingStore::new(
            Flaky {
                failures: 2,
                calls: AtomicUsize::new(0),
            },
            policy,
        );
        assert!(store.fetch(&bbox, &range).is_ok());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);

        let store = RetryingStore::new(
            Flaky {
                failures: 5,
                calls: AtomicUsize::new(0),
            },
            policy,
        );
        assert!(matches!(store.fetch(&bbox, &range), Err(EstimateError::Store(_))));

        let store = RetryingStore::new(
            Flaky {
                failures: 5,
                calls: AtomicUsize::new(0),
            },
            RetryPolicy {
                timeout_ms: 0,
                ..policy
            },
        );
        assert!(matches!(
            store.fetch(&bbox, &range),
            Err(EstimateError::StoreTimeout { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_timeout_bounds_a_blocking_fetch() {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + hours(1.));
        let bbox = BoundingBox::around(40.7, -111.9, 1000.);
        let policy = RetryPolicy {
            timeout_ms: 100,
            ..RetryPolicy::default()
        };

        let store = RetryingStore::new(Slow(Duration::from_secs(2)), policy);
        let now = Instant::now();
        let res = store.fetch(&bbox, &range);
        assert!(now.elapsed() < Duration::from_millis(500), "{:?}", now.elapsed());
        assert!(matches!(
            res,
            Err(EstimateError::StoreTimeout { attempts: 1, .. })
        ));

        let store = RetryingStore::new(Slow(Duration::from_millis(10)), policy);
        assert!(store.fetch(&bbox, &range).unwrap().is_empty());
    }
}
