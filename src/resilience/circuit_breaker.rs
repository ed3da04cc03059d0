//! Keyed circuit breaker
//!
//! One finite state machine per `(scope, operation)` key, guarding external
//! side-effectful calls (chain transactions foremost). State survives worker
//! restarts: every transition writes through the persistence gateway and
//! entries are reloaded lazily on first touch.

use crate::config::BreakerConfig;
use crate::error::{EngineError, EngineResult};
use crate::state::{CircuitRecord, CircuitStateKind, SharedGateway};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Breaker key: an external-system scope paired with the operation class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    /// External system + principal, e.g. `"1328:0xdeadbeef"`
    pub scope: String,
    /// Operation class, e.g. `"transaction"`
    pub operation: String,
}

impl BreakerKey {
    pub fn new(scope: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            operation: operation.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}:{}", self.scope, self.operation)
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.operation)
    }
}

struct Entry {
    record: CircuitRecord,
    /// Half-open admits exactly one probe at a time
    probe_in_flight: bool,
}

/// Process-wide circuit breaker registry. Access per key is serialized by a
/// short async critical section.
pub struct CircuitBreaker {
    config: BreakerConfig,
    gateway: SharedGateway,
    entries: DashMap<String, Arc<Mutex<Entry>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, gateway: SharedGateway) -> Self {
        Self {
            config,
            gateway,
            entries: DashMap::new(),
        }
    }

    async fn entry(&self, key: &BreakerKey) -> EngineResult<Arc<Mutex<Entry>>> {
        let storage_key = key.storage_key();
        if let Some(existing) = self.entries.get(&storage_key) {
            return Ok(existing.clone());
        }
        let record = self
            .gateway
            .load_circuit(&storage_key)
            .await?
            .unwrap_or_default();
        let entry = Arc::new(Mutex::new(Entry {
            record,
            probe_in_flight: false,
        }));
        Ok(self
            .entries
            .entry(storage_key)
            .or_insert(entry)
            .value()
            .clone())
    }

    /// Gate a call. `Ok` admits it (closed, or the single half-open probe);
    /// `Err(CircuitOpen)` refuses without invoking the handler.
    pub async fn check(&self, key: &BreakerKey) -> EngineResult<()> {
        let entry = self.entry(key).await?;
        let mut guard = entry.lock().await;
        match guard.record.state {
            CircuitStateKind::Closed => Ok(()),
            CircuitStateKind::Open => {
                let cooled_down = guard
                    .record
                    .opened_at
                    .map(|t| {
                        Utc::now().signed_duration_since(t).to_std().unwrap_or_default()
                            >= self.config.cooldown
                    })
                    .unwrap_or(true);
                if cooled_down {
                    guard.record.state = CircuitStateKind::HalfOpen;
                    guard.probe_in_flight = true;
                    self.persist(key, &guard.record).await?;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen(key.to_string()))
                }
            }
            CircuitStateKind::HalfOpen => {
                if guard.probe_in_flight {
                    Err(EngineError::CircuitOpen(key.to_string()))
                } else {
                    guard.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call: close the circuit and reset counters.
    pub async fn record_success(&self, key: &BreakerKey) -> EngineResult<()> {
        let entry = self.entry(key).await?;
        let mut guard = entry.lock().await;
        guard.probe_in_flight = false;
        guard.record.state = CircuitStateKind::Closed;
        guard.record.consecutive_failures = 0;
        guard.record.opened_at = None;
        guard.record.last_success_at = Some(Utc::now());
        self.persist(key, &guard.record).await
    }

    /// Record a failed call: bump the counter, trip to open past the
    /// threshold, and re-open immediately on a failed probe.
    pub async fn record_failure(&self, key: &BreakerKey) -> EngineResult<()> {
        let entry = self.entry(key).await?;
        let mut guard = entry.lock().await;
        match guard.record.state {
            CircuitStateKind::HalfOpen => {
                guard.probe_in_flight = false;
                guard.record.state = CircuitStateKind::Open;
                guard.record.opened_at = Some(Utc::now());
            }
            _ => {
                guard.record.consecutive_failures += 1;
                if guard.record.consecutive_failures >= self.config.threshold {
                    guard.record.state = CircuitStateKind::Open;
                    guard.record.opened_at = Some(Utc::now());
                }
            }
        }
        self.persist(key, &guard.record).await
    }

    /// Current state, for diagnostics and tests.
    pub async fn state(&self, key: &BreakerKey) -> EngineResult<CircuitRecord> {
        let entry = self.entry(key).await?;
        let guard = entry.lock().await;
        Ok(guard.record.clone())
    }

    async fn persist(&self, key: &BreakerKey, record: &CircuitRecord) -> EngineResult<()> {
        self.gateway.save_circuit(&key.storage_key(), record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SledGateway;
    use std::time::Duration;

    fn breaker(threshold: u32, cooldown: Duration) -> (CircuitBreaker, SharedGateway) {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        (
            CircuitBreaker::new(
                BreakerConfig { threshold, cooldown },
                gateway.clone(),
            ),
            gateway,
        )
    }

    #[tokio::test]
    async fn trips_open_at_threshold() {
        let (cb, _gw) = breaker(3, Duration::from_secs(60));
        let key = BreakerKey::new("1328:0xabc", "transaction");
        for _ in 0..3 {
            cb.check(&key).await.unwrap();
            cb.record_failure(&key).await.unwrap();
        }
        let state = cb.state(&key).await.unwrap();
        assert_eq!(state.state, CircuitStateKind::Open);
        assert!(matches!(
            cb.check(&key).await,
            Err(EngineError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let (cb, _gw) = breaker(3, Duration::from_secs(60));
        let key = BreakerKey::new("1328:0xabc", "transaction");
        cb.record_failure(&key).await.unwrap();
        cb.record_failure(&key).await.unwrap();
        cb.record_success(&key).await.unwrap();
        let state = cb.state(&key).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_success_at.is_some());
    }

    #[tokio::test]
    async fn probe_after_cooldown_closes_on_success() {
        let (cb, _gw) = breaker(1, Duration::from_millis(20));
        let key = BreakerKey::new("s", "op");
        cb.record_failure(&key).await.unwrap();
        assert!(cb.check(&key).await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // cooled down: single probe admitted
        cb.check(&key).await.unwrap();
        // a second caller is refused while the probe is out
        assert!(cb.check(&key).await.is_err());
        cb.record_success(&key).await.unwrap();
        assert_eq!(
            cb.state(&key).await.unwrap().state,
            CircuitStateKind::Closed
        );
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let (cb, _gw) = breaker(1, Duration::from_millis(10));
        let key = BreakerKey::new("s", "op");
        cb.record_failure(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        cb.check(&key).await.unwrap();
        cb.record_failure(&key).await.unwrap();
        assert_eq!(cb.state(&key).await.unwrap().state, CircuitStateKind::Open);
        assert!(cb.check(&key).await.is_err());
    }

    #[tokio::test]
    async fn state_survives_registry_restart() {
        let gateway: SharedGateway = Arc::new(SledGateway::open_temporary().unwrap());
        let config = BreakerConfig {
            threshold: 1,
            cooldown: Duration::from_secs(60),
        };
        let key = BreakerKey::new("s", "op");
        {
            let cb = CircuitBreaker::new(config.clone(), gateway.clone());
            cb.record_failure(&key).await.unwrap();
        }
        // fresh registry over the same gateway sees the open circuit
        let cb = CircuitBreaker::new(config, gateway);
        assert!(matches!(
            cb.check(&key).await,
            Err(EngineError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let (cb, _gw) = breaker(1, Duration::from_secs(60));
        let hot = BreakerKey::new("1328:0xabc", "transaction");
        let cold = BreakerKey::new("1328:0xother", "transaction");
        cb.record_failure(&hot).await.unwrap();
        assert!(cb.check(&hot).await.is_err());
        assert!(cb.check(&cold).await.is_ok());
    }
}
