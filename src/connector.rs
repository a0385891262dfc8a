//! Connection management for registry consumers.
//!
//! A [`ServiceConnector`] wraps "find a service and connect to it" in a
//! small state machine with backoff and a circuit breaker, so a flapping
//! target cannot turn every caller into a tight retry loop. The state
//! machine is shared between the async and blocking entry points; the
//! connector is meant to be invoked once per polling cycle, with the
//! caller owning the cadence.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::record::ServiceRecord;
use crate::settings::ConnectorSettings;

/// Where the connector currently stands with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Too many consecutive failures; attempts are rejected until the
    /// open duration elapses.
    CircuitOpen,
}

/// How the retry interval grows with consecutive failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// How much randomness is applied to a computed interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    None,
    /// Uniform in `[0, interval]`.
    Full,
    /// `interval/2` plus uniform in `[0, interval/2]`.
    #[default]
    Equal,
    /// Uniform in `[0.9 * interval, 1.1 * interval]`.
    Percent10,
}

/// Pre-jitter retry interval in seconds for the given attempt number
/// (0-based count of failures so far).
pub fn calculate_retry_interval(
    strategy: BackoffStrategy,
    base: u64,
    max: u64,
    attempt: u32,
) -> u64 {
    let raw = match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.saturating_add(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            if attempt >= 63 {
                u64::MAX
            } else {
                base.saturating_mul(1u64 << attempt)
            }
        }
    };
    raw.min(max)
}

/// Apply jitter to an interval, returning fractional seconds.
pub fn apply_jitter(strategy: JitterStrategy, interval: u64) -> f64 {
    let interval = interval as f64;
    let mut rng = rand::thread_rng();
    match strategy {
        JitterStrategy::None => interval,
        JitterStrategy::Full => rng.gen_range(0.0..=interval.max(f64::MIN_POSITIVE)),
        JitterStrategy::Equal => {
            interval / 2.0 + rng.gen_range(0.0..=(interval / 2.0).max(f64::MIN_POSITIVE))
        }
        JitterStrategy::Percent10 => rng.gen_range(interval * 0.9..=interval * 1.1),
    }
}

#[derive(Debug)]
struct ConnectorInner {
    state: ConnectionState,
    failure_count: u32,
    /// Pre-jitter interval before the next retry, seconds.
    retry_interval: u64,
    circuit_opened_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
}

/// Circuit-breaking connector around a connect function.
///
/// The connector tracks state and timing; the actual connection is made
/// by the closure handed to [`ServiceConnector::attempt`] (async) or
/// [`ServiceConnector::attempt_blocking`], which runs outside the state
/// lock so a slow target never blocks state queries.
#[derive(Debug, Clone)]
pub struct ServiceConnector {
    name: String,
    settings: ConnectorSettings,
    inner: Arc<Mutex<ConnectorInner>>,
}

impl ServiceConnector {
    pub fn new(name: impl Into<String>, settings: ConnectorSettings) -> Self {
        let retry_interval = settings.base_retry_interval;
        Self {
            name: name.into(),
            settings,
            inner: Arc::new(Mutex::new(ConnectorInner {
                state: ConnectionState::Disconnected,
                failure_count: 0,
                retry_interval,
                circuit_opened_at: None,
                last_attempt_at: None,
            })),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Pre-jitter interval a caller should wait before the next retry,
    /// in seconds.
    pub fn retry_interval(&self) -> u64 {
        self.inner.lock().retry_interval
    }

    /// The retry interval with this connector's jitter applied, as
    /// fractional seconds. Sampled fresh on every call.
    pub fn jittered_retry_interval(&self) -> f64 {
        apply_jitter(self.settings.jitter, self.retry_interval())
    }

    /// Whether an attempt would currently be admitted.
    ///
    /// While the circuit is open this is false until the open duration
    /// elapses; that first query after the duration closes the breaker
    /// and resets the failure accounting. Otherwise an attempt is due
    /// once `retry_interval` has passed since the last one.
    pub fn should_attempt(&self) -> bool {
        self.should_attempt_at(Utc::now())
    }

    fn should_attempt_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::CircuitOpen {
            let open_for = ChronoDuration::seconds(self.settings.circuit_open_duration as i64);
            return match inner.circuit_opened_at {
                Some(opened) if now - opened >= open_for => {
                    info!(connector = %self.name, "circuit breaker closing after open duration");
                    inner.state = ConnectionState::Disconnected;
                    inner.circuit_opened_at = None;
                    inner.failure_count = 0;
                    inner.retry_interval = self.settings.base_retry_interval;
                    true
                }
                Some(_) => false,
                None => true,
            };
        }
        match inner.last_attempt_at {
            Some(last) => now - last >= ChronoDuration::seconds(inner.retry_interval as i64),
            None => true,
        }
    }

    /// Run one connection attempt through the state machine.
    ///
    /// Rejected with [`RegistryError::CircuitOpen`] while the circuit is
    /// open, and with [`RegistryError::RetryPending`] while the retry
    /// interval since the last attempt has not elapsed.
    pub async fn attempt<T, F, Fut>(&self, connect: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.admit(Utc::now())?;
        match connect().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(Utc::now());
                Err(err)
            }
        }
    }

    /// Blocking counterpart of [`ServiceConnector::attempt`].
    pub fn attempt_blocking<T, F>(&self, connect: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.admit(Utc::now())?;
        match connect() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(Utc::now());
                Err(err)
            }
        }
    }

    fn admit(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.should_attempt_at(now) {
            let inner = self.inner.lock();
            return if inner.state == ConnectionState::CircuitOpen {
                Err(RegistryError::CircuitOpen { target: self.name.clone() })
            } else {
                Err(RegistryError::RetryPending {
                    target: self.name.clone(),
                    retry_secs: inner.retry_interval,
                })
            };
        }
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Connecting;
        inner.last_attempt_at = Some(now);
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Connected;
        inner.failure_count = 0;
        inner.retry_interval = self.settings.base_retry_interval;
        inner.circuit_opened_at = None;
        debug!(connector = %self.name, "connected");
    }

    fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.retry_interval = calculate_retry_interval(
            self.settings.backoff,
            self.settings.base_retry_interval,
            self.settings.max_retry_interval,
            inner.failure_count.saturating_sub(1),
        );
        if inner.failure_count >= self.settings.max_failures {
            inner.state = ConnectionState::CircuitOpen;
            inner.circuit_opened_at = Some(now);
            warn!(
                connector = %self.name,
                failures = inner.failure_count,
                open_secs = self.settings.circuit_open_duration,
                "circuit breaker opened"
            );
        } else {
            inner.state = ConnectionState::Disconnected;
            debug!(
                connector = %self.name,
                failures = inner.failure_count,
                retry_secs = inner.retry_interval,
                "connection attempt failed"
            );
        }
    }

    /// Record a failed caller-side health check: drop back to
    /// `Disconnected` without touching failure accounting, so the next
    /// due [`ServiceConnector::attempt`] reconnects.
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Disconnected;
        }
    }

    /// Pick the endpoint of a discovered record through the connector,
    /// counting discovery failures against the breaker too.
    pub async fn connect_endpoint<F, Fut>(&self, discover: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ServiceRecord>>,
    {
        self.attempt(|| async { Ok(discover().await?.endpoint()) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_failures: u32, base: u64) -> ConnectorSettings {
        ConnectorSettings {
            base_retry_interval: base,
            max_retry_interval: 300,
            max_failures,
            circuit_open_duration: 60,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }

    #[test]
    fn test_exponential_backoff_monotone_until_cap() {
        let mut previous = 0;
        for attempt in 0..=12 {
            let interval =
                calculate_retry_interval(BackoffStrategy::Exponential, 1, 300, attempt);
            assert!(interval >= previous, "interval decreased at attempt {attempt}");
            assert!(interval <= 300);
            previous = interval;
        }
        assert_eq!(calculate_retry_interval(BackoffStrategy::Exponential, 1, 300, 12), 300);
    }

    #[test]
    fn test_backoff_shapes() {
        assert_eq!(calculate_retry_interval(BackoffStrategy::Fixed, 2, 300, 7), 2);
        assert_eq!(calculate_retry_interval(BackoffStrategy::Linear, 2, 300, 3), 5);
        assert_eq!(calculate_retry_interval(BackoffStrategy::Exponential, 1, 300, 0), 1);
        assert_eq!(calculate_retry_interval(BackoffStrategy::Exponential, 1, 300, 3), 8);
        // Saturation never overflows.
        assert_eq!(calculate_retry_interval(BackoffStrategy::Exponential, 10, 500, 200), 500);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let full = apply_jitter(JitterStrategy::Full, 10);
            assert!((0.0..=10.0).contains(&full));
            let equal = apply_jitter(JitterStrategy::Equal, 10);
            assert!((5.0..=10.0).contains(&equal));
            let pct = apply_jitter(JitterStrategy::Percent10, 10);
            assert!((9.0..=11.0).contains(&pct));
        }
        assert_eq!(apply_jitter(JitterStrategy::None, 10), 10.0);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        // Base interval 0 so back-to-back attempts are admitted.
        let connector = ServiceConnector::new("hexapod", settings(3, 0));
        for _ in 0..3 {
            let result: Result<()> = connector
                .attempt(|| async { Err(RegistryError::Other("refused".into())) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(connector.state(), ConnectionState::CircuitOpen);
        assert_eq!(connector.failure_count(), 3);
        assert!(!connector.should_attempt());

        // While open, the connect function must not even run.
        let result: Result<()> = connector
            .attempt(|| async { panic!("attempt admitted while circuit open") })
            .await;
        assert!(matches!(result, Err(RegistryError::CircuitOpen { .. })));
    }

    #[test]
    fn test_pacing_rejects_early_retry() {
        let connector = ServiceConnector::new("daq", settings(5, 1));
        let result: Result<()> =
            connector.attempt_blocking(|| Err(RegistryError::Other("refused".into())));
        assert!(result.is_err());
        assert_eq!(connector.state(), ConnectionState::Disconnected);

        // Retry interval (1s) has not elapsed yet.
        assert!(!connector.should_attempt());
        let result: Result<()> = connector.attempt_blocking(|| Ok(()));
        assert!(matches!(result, Err(RegistryError::RetryPending { .. })));
    }

    #[test]
    fn test_success_resets_backoff() {
        let connector = ServiceConnector::new("daq", settings(5, 1));
        let now = Utc::now();
        for _ in 0..3 {
            connector.record_failure(now);
        }
        assert_eq!(connector.failure_count(), 3);
        assert_eq!(connector.retry_interval(), 4);

        connector.record_success();
        assert_eq!(connector.state(), ConnectionState::Connected);
        assert_eq!(connector.failure_count(), 0);
        assert_eq!(connector.retry_interval(), 1);
    }

    #[tokio::test]
    async fn test_circuit_closes_after_open_duration() {
        let mut cfg = settings(1, 0);
        cfg.circuit_open_duration = 0;
        let connector = ServiceConnector::new("probe", cfg);

        let _: Result<()> = connector
            .attempt(|| async { Err(RegistryError::Other("refused".into())) })
            .await;
        assert_eq!(connector.state(), ConnectionState::CircuitOpen);

        // Zero open duration: the breaker closes on the next query and
        // resets the failure accounting.
        assert!(connector.should_attempt());
        assert_eq!(connector.failure_count(), 0);
        let ok: Result<()> = connector.attempt(|| async { Ok(()) }).await;
        assert!(ok.is_ok());
        assert_eq!(connector.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_health_check_failure_disconnects() {
        let connector = ServiceConnector::new("daq", settings(5, 0));
        let ok: Result<()> = connector.attempt_blocking(|| Ok(()));
        assert!(ok.is_ok());
        assert_eq!(connector.state(), ConnectionState::Connected);

        connector.mark_disconnected();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        // Failure count untouched: the next attempt starts at base.
        assert_eq!(connector.failure_count(), 0);
        let ok: Result<()> = connector.attempt_blocking(|| Ok(()));
        assert!(ok.is_ok());
    }
}
