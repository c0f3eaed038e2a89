//! Component G: per-extension circuit breaker.
//!
//! Grounded on the pack's `harborgrid-justin-rusty-db::orchestration::circuit_breaker`
//! (state machine + atomic counters + `parking_lot::RwLock`-guarded transition
//! state), generalized from one global breaker to a name-keyed map and
//! retuned to this system's defaults.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::errors::CoreError;
use crate::result::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Max concurrent probe requests allowed while half-open.
    pub max_requests_in_half_open: u32,
    /// Window over which request/failure counts are sampled.
    pub sampling_interval: Duration,
    /// How long the breaker stays open before probing again.
    pub open_state_timeout: Duration,
    /// Minimum sampled requests before `ready_to_trip` is even evaluated.
    pub min_requests: u32,
    /// Failure ratio (0.0-1.0) that trips the breaker once `min_requests` is met.
    pub failure_ratio_threshold: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests_in_half_open: 100,
            sampling_interval: Duration::from_secs(5),
            open_state_timeout: Duration::from_secs(3),
            min_requests: 3,
            failure_ratio_threshold: 0.6,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BreakerStats {
    pub requests: u64,
    pub failures: u64,
    pub rejections: u64,
}

struct Transition {
    state: BreakerState,
    since: Instant,
    window_start: Instant,
    window_requests: u32,
    window_failures: u32,
    half_open_inflight: u32,
}

/// One breaker guarding calls to a single extension.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    transition: RwLock<Transition>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            config,
            transition: RwLock::new(Transition {
                state: BreakerState::Closed,
                since: now,
                window_start: now,
                window_requests: 0,
                window_failures: 0,
                half_open_inflight: 0,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    pub fn state(&self) -> BreakerState {
        self.maybe_transition_to_half_open();
        self.transition.read().state
    }

    fn maybe_transition_to_half_open(&self) {
        let mut t = self.transition.write();
        if t.state == BreakerState::Open && t.since.elapsed() >= self.config.open_state_timeout {
            t.state = BreakerState::HalfOpen;
            t.since = Instant::now();
            t.half_open_inflight = 0;
        }
    }

    fn roll_window_if_needed(&self, t: &mut Transition) {
        if t.window_start.elapsed() >= self.config.sampling_interval {
            t.window_start = Instant::now();
            t.window_requests = 0;
            t.window_failures = 0;
        }
    }

    /// Run `f` through the breaker: rejects immediately while open, caps
    /// concurrent probes while half-open, and records the outcome. `f`'s
    /// error is passed through unchanged so callers keep their own error
    /// variants (`BreakerOpen` is only ever produced by this method itself).
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.maybe_transition_to_half_open();

        {
            let mut t = self.transition.write();
            match t.state {
                BreakerState::Open => {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(CoreError::BreakerOpen(self.name.clone()));
                }
                BreakerState::HalfOpen => {
                    if t.half_open_inflight >= self.config.max_requests_in_half_open {
                        self.total_rejections.fetch_add(1, Ordering::Relaxed);
                        return Err(CoreError::BreakerOpen(self.name.clone()));
                    }
                    t.half_open_inflight += 1;
                }
                BreakerState::Closed => {}
            }
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let outcome = f.await;

        let mut t = self.transition.write();
        self.roll_window_if_needed(&mut t);
        t.window_requests += 1;

        match outcome {
            Ok(value) => {
                if t.state == BreakerState::HalfOpen {
                    t.state = BreakerState::Closed;
                    t.since = Instant::now();
                    t.window_requests = 0;
                    t.window_failures = 0;
                }
                Ok(value)
            }
            Err(e) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                t.window_failures += 1;
                let ratio = t.window_failures as f64 / t.window_requests as f64;
                let should_trip = t.window_requests >= self.config.min_requests
                    && ratio >= self.config.failure_ratio_threshold;
                if should_trip || t.state == BreakerState::HalfOpen {
                    t.state = BreakerState::Open;
                    t.since = Instant::now();
                }
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            requests: self.total_requests.load(Ordering::Relaxed),
            failures: self.total_failures.load(Ordering::Relaxed),
            rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Name-keyed map of breakers, one created per extension that registers routes.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        let mut w = self.breakers.write();
        w.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_defaults(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        self.breakers.write().remove(name);
    }

    pub async fn execute<F, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.get(name) {
            Some(b) => b.execute(f).await,
            None => Err(CoreError::BreakerMissing(name.to_string())),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, BreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boom<T>() -> Result<T> {
        Err(CoreError::Other(anyhow::anyhow!("boom")))
    }

    #[tokio::test]
    async fn trips_open_after_failure_ratio_exceeded() {
        let breaker = CircuitBreaker::with_defaults("svc");
        for _ in 0..3 {
            let _ = breaker.execute(async { boom::<()>() }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn rejects_while_open() {
        let breaker = CircuitBreaker::new(
            "svc",
            BreakerConfig {
                open_state_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        for _ in 0..3 {
            let _ = breaker.execute(async { boom::<()>() }).await;
        }
        let err = breaker.execute(async { Ok(1) }).await;
        assert!(matches!(err, Err(CoreError::BreakerOpen(_))));
    }

    #[tokio::test]
    async fn half_open_closes_on_success() {
        let breaker = CircuitBreaker::new(
            "svc",
            BreakerConfig {
                open_state_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        for _ in 0..3 {
            let _ = breaker.execute(async { boom::<()>() }).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let ok = breaker.execute(async { Ok(1) }).await;
        assert!(ok.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn missing_breaker_errors() {
        let registry = BreakerRegistry::new();
        assert!(registry.get("ghost").is_none());
    }
}
