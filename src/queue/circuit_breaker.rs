//! Per-remote-host circuit breaker (§4.6).
//!
//! A `Mutex`-guarded per-host map (§5: "per-host entry mutated under a per-entry lock").

use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Mutex, time::Duration};

/// Default consecutive-failure threshold before a circuit opens.
pub const DEFAULT_THRESHOLD: u32 = 5;
/// Default time a circuit stays open before allowing a half-open probe.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct HostState {
    state: State,
    failure_count: u32,
    opens_until: Option<DateTime<Utc>>,
}

impl Default for HostState {
    fn default() -> Self {
        HostState {
            state: State::Closed,
            failure_count: 0,
            opens_until: None,
        }
    }
}

/// Observable snapshot of one host's breaker state.
#[derive(Clone, Copy, Debug)]
pub struct BreakerStatus {
    pub failure_count: u32,
    pub opens_until: Option<DateTime<Utc>>,
}

/// Shared, per-host circuit breaker registry (§4.6, §5).
pub struct CircuitBreakerRegistry {
    threshold: u32,
    reset_timeout: Duration,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        CircuitBreakerRegistry {
            threshold,
            reset_timeout,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether a delivery attempt to `host` is currently allowed. A half-open circuit
    /// allows exactly the first call after the reset timeout elapses; that call transitions the
    /// state to `HalfOpen` so a concurrent second caller is not also let through.
    pub fn is_allowed(&self, host: &str, now: DateTime<Utc>) -> bool {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hosts.entry(host.to_string()).or_default();
        match entry.state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open => {
                if entry.opens_until.is_some_and(|until| now >= until) {
                    entry.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful delivery to `host`. Resets the failure count and, if the circuit was
    /// half-open, fully closes it.
    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hosts.entry(host.to_string()).or_default();
        entry.state = State::Closed;
        entry.failure_count = 0;
        entry.opens_until = None;
    }

    /// Records a failed delivery to `host`. Opens the circuit once `failure_count` reaches the
    /// configured threshold (closed path) or immediately on a half-open probe failure.
    pub fn record_failure(&self, host: &str, now: DateTime<Utc>) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hosts.entry(host.to_string()).or_default();
        match entry.state {
            State::HalfOpen => {
                entry.state = State::Open;
                entry.opens_until = Some(now + self.reset_timeout);
            }
            State::Closed | State::Open => {
                entry.failure_count += 1;
                if entry.failure_count >= self.threshold {
                    entry.state = State::Open;
                    entry.opens_until = Some(now + self.reset_timeout);
                }
            }
        }
    }

    /// Snapshot of a single host's state, for diagnostics/admin surfaces.
    pub fn status(&self, host: &str) -> BreakerStatus {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        match hosts.get(host) {
            Some(entry) => BreakerStatus {
                failure_count: entry.failure_count,
                opens_until: entry.opens_until,
            },
            None => BreakerStatus {
                failure_count: 0,
                opens_until: None,
            },
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        CircuitBreakerRegistry::new(DEFAULT_THRESHOLD, DEFAULT_RESET_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn opens_after_threshold_then_half_opens_after_timeout() {
        let breaker = CircuitBreakerRegistry::new(3, Duration::from_millis(10));
        let t0 = Utc::now();
        for _ in 0..3 {
            breaker.record_failure("h", t0);
        }
        assert!(!breaker.is_allowed("h", t0));

        let later = t0 + ChronoDuration::milliseconds(15);
        assert!(breaker.is_allowed("h", later));
        // second concurrent caller must not also be let through while half-open
        assert!(!breaker.is_allowed("h", later));
    }

    #[test]
    fn half_open_failure_reopens_half_open_success_closes() {
        let breaker = CircuitBreakerRegistry::new(3, Duration::from_millis(10));
        let t0 = Utc::now();
        for _ in 0..3 {
            breaker.record_failure("h", t0);
        }
        let probe_time = t0 + ChronoDuration::milliseconds(15);
        assert!(breaker.is_allowed("h", probe_time));
        breaker.record_failure("h", probe_time);
        assert!(!breaker.is_allowed("h", probe_time));

        let probe_time2 = probe_time + ChronoDuration::milliseconds(15);
        assert!(breaker.is_allowed("h", probe_time2));
        breaker.record_success("h");
        assert!(breaker.is_allowed("h", probe_time2));
        assert_eq!(breaker.status("h").failure_count, 0);
    }

    #[test]
    fn success_before_threshold_resets_count() {
        let breaker = CircuitBreakerRegistry::new(5, Duration::from_secs(60));
        let t0 = Utc::now();
        breaker.record_failure("h", t0);
        breaker.record_failure("h", t0);
        breaker.record_success("h");
        assert_eq!(breaker.status("h").failure_count, 0);
    }
}
