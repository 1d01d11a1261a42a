// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::thread;
use std::time::Duration;

/// How often a fallible probe is re-run and how long to wait between
/// attempts.
///
/// Discovery itself never retries. Callers wrap whole operations in a
/// policy, which keeps transient boot-time races (an interface without
/// its address yet, a VF still enumerating) out of the engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts,
            delay,
            backoff: 1.0,
        }
    }

    pub const fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Tuned for full-inventory discovery right after guest boot.
    pub const fn discovery() -> Self {
        RetryPolicy::new(15, Duration::from_secs(3)).with_backoff(1.15)
    }

    /// Tuned for VF add/remove settling after a driver rebind.
    pub const fn vf_presence() -> Self {
        RetryPolicy::new(30, Duration::from_secs(2))
    }

    // Sleep to apply after the next failed attempt.
    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.backoff)
    }

    /// Run `op` until it succeeds or the attempts are exhausted,
    /// returning the last error. The sleep grows by `backoff` after
    /// every failed attempt. `op` always runs at least once.
    pub fn retry<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut delay = self.delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.attempts {
                        return Err(e);
                    }
                    debug!(
                        "attempt {attempt}/{} failed: {e}; next try in {delay:?}",
                        self.attempts
                    );
                    thread::sleep(delay);
                    delay = self.next_delay(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<u32, &str> = policy.retry(|| {
            calls += 1;
            if calls < 3 {
                Err("not yet")
            } else {
                Ok(42)
            }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhausts_attempts() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<(), String> = policy.retry(|| {
            calls += 1;
            Err(format!("failure {calls}"))
        });
        assert_eq!(result, Err("failure 4".to_string()));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_retry_runs_at_least_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<(), &str> = policy.retry(|| {
            calls += 1;
            Err("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_default_policies() {
        let discovery = RetryPolicy::discovery();
        assert_eq!(discovery.attempts, 15);
        assert_eq!(discovery.delay, Duration::from_secs(3));
        assert!((discovery.backoff - 1.15).abs() < f64::EPSILON);

        let vf = RetryPolicy::vf_presence();
        assert_eq!(vf.attempts, 30);
        assert_eq!(vf.delay, Duration::from_secs(2));
        assert!((vf.backoff - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_grows_delay() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_backoff(2.0);
        let mut delay = policy.delay;
        let mut schedule = Vec::new();
        for _ in 0..3 {
            schedule.push(delay);
            delay = policy.next_delay(delay);
        }
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );

        let flat = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(flat.next_delay(flat.delay), Duration::from_millis(100));
    }

    #[test]
    fn test_discovery_backoff_schedule() {
        // 3s grows to ~3.45s, then ~3.97s.
        let policy = RetryPolicy::discovery();
        let second = policy.next_delay(policy.delay);
        assert!(second > Duration::from_millis(3440));
        assert!(second < Duration::from_millis(3460));
        let third = policy.next_delay(second);
        assert!(third > Duration::from_millis(3960));
        assert!(third < Duration::from_millis(3980));
    }
}
