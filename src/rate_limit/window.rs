//! Window Counters
//!
//! The counting core of the rate limiter. A counter belongs to exactly one
//! (credential, endpoint) key and is only ever touched under that key's lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::config::WindowStrategy;

/// Start of the window containing `now_ms`: floor(now / period) * period
pub fn window_start_ms(now_ms: i64, period_ms: i64) -> i64 {
    now_ms.div_euclid(period_ms) * period_ms
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Outcome of a single check-and-increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowDecision {
    Admit {
        /// Requests left in this window after this one
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    Deny {
        retry_after: Duration,
        reset_at: DateTime<Utc>,
    },
}

/// Live counter for the current window of one key
#[derive(Debug, Clone, Default)]
pub struct WindowCounter {
    window_start_ms: i64,
    period_ms: i64,
    count: u32,
    /// Count of the window immediately before the current one
    previous_count: u32,
    /// Set by the pruner once the counter has left the arena
    pub(crate) retired: bool,
}

/// Read-only view of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub count: u32,
    pub limit: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to the window containing `now_ms`; a stale window is discarded
    fn roll(&mut self, now_ms: i64, period_ms: i64) {
        let start = window_start_ms(now_ms, period_ms);
        if start == self.window_start_ms && period_ms == self.period_ms {
            return;
        }
        self.previous_count =
            if period_ms == self.period_ms && start == self.window_start_ms + period_ms {
                self.count
            } else {
                0
            };
        self.window_start_ms = start;
        self.period_ms = period_ms;
        self.count = 0;
    }

    /// Atomic admit/deny for one request at `now`
    pub fn try_admit(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
        period: Duration,
        strategy: WindowStrategy,
    ) -> WindowDecision {
        let now_ms = now.timestamp_millis();
        let period_ms = (period.as_millis() as i64).max(1);
        self.roll(now_ms, period_ms);

        let window_end_ms = self.window_start_ms + period_ms;
        let reset_at = millis_to_datetime(window_end_ms);
        let until_reset = Duration::from_millis((window_end_ms - now_ms).max(0) as u64);

        match strategy {
            WindowStrategy::Fixed => {
                if self.count < limit {
                    self.count += 1;
                    WindowDecision::Admit {
                        remaining: limit - self.count,
                        reset_at,
                    }
                } else {
                    WindowDecision::Deny {
                        retry_after: until_reset,
                        reset_at,
                    }
                }
            }
            WindowStrategy::Sliding => {
                let elapsed_ms = now_ms - self.window_start_ms;
                let carry = 1.0 - elapsed_ms as f64 / period_ms as f64;
                let estimate = self.previous_count as f64 * carry + self.count as f64;

                if estimate + 1.0 <= limit as f64 {
                    self.count += 1;
                    let remaining = (limit as f64 - estimate - 1.0).floor().max(0.0) as u32;
                    WindowDecision::Admit {
                        remaining,
                        reset_at,
                    }
                } else if self.count + 1 > limit || self.previous_count == 0 {
                    WindowDecision::Deny {
                        retry_after: until_reset,
                        reset_at,
                    }
                } else {
                    // Wait until the previous window's weight has decayed enough
                    let headroom = (limit - self.count - 1) as f64;
                    let target_carry = headroom / self.previous_count as f64;
                    let at_elapsed = ((1.0 - target_carry) * period_ms as f64).ceil() as i64;
                    let wait_ms = (at_elapsed - elapsed_ms).clamp(1, window_end_ms - now_ms);
                    WindowDecision::Deny {
                        retry_after: Duration::from_millis(wait_ms.max(1) as u64),
                        reset_at,
                    }
                }
            }
        }
    }

    /// Count in the window containing `now` without modifying the counter
    pub fn usage_at(&self, now: DateTime<Utc>, limit: u32, period: Duration) -> WindowUsage {
        let period_ms = (period.as_millis() as i64).max(1);
        let start = window_start_ms(now.timestamp_millis(), period_ms);
        let count = if start == self.window_start_ms && period_ms == self.period_ms {
            self.count
        } else {
            0
        };
        WindowUsage {
            count,
            limit,
            window_start: millis_to_datetime(start),
        }
    }

    /// True once neither the current nor the previous window can matter
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.period_ms == 0 || now.timestamp_millis() >= self.window_start_ms + 2 * self.period_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_fixed_window_admits_up_to_limit() {
        let mut counter = WindowCounter::new();
        let t = at(600); // exactly on a boundary

        for expected_remaining in [2, 1, 0] {
            assert_eq!(
                counter.try_admit(t, 3, MINUTE, WindowStrategy::Fixed),
                WindowDecision::Admit {
                    remaining: expected_remaining,
                    reset_at: at(660)
                }
            );
        }

        match counter.try_admit(at(615), 3, MINUTE, WindowStrategy::Fixed) {
            WindowDecision::Deny { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(45));
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn test_fixed_window_resets_at_boundary() {
        let mut counter = WindowCounter::new();
        for _ in 0..3 {
            counter.try_admit(at(610), 3, MINUTE, WindowStrategy::Fixed);
        }
        assert!(matches!(
            counter.try_admit(at(659), 3, MINUTE, WindowStrategy::Fixed),
            WindowDecision::Deny { .. }
        ));

        let decision = counter.try_admit(at(660), 3, MINUTE, WindowStrategy::Fixed);
        assert!(matches!(decision, WindowDecision::Admit { remaining: 2, .. }));
        assert_eq!(counter.usage_at(at(660), 3, MINUTE).count, 1);
    }

    #[test]
    fn test_fixed_window_boundary_burst_is_allowed() {
        let mut counter = WindowCounter::new();
        let mut admitted = 0;
        for t in [659, 659, 659, 660, 660, 660] {
            if matches!(
                counter.try_admit(at(t), 3, MINUTE, WindowStrategy::Fixed),
                WindowDecision::Admit { .. }
            ) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 6);
    }

    #[test]
    fn test_period_change_starts_fresh_window() {
        let mut counter = WindowCounter::new();
        counter.try_admit(at(600), 1, MINUTE, WindowStrategy::Fixed);
        assert!(matches!(
            counter.try_admit(at(601), 1, MINUTE, WindowStrategy::Fixed),
            WindowDecision::Deny { .. }
        ));
        assert!(matches!(
            counter.try_admit(at(601), 1, Duration::from_secs(7), WindowStrategy::Fixed),
            WindowDecision::Admit { .. }
        ));
    }

    #[test]
    fn test_sliding_window_carries_previous_weight() {
        let mut counter = WindowCounter::new();
        for _ in 0..4 {
            counter.try_admit(at(600), 4, MINUTE, WindowStrategy::Sliding);
        }

        // 1s into the next window the previous 4 still weigh ~3.93
        match counter.try_admit(at(661), 4, MINUTE, WindowStrategy::Sliding) {
            WindowDecision::Deny { retry_after, .. } => {
                // a slot frees once the carry falls to 0.75, 15s into the window
                assert_eq!(retry_after, Duration::from_secs(14));
            }
            WindowDecision::Admit { .. } => panic!("sliding window should still deny"),
        }

        // 15s in the previous window weighs exactly 3
        assert!(matches!(
            counter.try_admit(at(675), 4, MINUTE, WindowStrategy::Sliding),
            WindowDecision::Admit { remaining: 0, .. }
        ));
        match counter.try_admit(at(675), 4, MINUTE, WindowStrategy::Sliding) {
            WindowDecision::Deny { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(15));
            }
            WindowDecision::Admit { .. } => panic!("window is full"),
        }

        // 45s in only 1 of the previous window remains
        assert!(matches!(
            counter.try_admit(at(705), 4, MINUTE, WindowStrategy::Sliding),
            WindowDecision::Admit { .. }
        ));
    }

    #[test]
    fn test_idle_detection() {
        let mut counter = WindowCounter::new();
        assert!(counter.is_idle(at(0)));
        counter.try_admit(at(600), 3, MINUTE, WindowStrategy::Fixed);
        assert!(!counter.is_idle(at(700)));
        assert!(counter.is_idle(at(720)));
    }

    proptest! {
        #[test]
        fn prop_window_start_contains_now(now in -1_000_000_000_000i64..1_000_000_000_000i64,
                                          period in 1i64..10_000_000i64) {
            let start = window_start_ms(now, period);
            prop_assert!(start <= now);
            prop_assert!(now < start + period);
            prop_assert_eq!(start.rem_euclid(period), 0);
        }

        #[test]
        fn prop_fixed_window_never_over_admits(limit in 1u32..50, requests in 1usize..200) {
            let mut counter = WindowCounter::new();
            let t = at(1_000_020);
            let admitted = (0..requests)
                .filter(|_| matches!(
                    counter.try_admit(t, limit, MINUTE, WindowStrategy::Fixed),
                    WindowDecision::Admit { .. }
                ))
                .count();
            prop_assert_eq!(admitted, requests.min(limit as usize));
        }
    }
}
