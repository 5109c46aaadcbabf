//! Sliding-log rate limiter.
//!
//! Each key keeps the admission timestamps inside its window. A send is
//! admitted only if every key it touches has capacity, and then it is
//! recorded against all of them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::config::RateBudget;

#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Admission times per key, oldest first.
    request_times: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop admissions that have left the window ending at `now`.
    fn prune_expired(&mut self, key: &str, budget: &RateBudget, now: DateTime<Utc>) {
        let Some(times) = self.request_times.get_mut(key) else {
            return;
        };
        let cutoff = now - budget.window();
        while let Some(&oldest) = times.front() {
            if oldest <= cutoff {
                times.pop_front();
            } else {
                break;
            }
        }
    }

    /// `None` if `key` has room now, otherwise how long until its oldest
    /// admission leaves the window.
    pub fn wait_time(
        &mut self,
        key: &str,
        budget: &RateBudget,
        now: DateTime<Utc>,
    ) -> Option<chrono::Duration> {
        if self.current_count(key, budget, now) < budget.max_sends as usize {
            return None;
        }
        // A zero budget never frees up; report a full window.
        let Some(oldest) = self.request_times.get(key).and_then(|t| t.front()) else {
            return Some(budget.window());
        };
        let expires_at = *oldest + budget.window();
        (expires_at > now).then(|| expires_at - now)
    }

    fn record_request(&mut self, key: &str, now: DateTime<Utc>) {
        self.request_times
            .entry(key.to_string())
            .or_default()
            .push_back(now);
    }

    /// Admit one send against all `(key, budget)` pairs, or none of them.
    pub fn try_admit(&mut self, limits: &[(&str, RateBudget)], now: DateTime<Utc>) -> bool {
        let has_room = limits
            .iter()
            .all(|(key, budget)| self.wait_time(key, budget, now).is_none());
        if !has_room {
            return false;
        }
        for (key, _) in limits {
            self.record_request(key, now);
        }
        true
    }

    /// Admissions for `key` within the window ending at `now`.
    pub fn current_count(&mut self, key: &str, budget: &RateBudget, now: DateTime<Utc>) -> usize {
        self.prune_expired(key, budget, now);
        self.request_times.get(key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn budget(max_sends: u32, window_secs: u64) -> RateBudget {
        RateBudget {
            max_sends,
            window_secs,
        }
    }

    #[test]
    fn admits_up_to_budget_then_refills() {
        let mut limiter = RateLimiter::new();
        let b = budget(2, 60);
        let t0 = Utc::now();

        assert!(limiter.try_admit(&[("c", b)], t0));
        assert!(limiter.try_admit(&[("c", b)], t0 + Duration::seconds(10)));
        assert!(!limiter.try_admit(&[("c", b)], t0 + Duration::seconds(59)));
        // First admission leaves the window.
        assert!(limiter.try_admit(&[("c", b)], t0 + Duration::seconds(60)));
        assert!(!limiter.try_admit(&[("c", b)], t0 + Duration::seconds(61)));
    }

    #[test]
    fn wait_time_runs_until_oldest_admission_expires() {
        let mut limiter = RateLimiter::new();
        let b = budget(2, 60);
        let t0 = Utc::now();

        assert_eq!(limiter.wait_time("c", &b, t0), None);
        limiter.try_admit(&[("c", b)], t0);
        limiter.try_admit(&[("c", b)], t0 + Duration::seconds(20));

        assert_eq!(
            limiter.wait_time("c", &b, t0 + Duration::seconds(45)),
            Some(Duration::seconds(15))
        );
        assert_eq!(limiter.current_count("c", &b, t0 + Duration::seconds(45)), 2);
        assert_eq!(limiter.wait_time("c", &b, t0 + Duration::seconds(60)), None);
        assert_eq!(limiter.current_count("c", &b, t0 + Duration::seconds(60)), 1);
    }

    #[test]
    fn all_keys_must_have_room() {
        let mut limiter = RateLimiter::new();
        let campaign = budget(5, 60);
        let channel = budget(1, 60);
        let now = Utc::now();

        assert!(limiter.try_admit(&[("campaign:a", campaign), ("channel:wa", channel)], now));
        assert!(!limiter.try_admit(&[("campaign:b", campaign), ("channel:wa", channel)], now));
        // The rejected attempt did not consume campaign b's budget.
        assert_eq!(limiter.current_count("campaign:b", &campaign, now), 0);
        assert!(limiter.wait_time("channel:wa", &channel, now).is_some());
    }

    #[test]
    fn rolling_window_never_exceeds_budget() {
        let mut limiter = RateLimiter::new();
        let b = budget(3, 10);
        let start = Utc::now();
        let mut admitted = Vec::new();

        for ms in (0..60_000).step_by(700) {
            let t = start + Duration::milliseconds(ms);
            if limiter.try_admit(&[("c", b)], t) {
                admitted.push(t);
            }
        }

        for (i, t) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|u| **u < *t + b.window())
                .count();
            assert!(in_window <= 3, "window starting at {t} has {in_window} sends");
        }
    }
}
