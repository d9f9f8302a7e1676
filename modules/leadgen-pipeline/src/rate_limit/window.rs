//! Pure window arithmetic on a [`RateLimitBucket`]. No I/O, no clock.

use chrono::{DateTime, Duration, Utc};

use leadgen_common::{RateLimitBucket, RateWindow};

/// How long a caller waits before re-checking a throttle that has no end.
const OPEN_THROTTLE_POLL_SECS: i64 = 60;

/// Result of evaluating a bucket at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Not an error: the caller waits at least `retry_after` and tries again.
    Deny { retry_after: Duration },
}

/// Reset every window whose `reset_at` has passed and drop an expired throttle.
/// A throttle without an end stays until something clears it explicitly.
/// Returns true if anything changed.
pub fn roll_windows(bucket: &mut RateLimitBucket, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    for window in RateWindow::ALL {
        let counter = bucket.counter_mut(window);
        if now >= counter.reset_at {
            counter.count = 0;
            counter.reset_at = now + window.length();
            changed = true;
        }
    }
    if bucket.is_throttled && bucket.throttled_until.is_some_and(|until| now >= until) {
        bucket.is_throttled = false;
        bucket.throttled_until = None;
        changed = true;
    }
    changed
}

/// A request is allowed only if every capped window has room. An active
/// throttle wins over the windows. Expects [`roll_windows`] to have run.
pub fn evaluate(bucket: &RateLimitBucket, now: DateTime<Utc>) -> Decision {
    if bucket.is_throttled {
        match bucket.throttled_until {
            None => {
                return Decision::Deny {
                    retry_after: Duration::seconds(OPEN_THROTTLE_POLL_SECS),
                }
            }
            Some(until) if until > now => {
                return Decision::Deny {
                    retry_after: until - now,
                }
            }
            Some(_) => {}
        }
    }

    let mut retry_after: Option<Duration> = None;
    for window in RateWindow::ALL {
        let Some(limit) = bucket.limits.limit(window) else {
            continue;
        };
        let counter = bucket.counter(window);
        if counter.count >= limit {
            let wait = (counter.reset_at - now).max(Duration::zero());
            retry_after = Some(retry_after.map_or(wait, |w| w.max(wait)));
        }
    }
    match retry_after {
        Some(retry_after) => Decision::Deny { retry_after },
        None => Decision::Allow,
    }
}

/// Count one request against every window.
pub fn record_request(bucket: &mut RateLimitBucket, now: DateTime<Utc>) {
    for window in RateWindow::ALL {
        bucket.counter_mut(window).count += 1;
    }
    bucket.total_requests += 1;
    bucket.last_request_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgen_common::{RateLimits, SourceType};

    fn bucket(limits: RateLimits, now: DateTime<Utc>) -> RateLimitBucket {
        RateLimitBucket::new(SourceType::Yelp, "default", limits, now)
    }

    #[test]
    fn tightest_window_wins() {
        let now = Utc::now();
        let mut b = bucket(
            RateLimits {
                per_second: Some(10),
                per_minute: Some(2),
                per_hour: None,
                per_day: None,
            },
            now,
        );
        record_request(&mut b, now);
        record_request(&mut b, now);
        match evaluate(&b, now) {
            Decision::Deny { retry_after } => assert_eq!(retry_after, Duration::minutes(1)),
            Decision::Allow => panic!("minute cap should deny"),
        }
    }

    #[test]
    fn expired_windows_reset_lazily() {
        let now = Utc::now();
        let mut b = bucket(
            RateLimits {
                per_second: Some(1),
                ..Default::default()
            },
            now,
        );
        record_request(&mut b, now);
        assert!(matches!(evaluate(&b, now), Decision::Deny { .. }));

        let later = now + Duration::seconds(1);
        assert!(roll_windows(&mut b, later));
        assert_eq!(b.second.count, 0);
        assert_eq!(evaluate(&b, later), Decision::Allow);
        // untouched windows keep counting
        assert_eq!(b.day.count, 1);
    }

    #[test]
    fn throttle_overrides_open_windows() {
        let now = Utc::now();
        let mut b = bucket(RateLimits::default(), now);
        b.is_throttled = true;
        b.throttled_until = Some(now + Duration::seconds(30));
        assert_eq!(
            evaluate(&b, now),
            Decision::Deny {
                retry_after: Duration::seconds(30)
            }
        );

        roll_windows(&mut b, now + Duration::seconds(30));
        assert!(!b.is_throttled);
        assert_eq!(evaluate(&b, now + Duration::seconds(30)), Decision::Allow);
    }

    #[test]
    fn throttle_without_end_holds_until_cleared() {
        let now = Utc::now();
        let mut b = bucket(RateLimits::default(), now);
        b.is_throttled = true;
        b.throttled_until = None;

        let much_later = now + Duration::days(3);
        roll_windows(&mut b, much_later);
        assert!(b.is_throttled);
        assert_eq!(
            evaluate(&b, much_later),
            Decision::Deny {
                retry_after: Duration::seconds(OPEN_THROTTLE_POLL_SECS)
            }
        );

        b.is_throttled = false;
        assert_eq!(evaluate(&b, much_later), Decision::Allow);
    }
}
