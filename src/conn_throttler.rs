use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ThrottleLimits;
use crate::identity::Identity;

/// Sliding-window admission counter for inbound connection attempts, per peer and in
///  aggregate. Three independent instances (minute / hour / day) make up the full
///  throttle; each rolls its window lazily on access rather than on a timer.
pub struct ConnThrottler {
    windows: [Mutex<ThrottleWindow>; 3],
}

struct ThrottleWindow {
    limits: ThrottleLimits,
    period: Duration,
    window_start: Instant,
    total: u32,
    per_peer: FxHashMap<Identity, u32>,
}

impl ThrottleWindow {
    fn new(limits: ThrottleLimits, period: Duration, now: Instant) -> ThrottleWindow {
        ThrottleWindow {
            limits,
            period,
            window_start: now,
            total: 0,
            per_peer: FxHashMap::default(),
        }
    }

    fn unlimited(&self) -> bool {
        self.limits.max_per_peer == 0 && self.limits.max_total == 0
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= self.period {
            self.window_start = now;
            self.total = 0;
            self.per_peer.clear();
        }
    }

    /// increment, then compare against the ceilings
    fn should_throttle(&mut self, peer: &Identity, now: Instant) -> bool {
        if self.unlimited() {
            return false;
        }
        self.roll(now);

        self.total += 1;
        let peer_count = self.per_peer.entry(peer.clone()).or_insert(0);
        *peer_count += 1;

        (self.limits.max_per_peer > 0 && *peer_count > self.limits.max_per_peer)
            || (self.limits.max_total > 0 && self.total > self.limits.max_total)
    }

    /// peek without incrementing - used to suppress RESET replies to peers that are
    ///  already over their ceiling
    fn is_throttled(&mut self, peer: &Identity, now: Instant) -> bool {
        if self.unlimited() {
            return false;
        }
        self.roll(now);

        (self.limits.max_per_peer > 0
            && self.per_peer.get(peer).copied().unwrap_or(0) > self.limits.max_per_peer)
            || (self.limits.max_total > 0 && self.total > self.limits.max_total)
    }
}

impl ConnThrottler {
    pub fn new(per_minute: ThrottleLimits, per_hour: ThrottleLimits, per_day: ThrottleLimits) -> ConnThrottler {
        let now = Instant::now();
        ConnThrottler {
            windows: [
                Mutex::new(ThrottleWindow::new(per_minute, Duration::from_secs(60), now)),
                Mutex::new(ThrottleWindow::new(per_hour, Duration::from_secs(3600), now)),
                Mutex::new(ThrottleWindow::new(per_day, Duration::from_secs(86_400), now)),
            ],
        }
    }

    pub fn should_throttle(&self, peer: &Identity) -> bool {
        self.should_throttle_at(peer, Instant::now())
    }

    pub fn is_throttled(&self, peer: &Identity) -> bool {
        self.is_throttled_at(peer, Instant::now())
    }

    fn should_throttle_at(&self, peer: &Identity, now: Instant) -> bool {
        let mut throttled = false;
        // every window counts the attempt, even when an earlier one already tripped
        for window in &self.windows {
            if window.lock().unwrap().should_throttle(peer, now) {
                throttled = true;
            }
        }
        if throttled {
            debug!("throttling connection attempt from {}", peer);
        }
        throttled
    }

    fn is_throttled_at(&self, peer: &Identity, now: Instant) -> bool {
        self.windows
            .iter()
            .any(|w| w.lock().unwrap().is_throttled(peer, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn limits(per_peer: u32, total: u32) -> ThrottleLimits {
        ThrottleLimits { max_per_peer: per_peer, max_total: total }
    }

    fn peer(tag: u8) -> Identity {
        Identity::from_bytes(vec![tag; 8])
    }

    #[rstest]
    fn test_unlimited_never_throttles() {
        let throttler = ConnThrottler::new(limits(0, 0), limits(0, 0), limits(0, 0));
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(!throttler.should_throttle_at(&peer(1), now));
        }
    }

    #[rstest]
    #[case::per_peer(limits(3, 0))]
    #[case::aggregate(limits(0, 3))]
    fn test_throttles_after_ceiling(#[case] l: ThrottleLimits) {
        let throttler = ConnThrottler::new(l, limits(0, 0), limits(0, 0));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(!throttler.should_throttle_at(&peer(1), now));
        }
        assert!(throttler.should_throttle_at(&peer(1), now));
        assert!(throttler.is_throttled_at(&peer(1), now));
    }

    #[rstest]
    fn test_per_peer_ceilings_are_independent() {
        let throttler = ConnThrottler::new(limits(2, 0), limits(0, 0), limits(0, 0));
        let now = Instant::now();

        assert!(!throttler.should_throttle_at(&peer(1), now));
        assert!(!throttler.should_throttle_at(&peer(1), now));
        assert!(throttler.should_throttle_at(&peer(1), now));

        // a different peer has its own counter
        assert!(!throttler.should_throttle_at(&peer(2), now));
    }

    #[rstest]
    fn test_window_rolls_over() {
        let throttler = ConnThrottler::new(limits(1, 0), limits(0, 0), limits(0, 0));
        let now = Instant::now();

        assert!(!throttler.should_throttle_at(&peer(1), now));
        assert!(throttler.should_throttle_at(&peer(1), now));

        // after the period the counters reset and the peer is admitted again
        let later = now + Duration::from_secs(61);
        assert!(!throttler.should_throttle_at(&peer(1), later));
        assert!(!throttler.is_throttled_at(&peer(1), later));
    }

    #[rstest]
    fn test_hour_window_outlives_minute_rollover() {
        let throttler = ConnThrottler::new(limits(0, 0), limits(2, 0), limits(0, 0));
        let now = Instant::now();

        assert!(!throttler.should_throttle_at(&peer(1), now));
        let later = now + Duration::from_secs(120);
        assert!(!throttler.should_throttle_at(&peer(1), later));
        // third attempt within the hour trips the hourly ceiling
        assert!(throttler.should_throttle_at(&peer(1), later));
    }
}
