use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::AddressHash;

const RATE_WINDOW: Duration = Duration::from_secs(60);
const MAX_PER_WINDOW: u32 = 6;
const BLOCK_DURATION: Duration = Duration::from_secs(60);

struct RateTrack {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Per-destination announce rate limiter. Destinations that announce too
/// fast are ignored for a cool-down period.
pub struct AnnounceLimits {
    map: HashMap<AddressHash, RateTrack>,
}

impl AnnounceLimits {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Accounts one announce. Returns the remaining block time when the
    /// destination is currently rate-limited.
    pub fn check(&mut self, destination: &AddressHash) -> Option<Duration> {
        let now = Instant::now();
        let track = self.map.entry(*destination).or_insert(RateTrack {
            window_start: now,
            count: 0,
            blocked_until: None,
        });

        if let Some(blocked_until) = track.blocked_until {
            if now < blocked_until {
                return Some(blocked_until - now);
            }
            track.blocked_until = None;
            track.window_start = now;
            track.count = 0;
        }

        if now.duration_since(track.window_start) > RATE_WINDOW {
            track.window_start = now;
            track.count = 0;
        }

        track.count += 1;
        if track.count > MAX_PER_WINDOW {
            track.blocked_until = Some(now + BLOCK_DURATION);
            return Some(BLOCK_DURATION);
        }

        None
    }

    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.map.retain(|_, track| {
            track.blocked_until.map(|until| until > now).unwrap_or(false)
                || now.duration_since(track.window_start) <= RATE_WINDOW
        });
    }
}

impl Default for AnnounceLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{AnnounceLimits, MAX_PER_WINDOW};
    use crate::hash::AddressHash;

    #[test]
    fn burst_gets_blocked() {
        let mut limits = AnnounceLimits::new();
        let destination = AddressHash::new_from_rand(OsRng);

        for _ in 0..MAX_PER_WINDOW {
            assert!(limits.check(&destination).is_none());
        }
        assert!(limits.check(&destination).is_some());
    }

    #[test]
    fn distinct_destinations_are_independent() {
        let mut limits = AnnounceLimits::new();
        let a = AddressHash::new_from_rand(OsRng);
        let b = AddressHash::new_from_rand(OsRng);

        for _ in 0..MAX_PER_WINDOW {
            assert!(limits.check(&a).is_none());
        }
        assert!(limits.check(&a).is_some());
        assert!(limits.check(&b).is_none());
    }
}
