use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by caller identity.
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Record one request for `identity`; `false` means over the limit.
    pub fn check(&self, identity: &str) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };
        let hits = windows.entry(identity.to_string()).or_default();
        while hits.front().is_some_and(|t| *t < cutoff) {
            hits.pop_front();
        }
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Drop identities with no hits inside the window.
    pub fn prune(&self) {
        let cutoff = Instant::now() - self.window;
        if let Ok(mut windows) = self.windows.lock() {
            windows.retain(|_, hits| hits.back().is_some_and(|t| *t >= cutoff));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("svc"));
        assert!(limiter.check("svc"));
        assert!(limiter.check("svc"));
        assert!(!limiter.check("svc"));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("svc"));
        assert!(!limiter.check("svc"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check("svc"));
    }

    #[test]
    fn prune_drops_idle_identities() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_millis(10));
        limiter.check("svc");
        std::thread::sleep(Duration::from_millis(30));
        limiter.prune();
        assert!(limiter.windows.lock().unwrap().is_empty());
    }
}
