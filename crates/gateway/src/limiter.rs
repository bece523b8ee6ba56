use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fleet-local cap on concurrent sessions. Acquisition never blocks: a
/// full limiter fails fast so the upgrade request can be rejected before
/// the socket exists.
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("connection limit of {capacity} reached")]
pub struct LimitExceeded {
    pub capacity: usize,
}

impl ConnectionLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Reserve a slot or fail. The permit releases its slot when dropped;
    /// holders stash it in the connection so a double release is impossible.
    pub fn acquire(&self) -> Result<OwnedSemaphorePermit, LimitExceeded> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| LimitExceeded {
                capacity: self.capacity,
            })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_capacity_then_fail() {
        let limiter = ConnectionLimiter::new(2);
        let a = limiter.acquire().unwrap();
        let _b = limiter.acquire().unwrap();
        assert_eq!(limiter.in_use(), 2);
        assert!(limiter.acquire().is_err());

        drop(a);
        assert_eq!(limiter.in_use(), 1);
        assert!(limiter.acquire().is_ok());
    }

    #[test]
    fn release_is_single_shot_per_acquire() {
        let limiter = ConnectionLimiter::new(1);
        let permit = limiter.acquire().unwrap();
        // Dropping the permit is the only release path, so releasing twice
        // for one acquire cannot happen.
        drop(permit);
        assert_eq!(limiter.in_use(), 0);
        let _again = limiter.acquire().unwrap();
        assert_eq!(limiter.in_use(), 1);
    }
}
