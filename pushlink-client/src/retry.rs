use std::time::Duration;

/// Generator of retry delays: starts at an initial delay and doubles per
/// consecutive failure up to a ceiling, optionally bounded in count.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_delay: Duration,
    next_delay: Duration,
    remaining: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(max_delay: Duration, limit: Option<u32>, initial_delay: Duration) -> Self {
        Self {
            max_delay,
            next_delay: initial_delay.min(max_delay),
            remaining: limit,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self.remaining.as_mut() {
            Some(0) => return None,
            Some(r) => *r -= 1,
            None => {}
        }
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        Some(delay)
    }
}

/// Session-level retry configuration; hands out a fresh backoff per
/// connection attempt series.
#[derive(Debug, Clone)]
pub struct SessionRetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    limit: Option<u32>,
}

impl SessionRetryPolicy {
    pub fn new(max_delay: Duration, limit: Option<u32>, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            limit,
        }
    }

    pub fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.max_delay, self.limit, self.initial_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_ceiling() {
        let mut b = ExponentialBackoff::new(
            Duration::from_secs(60),
            None,
            Duration::from_secs(4),
        );
        assert_eq!(b.next(), Some(Duration::from_secs(4)));
        assert_eq!(b.next(), Some(Duration::from_secs(8)));
        assert_eq!(b.next(), Some(Duration::from_secs(16)));
        assert_eq!(b.next(), Some(Duration::from_secs(32)));
        assert_eq!(b.next(), Some(Duration::from_secs(60)));
        assert_eq!(b.next(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn respects_limit() {
        let mut b = ExponentialBackoff::new(
            Duration::from_secs(60),
            Some(2),
            Duration::from_secs(1),
        );
        assert!(b.next().is_some());
        assert!(b.next().is_some());
        assert_eq!(b.next(), None);
    }
}
