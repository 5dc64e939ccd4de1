use crate::common::*;

/// Counts events and reports the rate once per interval.
#[derive(Debug, Clone)]
pub struct RateCounter {
    interval: Duration,
    count: f64,
    since: Instant,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            count: 0.0,
            since: Instant::now(),
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn add(&mut self, count: f64) {
        self.count += count;
    }

    /// Get the rate per second if the interval has elapsed, and restart counting.
    pub fn rate(&mut self) -> Option<f64> {
        let elapsed = self.since.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let rate = self.count / elapsed.as_secs_f64();
        self.count = 0.0;
        self.since = Instant::now();
        Some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_reported_after_interval() {
        let mut counter = RateCounter::new(Duration::from_millis(20));
        counter.add(4.0);
        assert!(counter.rate().is_none());

        thread::sleep(Duration::from_millis(25));
        let rate = counter.rate().unwrap();
        assert!(rate > 0.0 && rate <= 4.0 / 0.025);

        // the count restarts
        assert!(counter.rate().is_none());
    }
}
