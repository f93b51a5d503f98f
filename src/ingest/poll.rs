use std::time::Duration;

/// Adaptive wait planner for tip polling.
///
/// Idle polls stretch the next interval multiplicatively up to the ceiling; any newly observed
/// block snaps the cadence back to the base interval.
#[derive(Debug, Clone)]
pub struct PollPlanner {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl PollPlanner {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        assert!(multiplier >= 1.0, "multiplier must be at least 1");
        let max = max.max(base);
        Self {
            base,
            max,
            multiplier,
            current: base,
        }
    }

    /// Delay to wait after a poll that found nothing new.
    pub fn idle_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = scale(self.current, self.multiplier, self.max);
        delay
    }

    /// A new block was observed; return to the base cadence.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

fn scale(current: Duration, multiplier: f64, max: Duration) -> Duration {
    if current.is_zero() {
        return max.min(Duration::from_millis(1));
    }

    let next = current.mul_f64(multiplier);
    if next > max {
        max
    } else {
        next
    }
}
