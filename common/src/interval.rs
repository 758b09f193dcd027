/// Fixed period check against a free running millisecond counter.
///
/// The counter is a `u32` and wraps after ~49.7 days. Elapsed time is taken
/// modulo 2^32 with `wrapping_sub`, so a period spanning the rollover is still
/// measured correctly as long as both timestamps come from the same counter.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period_ms: u32,
    last_ms: u32,
}

impl Interval {
    /// The first period is measured from `start_ms`.
    pub fn new(period_ms: u32, start_ms: u32) -> Self {
        Self {
            period_ms,
            last_ms: start_ms,
        }
    }

    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    pub fn elapsed(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.last_ms)
    }

    /// Returns true once per period and restarts the period at `now_ms`.
    pub fn poll(&mut self, now_ms: u32) -> bool {
        if self.elapsed(now_ms) >= self.period_ms {
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_period() {
        let mut iv = Interval::new(10_000, 0);
        assert!(!iv.poll(0));
        assert!(!iv.poll(9_999));
        assert!(iv.poll(10_000));
        assert!(!iv.poll(10_001));
        assert!(!iv.poll(19_999));
        assert!(iv.poll(20_050));
    }

    #[test]
    fn survives_counter_rollover() {
        let start = u32::MAX - 4_000;
        let mut iv = Interval::new(10_000, start);
        assert!(!iv.poll(u32::MAX));
        assert!(!iv.poll(0));
        assert!(!iv.poll(5_998));
        assert_eq!(iv.elapsed(5_999), 10_000);
        assert!(iv.poll(5_999));
        assert!(!iv.poll(6_000));
    }
}
