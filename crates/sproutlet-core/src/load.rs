//! Admission control: a token bucket drained by inbound requests.
//!
//! When the bucket is empty the node is overloaded and new non-ACK
//! requests are answered 503 without touching any service.  503 is
//! reserved for this case; upstream service failures map to 504.

use std::time::Instant;

use parking_lot::Mutex;

/// Token-bucket load monitor.
pub struct LoadMonitor {
    state: Mutex<BucketState>,
    rate_per_second: f64,
    capacity: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl LoadMonitor {
    /// `rate_per_second` sustained requests, with bursts up to `capacity`.
    pub fn new(rate_per_second: f64, capacity: f64) -> Self {
        LoadMonitor {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate_per_second,
            capacity,
        }
    }

    /// Take one token; false means overloaded.
    pub fn admit(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
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
    fn burst_up_to_capacity_then_rejects() {
        let monitor = LoadMonitor::new(0.0, 3.0);
        assert!(monitor.admit());
        assert!(monitor.admit());
        assert!(monitor.admit());
        assert!(!monitor.admit());
    }

    #[test]
    fn refills_over_time() {
        let monitor = LoadMonitor::new(1000.0, 1.0);
        assert!(monitor.admit());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(monitor.admit());
    }
}
