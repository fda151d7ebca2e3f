use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Sample {
    bytes: u64,
    timestamp: Instant,
}

/// Smoothed transfer speed over a sliding window of progress samples.
///
/// Fed with cumulative byte counts; each observation contributes the delta
/// since the previous one. Counts that go backwards (a retried part) reset
/// the baseline without contributing a sample.
pub struct ThroughputMeter {
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    samples: Vec<Sample>,
    last_loaded: Option<u64>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ThroughputMeter {
    /// Creates a new meter.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: Vec::new(),
                last_loaded: None,
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the cumulative `loaded` byte count at the current instant.
    pub fn observe(&self, loaded: u64) {
        self.observe_at(loaded, Instant::now());
    }

    fn observe_at(&self, loaded: u64, now: Instant) {
        let mut s = self.lock();
        let delta = match s.last_loaded {
            Some(prev) if loaded >= prev => loaded - prev,
            Some(_) => {
                s.last_loaded = Some(loaded);
                return;
            }
            // First observation only sets the baseline.
            None => 0,
        };
        s.last_loaded = Some(loaded);
        s.samples.push(Sample {
            bytes: delta,
            timestamp: now,
        });

        let window = s.window_size;
        if let Some(cutoff) = now.checked_sub(window) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample's bytes were sent before the window opened.
        let total: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all samples and the baseline.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.samples.clear();
        s.last_loaded = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn no_samples() {
        let meter = ThroughputMeter::default();
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert!(meter.eta(1000).is_none());
    }

    #[test]
    fn single_observation_is_baseline() {
        let meter = ThroughputMeter::default();
        meter.observe(100);
        assert_eq!(meter.bytes_per_second(), 0.0);
    }

    #[test]
    fn steady_rate() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        meter.observe_at(0, t0);
        meter.observe_at(1000, t0 + Duration::from_millis(500));
        meter.observe_at(2000, t0 + Duration::from_secs(1));
        meter.observe_at(3000, t0 + Duration::from_millis(1500));

        let speed = meter.bytes_per_second();
        assert!((speed - 2000.0).abs() < 1.0, "speed {speed}");

        let eta = meter.eta(4000).unwrap();
        assert!((eta.as_secs_f64() - 2.0).abs() < 0.01);
    }

    #[test]
    fn backwards_count_resets_baseline() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        meter.observe_at(0, t0);
        meter.observe_at(1000, t0 + Duration::from_secs(1));
        // Retried part: cumulative count drops.
        meter.observe_at(400, t0 + Duration::from_secs(2));
        meter.observe_at(1400, t0 + Duration::from_secs(3));

        // The drop itself contributes nothing: 2000 bytes over 3 s.
        let speed = meter.bytes_per_second();
        assert!((speed - 2000.0 / 3.0).abs() < 1.0, "speed {speed}");
    }

    #[test]
    fn old_samples_leave_window() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(2)), None);
        let t0 = Instant::now();
        meter.observe_at(0, t0);
        meter.observe_at(1_000_000, t0 + Duration::from_secs(1));
        // Slow tail long after the burst.
        meter.observe_at(1_000_100, t0 + Duration::from_secs(10));
        meter.observe_at(1_000_200, t0 + Duration::from_secs(11));

        let speed = meter.bytes_per_second();
        assert!((speed - 100.0).abs() < 1.0, "speed {speed}");
    }

    #[test]
    fn reset_clears() {
        let meter = ThroughputMeter::default();
        let t0 = Instant::now();
        meter.observe_at(0, t0);
        meter.observe_at(100, t0 + Duration::from_secs(1));
        meter.reset();
        assert_eq!(meter.bytes_per_second(), 0.0);
    }

    #[test]
    fn max_samples() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            meter.observe(i * 10);
        }
        assert!(meter.lock().samples.len() <= 5);
    }

    #[test]
    fn concurrent_access() {
        use std::thread;

        let meter = Arc::new(ThroughputMeter::default());
        let mut handles = vec![];

        for t in 0..10u64 {
            let m = Arc::clone(&meter);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    m.observe(t * 1000 + i);
                    let _ = m.bytes_per_second();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let _ = meter.bytes_per_second();
    }
}
