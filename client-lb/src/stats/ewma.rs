use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Back to back samples would otherwise leave the average untouched.
const MIN_ALPHA: f64 = 1.0 / 32.0;

/// Time decayed moving average of response times, lock free.
pub struct Ewma {
    origin: std::time::Instant,
    value: AtomicU64,
    last: AtomicU64,

    tau: f64,
}

impl Ewma {
    pub fn new(tau: f64) -> Self {
        Self {
            origin: std::time::Instant::now(),
            value: AtomicU64::new(f64::NAN.to_bits()),
            last: AtomicU64::new(0),

            tau,
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }

    pub fn initialized(&self) -> bool {
        self.get().is_finite()
    }

    pub fn update(&self, sample: f64) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        self.update_at(sample, now_ms);
    }

    pub fn update_at(&self, sample: f64, now_ms: u64) {
        let last = self.last.swap(now_ms, Ordering::Relaxed);
        let prev = self.get();
        if !prev.is_finite() {
            self.value.store(sample.to_bits(), Ordering::Relaxed);
            return;
        }

        let dt = (now_ms.saturating_sub(last) as f64).min(5.0 * self.tau);
        let alpha = (1.0 - (-dt / self.tau).exp()).max(MIN_ALPHA);
        let new = prev + alpha * (sample - prev);
        self.value.store(new.to_bits(), Ordering::Relaxed);
    }
}
