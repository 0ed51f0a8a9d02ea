use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

/// Decides whether a high-frequency log line should be emitted.
pub trait LogSampler: Send + Sync {
    fn is_sample(&self) -> bool;
}

/// Creates a fresh sampler, one per call site or partition loop.
pub trait SamplerFactory: Send + Sync {
    fn sampler(&self) -> Arc<dyn LogSampler>;
}

/// Emits at most once per interval. The first call always samples.
#[derive(Debug)]
pub struct TimeSampler {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl TimeSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }
}

impl LogSampler for TimeSampler {
    fn is_sample(&self) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return true;
        };
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Emits every n-th call, starting with the first.
#[derive(Debug)]
pub struct ModSampler {
    modulo: u64,
    counter: AtomicU64,
}

impl ModSampler {
    pub fn new(modulo: u64) -> Self {
        Self {
            modulo: modulo.max(1),
            counter: AtomicU64::new(0),
        }
    }
}

impl LogSampler for ModSampler {
    fn is_sample(&self) -> bool {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.modulo == 0
    }
}

/// Emits with the given probability.
#[derive(Debug)]
pub struct RandomSampler {
    fraction: f64,
}

impl RandomSampler {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
        }
    }
}

impl LogSampler for RandomSampler {
    fn is_sample(&self) -> bool {
        rand::thread_rng().gen_bool(self.fraction)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSampler;

impl LogSampler for AlwaysSampler {
    fn is_sample(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeSamplerFactory {
    interval: Duration,
}

impl TimeSamplerFactory {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for TimeSamplerFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl SamplerFactory for TimeSamplerFactory {
    fn sampler(&self) -> Arc<dyn LogSampler> {
        Arc::new(TimeSampler::new(self.interval))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSamplerFactory;

impl SamplerFactory for AlwaysSamplerFactory {
    fn sampler(&self) -> Arc<dyn LogSampler> {
        Arc::new(AlwaysSampler)
    }
}
