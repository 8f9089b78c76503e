//! Exponential backoff with jitter for slot acquisition retries.
//!
//! Fixed-interval polling lines replicas up into synchronized retry storms
//! against the store; growing delays with jitter spread them out.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

pub(crate) struct Backoff {
    current_ms: f64,
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial_ms = config.initial_ms.max(1) as f64;
        let max_ms = (config.max_ms.max(1) as f64).max(initial_ms);
        Self {
            current_ms: initial_ms,
            initial_ms,
            max_ms,
            multiplier: if config.multiplier > 1.0 { config.multiplier } else { 1.5 },
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// The next delay to sleep before retrying; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current_ms);
        self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms);
        Duration::from_millis(delay as u64)
    }

    fn jittered(&self, base_ms: f64) -> f64 {
        if self.jitter <= 0.0 {
            return base_ms;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        (base_ms * factor).clamp(self.initial_ms, self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            max_ms: 2_000,
            multiplier: 1.5,
            jitter,
        }
    }

    #[test]
    fn grows_geometrically_and_caps_without_jitter() {
        let mut backoff = Backoff::new(&config(0.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(150));
        assert_eq!(backoff.next_delay(), Duration::from_millis(225));
        for _ in 0..16 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_000));
    }

    #[test]
    fn jitter_stays_inside_band() {
        let mut backoff = Backoff::new(&config(0.2));
        for _ in 0..64 {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((100..=2_000).contains(&delay), "delay {delay} out of band");
        }
    }
}
