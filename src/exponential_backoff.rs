use std::cmp::min;
use std::time::Duration;

use rand::Rng;

/// Time-based exponential backoff: every call to [ExponentialBackoff::next_delay] returns the
///  current delay and grows it by a configured factor (in eighths) up to a maximum. An optional
///  jitter randomizes each returned delay by up to +/- the given fraction.
#[derive(Debug)]
pub struct ExponentialBackoff {
    delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
    config_jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor_eighths: u32, jitter: f64) -> Self {
        assert!(factor_eighths >= 8);
        assert!((0.0..1.0).contains(&jitter));

        ExponentialBackoff {
            delay: initial_delay,
            config_initial_delay: initial_delay,
            config_max_delay: max_delay,
            config_factor_eighths: factor_eighths,
            config_jitter: jitter,
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.delay;

        let grown = self.delay.checked_mul(self.config_factor_eighths)
            .map(|d| d / 8)
            .unwrap_or(self.config_max_delay);
        self.delay = min(grown, self.config_max_delay);

        if self.config_jitter > 0.0 {
            result.mul_f64(rand::thread_rng().gen_range(1.0 - self.config_jitter..1.0 + self.config_jitter))
        }
        else {
            result
        }
    }

    pub fn reset(&mut self) {
        self.delay = self.config_initial_delay;
    }
}
