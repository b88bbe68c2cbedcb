use rand::Rng;
use std::time::Duration;

/// Spacing between sweeps that re-queue failed uploads. Grows while sweeps
/// keep finding work that fails again, resets once one comes back clean.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        // Never drop below half the step so sweeps cannot spin.
        let delay_ms = if self.jitter {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn sweep_interval_doubles_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(300), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 300, 300]);
    }

    #[test]
    fn jittered_interval_stays_within_half_step_and_cap() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(300), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay <= Duration::from_secs(300));
            assert!(delay >= Duration::from_secs(15));
        }
    }
}
