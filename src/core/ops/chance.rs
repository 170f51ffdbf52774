use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Shared source of randomness. Seeded in tests so draws are reproducible.
pub struct Chance {
    rng: Mutex<StdRng>,
}

impl Chance {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    /// Uniform draw in `[0, 1)`.
    pub fn roll(&self) -> f64 {
        self.with(|rng| rng.r#gen::<f64>())
    }

    /// True with probability `p`.
    pub fn chance(&self, p: f64) -> bool {
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        self.roll() < p
    }

    /// Uniform integer in `[low, high]`.
    pub fn between(&self, low: i64, high: i64) -> i64 {
        if high <= low {
            return low;
        }
        self.with(|rng| rng.gen_range(low..=high))
    }

    /// Uniform float in `[low, high]`.
    pub fn between_f64(&self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.with(|rng| rng.gen_range(low..=high))
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        self.with(|rng| items.choose(rng))
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        self.with(|rng| items.shuffle(rng))
    }
}

impl Default for Chance {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_draws_repeat() {
        let a = Chance::seeded(7);
        let b = Chance::seeded(7);
        for _ in 0..5 {
            assert_eq!(a.roll(), b.roll());
        }
    }

    #[test]
    fn bounds_are_respected() {
        let chance = Chance::seeded(1);
        for _ in 0..100 {
            let n = chance.between(6, 12);
            assert!((6..=12).contains(&n));
        }
        assert_eq!(chance.between(3, 3), 3);
        assert!(chance.chance(1.0));
        assert!(!chance.chance(0.0));
        assert!(chance.pick::<u8>(&[]).is_none());
    }
}
