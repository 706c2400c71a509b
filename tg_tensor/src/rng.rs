//! Process-wide random number generator.

use std::sync::{Mutex, OnceLock};

use rand::rngs::StdRng;
use rand::SeedableRng;

static PROCESS_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn rng() -> &'static Mutex<StdRng> {
    PROCESS_RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Reseed the process RNG. Absent a call, the generator is seeded from OS
/// entropy on first use.
pub fn manual_seed(seed: u64) {
    *rng().lock().unwrap() = StdRng::seed_from_u64(seed);
}

/// Run a closure with exclusive access to the process RNG.
pub fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    f(&mut rng().lock().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_manual_seed_is_reproducible() {
        manual_seed(1234);
        let a: Vec<f32> = with_rng(|r| (0..8).map(|_| r.gen_range(-1.0..1.0)).collect());
        manual_seed(1234);
        let b: Vec<f32> = with_rng(|r| (0..8).map(|_| r.gen_range(-1.0..1.0)).collect());
        assert_eq!(a, b);
    }
}
