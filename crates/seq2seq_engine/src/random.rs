//! Per-thread random generator for sampling ops

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;

static DEFAULT_SEED: AtomicU64 = AtomicU64::new(0x5eed_5eed);

thread_local! {
    static GENERATOR: RefCell<StdRng> =
        RefCell::new(StdRng::seed_from_u64(DEFAULT_SEED.load(Ordering::Relaxed)));
}

/// Reseeds the calling thread's generator and makes `seed` the default for
/// threads created afterwards.
pub fn set_random_seed(seed: u64) {
    DEFAULT_SEED.store(seed, Ordering::Relaxed);
    GENERATOR.with(|generator| *generator.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Runs `f` with the calling thread's generator.
pub fn with_random_generator<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    GENERATOR.with(|generator| f(&mut generator.borrow_mut()))
}
