// Sparse clockwork hierarchy - explicit compute context

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::helpers::RAND_SUBSEED_OFFSET;
use crate::task_pool::TaskPool;

/// Worker pool plus the pool-level RNG that seeds per-item randomness.
///
/// Passed by reference into every pass; independent hierarchies can run with
/// independent compute systems.
pub struct ComputeSystem {
    pub pool: TaskPool,
    pub rng: ChaCha20Rng,
}

impl ComputeSystem {
    pub fn new(num_workers: usize, seed: u64) -> Self {
        log::info!("compute system: {num_workers} workers, seed {seed}");

        Self {
            pool: TaskPool::new(num_workers),
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// One worker per available core.
    pub fn with_available_parallelism(seed: u64) -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self::new(num_workers, seed)
    }

    /// Draw the base seed for one pass. Item `i` then uses [`item_rng`].
    pub fn pass_seed(&mut self) -> u64 {
        self.rng.gen()
    }
}

/// RNG for work item `index` of a pass seeded with `base`.
pub fn item_rng(base: u64, index: usize) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(base.wrapping_add(index as u64 * RAND_SUBSEED_OFFSET))
}
