use crate::common::*;

/// Derives independent random streams from one global seed.
///
/// A stream is addressed by a key path, e.g. `[phase, epoch, worker]`.
/// Equal seeds and key paths always yield the same stream, and no generator
/// is shared between streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedSequence {
    seed: u64,
}

impl SeedSequence {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Derive the seed of the stream at the key path.
    pub fn derive(&self, keys: &[u64]) -> u64 {
        keys.iter().fold(splitmix64(self.seed), |state, &key| {
            splitmix64(state ^ splitmix64(key.wrapping_add(0x9E37_79B9_7F4A_7C15)))
        })
    }

    /// Create a generator for the stream at the key path.
    pub fn rng(&self, keys: &[u64]) -> StdRng {
        StdRng::seed_from_u64(self.derive(keys))
    }
}

fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
