//! Replayable PRNG used for mutation.
//!
//! The coordinator reconstructs a worker's mutations by restoring the
//! `(state, inc)` pair the worker saved into shared memory before it began
//! mutating, so the generator must expose its raw state. Ecosystem RNGs keep
//! theirs private; this is a small PCG (XSH-RR 64/32) with explicit
//! snapshot/restore, driven through `rand_core` so the mutation code can use
//! the usual `Rng` extension methods.
use rand::Rng;
use rand_core::{impls, Error, RngCore};

const MULTIPLIER: u64 = 6364136223846793005;

#[derive(Debug, Clone)]
pub struct PcgRng {
    state: u64,
    inc: u64,
}

impl PcgRng {
    /// A generator seeded from ambient entropy. The increment is forced odd,
    /// as the stream parameter requires.
    pub fn new() -> PcgRng {
        let mut seeder = rand::thread_rng();
        PcgRng::from_state(seeder.gen(), seeder.gen::<u64>() | 1)
    }

    pub fn from_state(state: u64, inc: u64) -> PcgRng {
        PcgRng {
            state,
            inc: inc | 1,
        }
    }

    /// Snapshot of the raw generator state, as written into the shared-memory
    /// header before mutation starts.
    pub fn save(&self) -> (u64, u64) {
        (self.state, self.inc)
    }

    /// Rewinds the generator to a previously saved snapshot.
    pub fn restore(&mut self, state: u64, inc: u64) {
        self.state = state;
        self.inc = inc;
    }
}

impl Default for PcgRng {
    fn default() -> Self {
        PcgRng::new()
    }
}

impl RngCore for PcgRng {
    fn next_u32(&mut self) -> u32 {
        let x = self.state;
        self.state = x.wrapping_mul(MULTIPLIER).wrapping_add(self.inc);
        let x = x ^ (x >> 18);
        ((x >> 27) as u32).rotate_right((x >> 59) as u32)
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
