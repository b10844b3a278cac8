//! Coverage contract between the core and the instrumentation layer.
//!
//! The engine never inspects how edges are counted; it only compares byte
//! masks. A snapshot is the process-local counter vector as of the most
//! recent user-function call.
pub trait CoverageSource: Send {
    /// Whether instrumentation is present at all.
    fn enabled(&self) -> bool {
        true
    }

    /// Counters observed by the most recent user-function call.
    fn snapshot(&mut self) -> Vec<u8>;
}

/// Source used when the binary carries no instrumentation.
pub struct NoCoverage;

impl CoverageSource for NoCoverage {
    fn enabled(&self) -> bool {
        false
    }

    fn snapshot(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Number of bits set in `snapshot` that are clear in `mask`.
pub fn count_new_coverage_bits(mask: &[u8], snapshot: &[u8]) -> usize {
    let mut new = 0;
    for (i, &s) in snapshot.iter().enumerate() {
        let m = mask.get(i).copied().unwrap_or(0);
        new += (s & !m).count_ones() as usize;
    }
    new
}

/// Whether `snapshot` keeps at least one bit of `keep` alive.
pub fn has_coverage_bit(keep: &[u8], snapshot: &[u8]) -> bool {
    keep.iter()
        .zip(snapshot.iter())
        .any(|(&k, &s)| k & s != 0)
}
