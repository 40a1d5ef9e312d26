//! CPU identifiers and CPU sets.
//!
//! CPUs are dense `u32` identifiers below [`MAX_CPUS`]. [`CpuMask`] is a
//! plain bitmask value type used inside policy state; [`AtomicCpuMask`]
//! backs the lock-free online mask.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of CPUs tracked by the core.
pub const MAX_CPUS: usize = 64;

// =============================================================================
// CPU MASK
// =============================================================================

/// Fixed-size CPU set.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set containing a single CPU.
    pub const fn single(cpu: u32) -> Self {
        Self(1 << cpu)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Construct from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn set(&mut self, cpu: u32) {
        self.0 |= 1 << cpu;
    }

    pub fn clear(&mut self, cpu: u32) {
        self.0 &= !(1 << cpu);
    }

    pub const fn contains(self, cpu: u32) -> bool {
        (cpu as usize) < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of CPUs in the set.
    pub const fn weight(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest-numbered CPU in the set, if any.
    pub const fn first(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Intersection with another set.
    #[must_use]
    pub const fn and(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    /// Union with another set.
    #[must_use]
    pub const fn or(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 | other.0)
    }

    /// CPUs in `self` but not in `other`.
    #[must_use]
    pub const fn without(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & !other.0)
    }

    /// Iterate over the CPUs in the set, lowest first.
    pub fn iter(self) -> CpuMaskIter {
        CpuMaskIter(self.0)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl IntoIterator for CpuMask {
    type Item = u32;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the CPUs of a [`CpuMask`].
#[derive(Debug)]
pub struct CpuMaskIter(u64);

impl Iterator for CpuMaskIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}

// =============================================================================
// ATOMIC CPU MASK
// =============================================================================

/// Lock-free CPU set, used for the global online mask.
#[derive(Debug, Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, cpu: u32) {
        self.0.fetch_or(1 << cpu, Ordering::SeqCst);
    }

    pub fn clear(&self, cpu: u32) {
        self.0.fetch_and(!(1 << cpu), Ordering::SeqCst);
    }

    pub fn contains(&self, cpu: u32) -> bool {
        (cpu as usize) < MAX_CPUS && self.0.load(Ordering::SeqCst) & (1 << cpu) != 0
    }

    /// Point-in-time copy of the set.
    pub fn snapshot(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::SeqCst))
    }

    pub fn weight(&self) -> u32 {
        self.0.load(Ordering::SeqCst).count_ones()
    }
}

// =============================================================================
// TESTS
// =============================================================================
