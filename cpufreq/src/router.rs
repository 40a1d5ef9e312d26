//! # Lock Router
//!
//! Per-CPU indirection from a CPU identifier to the representative that
//! owns its group lock. The mapping changes under hotplug: it is
//! installed before a policy becomes reachable and cleared only after
//! the policy is fully destroyed, so a successful resolution always
//! names a live policy.
//!
//! Acquisition is exposed as a closure API on the core (see
//! [`CpuFreq::with_policy_read`](crate::core::CpuFreq) and the write
//! variant): resolve the owner, lock that policy's group lock, then
//! re-check that the CPU is still online. The re-check is what turns a
//! lost race with offlining into [`StaleCpu`](crate::error::Error::StaleCpu)
//! instead of an operation on a dying policy.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::mask::MAX_CPUS;

/// Per-CPU owner table. `-1` means unmapped.
pub struct LockRouter {
    owner: [AtomicI32; MAX_CPUS],
}

impl LockRouter {
    pub fn new() -> Self {
        Self {
            owner: core::array::from_fn(|_| AtomicI32::new(-1)),
        }
    }

    /// Route `cpu` to the domain represented by `representative`.
    pub fn map(&self, cpu: u32, representative: u32) {
        self.owner[cpu as usize].store(representative as i32, Ordering::SeqCst);
    }

    /// Remove the route. Last step of policy teardown.
    pub fn unmap(&self, cpu: u32) {
        self.owner[cpu as usize].store(-1, Ordering::SeqCst);
    }

    /// Representative owning `cpu`'s lock, if mapped.
    pub fn owner_of(&self, cpu: u32) -> Option<u32> {
        if cpu as usize >= MAX_CPUS {
            return None;
        }
        let owner = self.owner[cpu as usize].load(Ordering::SeqCst);
        if owner < 0 {
            None
        } else {
            Some(owner as u32)
        }
    }

    pub fn is_mapped(&self, cpu: u32) -> bool {
        self.owner_of(cpu).is_some()
    }
}

impl Default for LockRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for LockRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for cpu in 0..MAX_CPUS as u32 {
            if let Some(owner) = self.owner_of(cpu) {
                map.entry(&cpu, &owner);
            }
        }
        map.finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_unmap() {
        let router = LockRouter::new();
        assert_eq!(router.owner_of(2), None);

        router.map(2, 0);
        assert_eq!(router.owner_of(2), Some(0));
        assert!(router.is_mapped(2));

        router.unmap(2);
        assert_eq!(router.owner_of(2), None);
    }

    #[test]
    fn test_remap_on_migration() {
        let router = LockRouter::new();
        router.map(1, 1);
        router.map(2, 1);

        // Representative moves from CPU 1 to CPU 2.
        router.map(2, 2);
        router.unmap(1);

        assert_eq!(router.owner_of(2), Some(2));
        assert_eq!(router.owner_of(1), None);
    }

    #[test]
    fn test_out_of_range() {
        let router = LockRouter::new();
        assert_eq!(router.owner_of(MAX_CPUS as u32), None);
    }
}
