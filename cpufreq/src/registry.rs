//! # Policy Registry
//!
//! Maps every managed CPU to the [`Policy`] of its clock domain. All
//! CPUs of a domain point at the same shared object. Critical sections
//! are short: the table lock is never held across driver or governor
//! calls.
//!
//! [`PolicyRef`] is the borrow handle for external entry points. While
//! one exists the policy cannot be destroyed and the driver cannot be
//! unregistered.

use alloc::sync::Arc;

use spin::Mutex;

use crate::driver::DriverSlot;
use crate::error::{Error, Result};
use crate::mask::MAX_CPUS;
use crate::policy::Policy;

// =============================================================================
// POLICY TABLE
// =============================================================================

/// Per-CPU policy mapping.
pub struct PolicyTable {
    slots: Mutex<[Option<Arc<Policy>>; MAX_CPUS]>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(core::array::from_fn(|_| None)),
        }
    }

    pub fn insert(&self, cpu: u32, policy: Arc<Policy>) {
        self.slots.lock()[cpu as usize] = Some(policy);
    }

    pub fn remove(&self, cpu: u32) -> Option<Arc<Policy>> {
        self.slots.lock()[cpu as usize].take()
    }

    /// Plain clone of the mapping, no borrow accounting. Internal
    /// paths that hold the group lock use this.
    pub fn get(&self, cpu: u32) -> Option<Arc<Policy>> {
        if cpu as usize >= MAX_CPUS {
            return None;
        }
        self.slots.lock()[cpu as usize].clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().iter().all(|s| s.is_none())
    }

    /// CPUs currently mapped to any policy.
    pub fn managed_cpus(&self) -> alloc::vec::Vec<u32> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(cpu, slot)| slot.as_ref().map(|_| cpu as u32))
            .collect()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PolicyTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PolicyTable")
            .field("managed", &self.managed_cpus())
            .finish()
    }
}

// =============================================================================
// POLICY REF
// =============================================================================

/// Counted borrow of a policy, also pinning the active driver.
///
/// Dropping the last borrow of a retiring policy signals the teardown
/// path waiting in [`Policy::wait_drained`].
pub struct PolicyRef<'a> {
    policy: Arc<Policy>,
    slot: &'a DriverSlot,
}

impl core::ops::Deref for PolicyRef<'_> {
    type Target = Policy;

    fn deref(&self) -> &Policy {
        &self.policy
    }
}

impl Drop for PolicyRef<'_> {
    fn drop(&mut self) {
        self.policy.unborrow();
        self.slot.unpin();
    }
}

impl core::fmt::Debug for PolicyRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PolicyRef")
            .field("policy", &*self.policy)
            .finish()
    }
}

impl PolicyTable {
    /// Borrow the policy of `cpu`, pinning the driver for the duration.
    ///
    /// Fails with [`Error::NoDriver`] when no driver is registered,
    /// [`Error::NotManaged`] when the CPU has no policy, and
    /// [`Error::StaleCpu`] when the policy is already being torn down.
    pub fn lookup<'a>(&self, cpu: u32, slot: &'a DriverSlot) -> Result<PolicyRef<'a>> {
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        if !slot.pin() {
            return Err(Error::NoDriver);
        }

        let policy = match self.get(cpu) {
            Some(policy) => policy,
            None => {
                slot.unpin();
                return Err(Error::NotManaged);
            }
        };

        if !policy.borrow() {
            slot.unpin();
            return Err(Error::StaleCpu);
        }

        Ok(PolicyRef { policy, slot })
    }
}

// =============================================================================
// TESTS
// =============================================================================
