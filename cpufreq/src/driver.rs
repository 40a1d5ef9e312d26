//! # Hardware Driver Interface
//!
//! Exactly one [`Driver`] is registered at a time. It enumerates clock
//! domains at CPU online (`init`), validates candidate bounds
//! (`verify`), and either programs explicit frequencies (`target`) or
//! conveys a range to autonomous hardware (`setpolicy`). Optional hooks
//! are declared in [`DriverOps`]; the core checks the capability set
//! instead of probing for default implementations.
//!
//! While any policy is borrowed the driver is *pinned* and cannot be
//! unregistered.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::mask::CpuMask;
use crate::notify::TransitionScope;
use crate::policy::{HwPolicyKind, PolicyData, PolicyRequest};

// =============================================================================
// CAPABILITIES AND FLAGS
// =============================================================================

bitflags! {
    /// Optional operations a driver implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverOps: u16 {
        const TARGET     = 1 << 0;
        const SETPOLICY  = 1 << 1;
        const GET        = 1 << 2;
        const GETAVG     = 1 << 3;
        const SUSPEND    = 1 << 4;
        const RESUME     = 1 << 5;
        const EXIT       = 1 << 6;
        const BIOS_LIMIT = 1 << 7;
    }
}

bitflags! {
    /// Driver behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFlags: u8 {
        /// The delay-loop rate does not follow the frequency; drift
        /// correction and timing rescale are skipped.
        const CONST_LOOPS = 1 << 0;
        /// Stay registered even when no CPU could be initialized.
        const STICKY      = 1 << 1;
    }
}

/// Rounding direction when the requested frequency is not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Lowest frequency at or above the target.
    Lowest,
    /// Highest frequency at or below the target.
    Highest,
}

// =============================================================================
// DRIVER TRAIT
// =============================================================================

/// A CPU frequency hardware driver.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Which optional operations this driver implements.
    fn ops(&self) -> DriverOps;

    fn flags(&self) -> DriverFlags {
        DriverFlags::empty()
    }

    /// Discover the clock domain of `cpu`: fill in hardware limits,
    /// initial bounds and domain membership. Returns the current
    /// frequency in kHz.
    fn init(&self, cpu: u32, data: &mut PolicyData) -> Result<u32>;

    /// Validate and, if needed, narrow a candidate bound range.
    fn verify(&self, req: &mut PolicyRequest) -> Result<()>;

    /// Program the domain to run at `target_khz` (rounded per
    /// `relation`). Implementations wrap the hardware write in
    /// [`DriverView::transition`].
    fn target(&self, _view: &DriverView<'_>, _target_khz: u32, _relation: Relation) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Convey the negotiated range to autonomously scaling hardware.
    fn setpolicy(&self, _view: &DriverView<'_>, _kind: HwPolicyKind) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Read the current frequency of `cpu` from the hardware.
    fn get(&self, _cpu: u32) -> Result<u32> {
        Err(Error::NotSupported)
    }

    /// Average frequency over the recent past, if the hardware tracks it.
    fn getavg(&self, _view: &DriverView<'_>, _cpu: u32) -> Result<u32> {
        Err(Error::NotSupported)
    }

    fn suspend(&self, _view: &DriverView<'_>) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn resume(&self, _view: &DriverView<'_>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Release per-domain driver state.
    fn exit(&self, _view: &DriverView<'_>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Frequency cap imposed by firmware, if readable.
    fn bios_limit(&self, _cpu: u32) -> Result<u32> {
        Err(Error::NotSupported)
    }
}

// =============================================================================
// DRIVER VIEW
// =============================================================================

/// Read-only policy view handed to driver hooks, plus the transition
/// scope the driver uses to announce frequency changes.
pub struct DriverView<'a> {
    pub(crate) data: &'a PolicyData,
    pub(crate) scope: TransitionScope<'a>,
}

impl DriverView<'_> {
    /// Representative CPU of the domain.
    pub fn cpu(&self) -> u32 {
        self.scope.policy.representative()
    }

    pub fn min_khz(&self) -> u32 {
        self.data.min_khz
    }

    pub fn max_khz(&self) -> u32 {
        self.data.max_khz
    }

    /// Last committed frequency.
    pub fn cur_khz(&self) -> u32 {
        self.scope.policy.cur_khz()
    }

    /// Online CPUs of the domain.
    pub fn cpus(&self) -> CpuMask {
        self.data.cpus
    }

    pub fn related(&self) -> CpuMask {
        self.data.related
    }

    /// Announce a change from `old_khz` to `new_khz` around the
    /// hardware write `program`: pre notifications, the write, then
    /// post notifications and the frequency commit. A failing write
    /// reverts observers to `old_khz`.
    pub fn transition<F>(&self, old_khz: u32, new_khz: u32, program: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.scope.run(old_khz, new_khz, program)
    }
}

impl core::fmt::Debug for DriverView<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverView")
            .field("cpu", &self.cpu())
            .field("min_khz", &self.min_khz())
            .field("max_khz", &self.max_khz())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// DRIVER SLOT
// =============================================================================

/// The registered driver with its effective capability set.
#[derive(Clone)]
pub struct ActiveDriver {
    pub driver: Arc<dyn Driver>,
    pub ops: DriverOps,
    pub flags: DriverFlags,
}

impl ActiveDriver {
    pub fn const_loops(&self) -> bool {
        self.flags.contains(DriverFlags::CONST_LOOPS)
    }
}

impl core::fmt::Debug for ActiveDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActiveDriver")
            .field("name", &self.driver.name())
            .field("ops", &self.ops)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Process-wide driver singleton with a pin count.
#[derive(Debug)]
pub struct DriverSlot {
    active: Mutex<Option<ActiveDriver>>,
    pins: AtomicUsize,
}

impl DriverSlot {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            pins: AtomicUsize::new(0),
        }
    }

    /// Validate and install a driver.
    ///
    /// A driver must implement `target` or `setpolicy` to be useful.
    /// `setpolicy` hardware runs at rates the core never observes, so
    /// it implies [`DriverFlags::CONST_LOOPS`].
    pub fn register(&self, driver: Arc<dyn Driver>) -> Result<()> {
        let ops = driver.ops();
        if !ops.intersects(DriverOps::TARGET | DriverOps::SETPOLICY) {
            return Err(Error::DriverRejected);
        }

        let mut flags = driver.flags();
        if ops.contains(DriverOps::SETPOLICY) {
            flags |= DriverFlags::CONST_LOOPS;
        }

        let mut slot = self.active.lock();
        if slot.is_some() {
            return Err(Error::DriverBusy);
        }
        log::debug!("cpufreq: registering driver {}", driver.name());
        *slot = Some(ActiveDriver {
            driver,
            ops,
            flags,
        });
        Ok(())
    }

    /// Remove the driver. Fails while any policy borrow pins it.
    pub fn unregister(&self) -> Result<()> {
        if self.pins.load(Ordering::SeqCst) != 0 {
            return Err(Error::DriverBusy);
        }
        let mut slot = self.active.lock();
        match slot.take() {
            Some(active) => {
                log::debug!("cpufreq: unregistered driver {}", active.driver.name());
                Ok(())
            }
            None => Err(Error::NoDriver),
        }
    }

    /// Remove the driver without the pin check. Teardown only.
    pub(crate) fn clear(&self) {
        *self.active.lock() = None;
    }

    pub fn active(&self) -> Option<ActiveDriver> {
        self.active.lock().clone()
    }

    pub(crate) fn pin(&self) -> bool {
        if self.active.lock().is_none() {
            return false;
        }
        self.pins.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn pin_count(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }
}

impl Default for DriverSlot {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
