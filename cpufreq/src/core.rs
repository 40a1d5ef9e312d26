//! # Core Façade
//!
//! [`CpuFreq`] owns every subsystem of the frequency scaling core and
//! exposes the public operation surface: hotplug entry points, driver
//! and governor facilities, notifier registration, and the per-CPU
//! get/set operations.
//!
//! A process-global instance is available through [`global`]; tests
//! construct their own instances.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;

use spin::{Mutex, Once, RwLock};

use crate::driver::{Driver, DriverFlags, DriverOps, DriverSlot, DriverView, Relation};
use crate::error::{Error, Result};
use crate::governor::{GovernedPolicy, Governor, GovernorEvent, GovernorRegistry, GovernorState};
use crate::hotplug::{CpuPhase, PhaseTable, SavedPolicy};
use crate::mask::{AtomicCpuMask, CpuMask, MAX_CPUS};
use crate::negotiate::ConstraintProvider;
use crate::notify::{
    self, FreqChange, PolicyChain, PolicyEvent, SubscriptionId, TimingRef, TransitionChain,
    TransitionPhase, TransitionScope,
};
use crate::policy::{Policy, PolicyData, PolicySnapshot, ScalingMode, UserLimits};
use crate::registry::{PolicyRef, PolicyTable};
use crate::router::LockRouter;

// =============================================================================
// CORE
// =============================================================================

/// The assembled frequency scaling core.
pub struct CpuFreq {
    pub(crate) table: PolicyTable,
    pub(crate) router: LockRouter,
    pub(crate) online: AtomicCpuMask,
    pub(crate) phases: PhaseTable,
    pub(crate) driver: DriverSlot,
    pub(crate) governors: GovernorRegistry,
    pub(crate) transitions: TransitionChain,
    pub(crate) policy_events: PolicyChain,
    pub(crate) saved: Mutex<BTreeMap<u32, SavedPolicy>>,
    pub(crate) pending: Mutex<CpuMask>,
    pub(crate) timing: TimingRef,
    pub(crate) constraints: RwLock<Option<Arc<dyn ConstraintProvider>>>,
    pub(crate) default_governor: Mutex<Option<String>>,
    disabled: AtomicBool,
}

impl CpuFreq {
    pub fn new() -> Self {
        Self {
            table: PolicyTable::new(),
            router: LockRouter::new(),
            online: AtomicCpuMask::new(),
            phases: PhaseTable::new(),
            driver: DriverSlot::new(),
            governors: GovernorRegistry::new(),
            transitions: TransitionChain::new(),
            policy_events: PolicyChain::new(),
            saved: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(CpuMask::empty()),
            timing: TimingRef::new(0),
            constraints: RwLock::new(None),
            default_governor: Mutex::new(None),
            disabled: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Administrative
    // -------------------------------------------------------------------------

    /// Permanently disable the core. All mutating entry points fail
    /// with [`Error::Disabled`] afterwards.
    pub fn disable(&self) {
        log::warn!("cpufreq: disabled");
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_enabled(&self) -> Result<()> {
        if self.is_disabled() {
            Err(Error::Disabled)
        } else {
            Ok(())
        }
    }

    /// Seed the frequency-derived timing reference.
    pub fn seed_timing_reference(&self, value: u64) {
        self.timing.seed(value);
    }

    pub fn timing_reference(&self) -> u64 {
        self.timing.current()
    }

    // -------------------------------------------------------------------------
    // Driver facility
    // -------------------------------------------------------------------------

    /// Install `driver` and bring every already-online CPU under
    /// management. Unless the driver is [`DriverFlags::STICKY`], ending
    /// up with no managed CPU unwinds the registration.
    pub fn register_driver(&self, driver: Arc<dyn Driver>) -> Result<()> {
        self.ensure_enabled()?;
        self.driver.register(driver)?;

        for cpu in self.online.snapshot() {
            if let Err(e) = self.on_cpu_online(cpu) {
                log::warn!(
                    "cpufreq: CPU {} not managed after driver registration: {}",
                    cpu,
                    e
                );
            }
        }

        let active = match self.driver.active() {
            Some(active) => active,
            None => return Err(Error::NoDriver),
        };
        if self.table.is_empty() && !active.flags.contains(DriverFlags::STICKY) {
            log::warn!(
                "cpufreq: driver {} initialized no CPUs, unregistering",
                active.driver.name()
            );
            self.driver.clear();
            return Err(Error::DriverRejected);
        }
        Ok(())
    }

    /// Tear down every policy and remove the driver. Fails while any
    /// outstanding policy borrow pins the driver.
    pub fn unregister_driver(&self) -> Result<()> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;

        // Retire policies CPU by CPU; representatives migrate until
        // each domain's last member tears the policy down.
        for cpu in self.table.managed_cpus() {
            if let Err(e) = self.retire_cpu(cpu, &driver) {
                log::warn!("cpufreq: CPU {} retire failed during unregister: {}", cpu, e);
            }
            self.phases.set(cpu, CpuPhase::Offline);
        }

        self.driver.unregister()
    }

    /// Name of the registered driver, if any.
    pub fn driver_name(&self) -> Option<&'static str> {
        self.driver.active().map(|a| a.driver.name())
    }

    /// Firmware frequency cap for `cpu`, if the driver can read one.
    pub fn bios_limit(&self, cpu: u32) -> Result<u32> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        let r = self.lookup(cpu)?;
        if driver.ops.contains(DriverOps::BIOS_LIMIT) {
            driver.driver.bios_limit(r.representative())
        } else {
            // Without firmware information the hardware maximum is the
            // honest answer.
            Ok(r.data.read().hw.max_khz)
        }
    }

    // -------------------------------------------------------------------------
    // Governor facility
    // -------------------------------------------------------------------------

    pub fn register_governor(&self, gov: Arc<dyn Governor>) -> Result<()> {
        self.ensure_enabled()?;
        self.governors.register(gov)
    }

    /// Remove a governor and scrub it from any saved offline-CPU state.
    pub fn unregister_governor(&self, name: &str) -> Result<()> {
        self.governors.unregister(name)?;

        let mut saved = self.saved.lock();
        for snapshot in saved.values_mut() {
            if snapshot.governor.as_deref() == Some(name) {
                snapshot.governor = None;
            }
        }

        let mut default = self.default_governor.lock();
        if default.as_deref() == Some(name) {
            *default = None;
        }
        Ok(())
    }

    /// Governor substituted when a latency constraint cannot be met.
    pub fn set_fallback_governor(&self, name: &str) -> Result<()> {
        self.governors.set_fallback(name)
    }

    /// Governor attached to freshly created policies.
    pub fn set_default_governor(&self, name: &str) -> Result<()> {
        self.governors.get(name).ok_or(Error::UnknownGovernor)?;
        *self.default_governor.lock() = Some(String::from(name));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Notifier registration
    // -------------------------------------------------------------------------

    pub fn register_transition_notifier<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(TransitionPhase, &FreqChange) + Send + Sync + 'static,
    {
        self.transitions.register(handler)
    }

    pub fn unregister_transition_notifier(&self, id: SubscriptionId) -> bool {
        self.transitions.unregister(id)
    }

    pub fn register_policy_notifier<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(PolicyEvent, &mut crate::policy::PolicyRequest) + Send + Sync + 'static,
    {
        self.policy_events.register(handler)
    }

    pub fn unregister_policy_notifier(&self, id: SubscriptionId) -> bool {
        self.policy_events.unregister(id)
    }

    /// Install the source of externally imposed frequency constraints.
    pub fn set_constraint_provider(&self, provider: Arc<dyn ConstraintProvider>) {
        *self.constraints.write() = Some(provider);
    }

    // -------------------------------------------------------------------------
    // Lock routing
    // -------------------------------------------------------------------------

    /// Resolve `cpu`'s domain, take its group lock for reading, and
    /// re-check the CPU is still online before running `f`.
    pub(crate) fn with_policy_read<T>(
        &self,
        cpu: u32,
        f: impl FnOnce(&Policy, &PolicyData) -> Result<T>,
    ) -> Result<T> {
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        let owner = self.router.owner_of(cpu).ok_or(Error::NotManaged)?;
        let policy = self.table.get(cpu).ok_or(Error::NotManaged)?;
        let data = policy.data.read();
        if !self.online.contains(cpu) || self.router.owner_of(cpu) != Some(owner) {
            return Err(Error::StaleCpu);
        }
        f(&policy, &data)
    }

    /// Write-mode variant of [`with_policy_read`](CpuFreq::with_policy_read).
    pub(crate) fn with_policy_write<T>(
        &self,
        cpu: u32,
        f: impl FnOnce(&Policy, &mut PolicyData) -> Result<T>,
    ) -> Result<T> {
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        let owner = self.router.owner_of(cpu).ok_or(Error::NotManaged)?;
        let policy = self.table.get(cpu).ok_or(Error::NotManaged)?;
        let mut data = policy.data.write();
        if !self.online.contains(cpu) || self.router.owner_of(cpu) != Some(owner) {
            return Err(Error::StaleCpu);
        }
        f(&policy, &mut data)
    }

    pub(crate) fn scope_for<'a>(
        &'a self,
        policy: &'a Policy,
        data: &PolicyData,
        const_loops: bool,
    ) -> TransitionScope<'a> {
        TransitionScope {
            chain: &self.transitions,
            timing: &self.timing,
            online_cpus: self.online.weight(),
            const_loops,
            policy,
            cpus: data.cpus,
        }
    }

    // -------------------------------------------------------------------------
    // Governor activation
    // -------------------------------------------------------------------------

    /// Deliver one lifecycle event to the policy's governor, enforcing
    /// the latency gate and the registry pin accounting.
    pub(crate) fn run_governor(
        &self,
        policy: &Policy,
        data: &mut PolicyData,
        event: GovernorEvent,
    ) -> Result<()> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        let attached = data.governor.clone().ok_or(Error::Ungoverned)?;

        let gov = self
            .governors
            .latency_gate(attached, data.hw.transition_latency_us)?;
        if data
            .governor
            .as_ref()
            .is_some_and(|g| g.name() != gov.name())
        {
            data.governor = Some(gov.clone());
        }
        let name = gov.name();

        log::debug!(
            "cpufreq: governor {} event {:?} on CPU {}",
            name,
            event,
            policy.representative()
        );

        // A started governor holds a registry pin so it cannot be
        // unregistered under a running policy.
        if event == GovernorEvent::Start {
            self.governors.pin(name)?;
        }

        let mut view = GovernedPolicy {
            policy,
            data: &mut *data,
            driver: &driver,
            chain: &self.transitions,
            timing: &self.timing,
            online_cpus: self.online.weight(),
        };
        let result = gov.govern(&mut view, event);
        drop(view);

        match (event, &result) {
            (GovernorEvent::Init, Ok(())) => data.gov_state = GovernorState::Initialized,
            (GovernorEvent::Start, Ok(())) => data.gov_state = GovernorState::Running,
            (GovernorEvent::Start, Err(_)) => self.governors.unpin(name),
            (GovernorEvent::Stop, Ok(())) => {
                self.governors.unpin(name);
                data.gov_state = GovernorState::Stopped;
            }
            _ => {}
        }
        result
    }

    // -------------------------------------------------------------------------
    // Per-CPU operations
    // -------------------------------------------------------------------------

    /// Owned snapshot of the policy managing `cpu`.
    pub fn get_policy(&self, cpu: u32) -> Result<PolicySnapshot> {
        let r = self.lookup(cpu)?;
        Ok(r.snapshot())
    }

    /// Request new user frequency limits for `cpu`'s domain.
    ///
    /// The stored user limits are updated only if negotiation succeeds;
    /// on any failure the previous bounds remain in force.
    pub fn set_user_limits(&self, cpu: u32, min_khz: u32, max_khz: u32) -> Result<()> {
        self.ensure_enabled()?;
        if min_khz > max_khz {
            return Err(Error::RangeConflict);
        }
        let _pin = self.lookup(cpu)?;
        self.with_policy_write(cpu, |policy, data| {
            self.set_policy_locked(policy, data, min_khz, max_khz, None, None)?;
            data.user = UserLimits {
                min_khz: data.min_khz,
                max_khz: data.max_khz,
            };
            Ok(())
        })
    }

    /// Attach a different governor (or, for autonomous hardware, select
    /// a different fixed operating point) on `cpu`'s domain.
    pub fn set_governor(&self, cpu: u32, name: &str) -> Result<()> {
        self.ensure_enabled()?;
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        let _pin = self.lookup(cpu)?;

        // Autonomous hardware knows only the two fixed operating points.
        if driver.ops.contains(DriverOps::SETPOLICY) {
            let kind = crate::policy::HwPolicyKind::parse(name).ok_or(Error::UnknownGovernor)?;
            return self.with_policy_write(cpu, |policy, data| {
                let (min, max) = (data.min_khz, data.max_khz);
                self.set_policy_locked(
                    policy,
                    data,
                    min,
                    max,
                    None,
                    Some(ScalingMode::HwPolicy(kind)),
                )
            });
        }

        let gov = self.governors.get(name).ok_or(Error::UnknownGovernor)?;
        self.with_policy_write(cpu, |policy, data| {
            let (min, max) = (data.min_khz, data.max_khz);
            self.set_policy_locked(policy, data, min, max, Some(gov), None)
        })
    }

    /// Re-run negotiation from the stored user limits, correcting the
    /// recorded frequency first if the hardware moved on its own.
    pub fn update_policy(&self, cpu: u32) -> Result<()> {
        self.ensure_enabled()?;
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        let _pin = self.lookup(cpu)?;

        self.with_policy_write(cpu, |policy, data| {
            if driver.ops.contains(DriverOps::GET) {
                let hw_khz = driver.driver.get(policy.representative())?;
                let cur = policy.cur_khz();
                if cur == 0 {
                    policy.set_cur_khz(hw_khz);
                } else if hw_khz != 0 && hw_khz != cur {
                    if driver.const_loops() {
                        // Timing-invariant hardware needs no synthetic
                        // transition pair; adopt the reported value.
                        policy.set_cur_khz(hw_khz);
                    } else {
                        let scope = self.scope_for(policy, data, driver.const_loops());
                        notify::out_of_sync(&scope, policy.representative(), cur, hw_khz);
                    }
                }
            }
            let (min, max) = (data.user.min_khz, data.user.max_khz);
            self.set_policy_locked(policy, data, min, max, None, None)
        })
    }

    /// Last committed frequency of `cpu`, without touching hardware.
    /// Autonomous hardware with a readable counter is the exception:
    /// there the recorded value would be meaningless.
    pub fn quick_get(&self, cpu: u32) -> Result<u32> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        if driver.ops.contains(DriverOps::SETPOLICY) && driver.ops.contains(DriverOps::GET) {
            return driver.driver.get(cpu);
        }
        let r = self.lookup(cpu)?;
        Ok(r.cur_khz())
    }

    /// Effective upper bound of `cpu`'s domain.
    pub fn quick_get_max(&self, cpu: u32) -> Result<u32> {
        let r = self.lookup(cpu)?;
        let max = r.data.read().max_khz;
        Ok(max)
    }

    /// Last published utilization of `cpu`'s domain, percent.
    pub fn quick_get_util(&self, cpu: u32) -> Result<u32> {
        let r = self.lookup(cpu)?;
        Ok(r.util())
    }

    /// Publish a utilization hint for `cpu`'s domain.
    pub fn set_utilization(&self, cpu: u32, util_pct: u32) -> Result<()> {
        self.ensure_enabled()?;
        let r = self.lookup(cpu)?;
        r.set_util(util_pct.min(100));
        Ok(())
    }

    /// Read the live hardware frequency of `cpu`, correcting the
    /// recorded value (and queueing a re-evaluation) on drift.
    pub fn get(&self, cpu: u32) -> Result<u32> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        if !driver.ops.contains(DriverOps::GET) {
            return Err(Error::NotSupported);
        }
        let _pin = self.lookup(cpu)?;

        self.with_policy_read(cpu, |policy, data| {
            let hw_khz = driver.driver.get(policy.representative())?;
            let cur = policy.cur_khz();
            if hw_khz != 0 && cur != 0 && hw_khz != cur && !driver.const_loops() {
                let scope = self.scope_for(policy, data, driver.const_loops());
                notify::out_of_sync(&scope, cpu, cur, hw_khz);
                self.pending.lock().set(cpu);
            }
            Ok(hw_khz)
        })
    }

    /// Ask the driver to run `cpu`'s domain at `target_khz`.
    pub fn target(&self, cpu: u32, target_khz: u32, relation: Relation) -> Result<()> {
        self.ensure_enabled()?;
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        if !driver.ops.contains(DriverOps::TARGET) {
            return Err(Error::NotSupported);
        }
        let _pin = self.lookup(cpu)?;

        self.with_policy_write(cpu, |policy, data| {
            let target = target_khz.clamp(data.min_khz, data.max_khz);
            if target == policy.cur_khz() {
                return Ok(());
            }
            let data = &*data;
            let view = DriverView {
                data,
                scope: self.scope_for(policy, data, driver.const_loops()),
            };
            driver.driver.target(&view, target, relation)
        })
    }

    /// Recent average frequency of `cpu`, if the hardware tracks it.
    pub fn getavg(&self, cpu: u32) -> Result<u32> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        if !driver.ops.contains(DriverOps::GETAVG) {
            return Err(Error::NotSupported);
        }
        let _pin = self.lookup(cpu)?;

        self.with_policy_read(cpu, |policy, data| {
            let view = DriverView {
                data,
                scope: self.scope_for(policy, data, driver.const_loops()),
            };
            driver.driver.getavg(&view, policy.representative())
        })
    }

    // -------------------------------------------------------------------------
    // Power transitions
    // -------------------------------------------------------------------------

    /// Quiesce `cpu`'s domain for a system sleep transition.
    pub fn suspend_one(&self, cpu: u32) -> Result<()> {
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        if !driver.ops.contains(DriverOps::SUSPEND) {
            return Ok(());
        }
        let _pin = self.lookup(cpu)?;
        self.with_policy_read(cpu, |policy, data| {
            let view = DriverView {
                data,
                scope: self.scope_for(policy, data, driver.const_loops()),
            };
            driver.driver.suspend(&view)
        })
    }

    /// Restore `cpu`'s domain after a system sleep transition and queue
    /// a deferred re-evaluation (firmware may have changed the speed).
    pub fn resume_one(&self, cpu: u32) -> Result<()> {
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        if driver.ops.contains(DriverOps::RESUME) {
            let _pin = self.lookup(cpu)?;
            self.with_policy_read(cpu, |policy, data| {
                let view = DriverView {
                    data,
                    scope: self.scope_for(policy, data, driver.const_loops()),
                };
                driver.driver.resume(&view)
            })?;
        }
        self.pending.lock().set(cpu);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Deferred work
    // -------------------------------------------------------------------------

    /// Drain the deferred re-evaluation queue. Called from maintenance
    /// context after drift detection or resume.
    pub fn process_pending(&self) {
        let pending = {
            let mut queue = self.pending.lock();
            let snapshot = *queue;
            *queue = CpuMask::empty();
            snapshot
        };
        for cpu in pending {
            if let Err(e) = self.update_policy(cpu) {
                log::debug!("cpufreq: deferred update of CPU {} failed: {}", cpu, e);
            }
        }
    }

    /// Borrow the policy of `cpu`. Crate-internal; external callers use
    /// the snapshot and quick accessors.
    pub(crate) fn lookup(&self, cpu: u32) -> Result<PolicyRef<'_>> {
        self.table.lookup(cpu, &self.driver)
    }
}

impl Default for CpuFreq {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CpuFreq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuFreq")
            .field("online", &self.online.snapshot())
            .field("managed", &self.table.managed_cpus())
            .field("driver", &self.driver_name())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// GLOBAL INSTANCE
// =============================================================================

static CPUFREQ: Once<CpuFreq> = Once::new();

/// Process-global core instance, created on first use.
pub fn global() -> &'static CpuFreq {
    CPUFREQ.call_once(CpuFreq::new)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{TableDriver, TestGovernor};
    use crate::hotplug::OnlineStatus;
    use alloc::vec;
    use alloc::vec::Vec;

    fn core_with_governor(name: &'static str) -> CpuFreq {
        let core = CpuFreq::new();
        core.register_governor(TestGovernor::named(name)).unwrap();
        core.set_default_governor(name).unwrap();
        core
    }

    fn managed_core() -> (CpuFreq, Arc<TableDriver>) {
        let core = core_with_governor("testgov");
        let driver = TableDriver::with_freqs(vec![200_000, 400_000, 800_000]);
        core.driver.register(driver.clone()).unwrap();
        assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Managed));
        (core, driver)
    }

    // -------------------------------------------------------------------------
    // Driver facility
    // -------------------------------------------------------------------------

    #[test]
    fn test_register_driver_probes_online_cpus() {
        let core = core_with_governor("testgov");
        assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
        assert_eq!(core.on_cpu_online(1), Ok(OnlineStatus::Unmanaged));

        core.register_driver(TableDriver::with_freqs(vec![200_000, 800_000]))
            .unwrap();
        assert!(core.get_policy(0).is_ok());
        assert!(core.get_policy(1).is_ok());
        assert_eq!(core.driver_name(), Some("table-test"));
    }

    #[test]
    fn test_register_driver_unwinds_without_cpus() {
        let core = core_with_governor("testgov");
        assert_eq!(
            core.register_driver(TableDriver::with_freqs(vec![200_000, 800_000])),
            Err(Error::DriverRejected)
        );
        assert_eq!(core.driver_name(), None);
    }

    #[test]
    fn test_sticky_driver_stays_without_cpus() {
        let core = core_with_governor("testgov");
        let driver = TableDriver::with_flags(vec![200_000, 800_000], DriverFlags::STICKY);
        core.register_driver(driver).unwrap();
        assert_eq!(core.driver_name(), Some("table-test"));

        // CPUs can still be adopted later.
        assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Managed));
    }

    #[test]
    fn test_unregister_driver_tears_down_policies() {
        let (core, driver) = managed_core();
        core.unregister_driver().unwrap();

        assert_eq!(core.driver_name(), None);
        assert_eq!(core.get_policy(0), Err(Error::NoDriver));
        assert!(!core.router.is_mapped(0));
        assert_eq!(driver.exited.lock().as_slice(), &[0]);
        // User-visible state survives for a future driver.
        assert!(core.saved.lock().contains_key(&0));
    }

    #[test]
    fn test_bios_limit_defaults_to_hardware_max() {
        let (core, _driver) = managed_core();
        assert_eq!(core.bios_limit(0), Ok(800_000));
    }

    // -------------------------------------------------------------------------
    // Disable gate
    // -------------------------------------------------------------------------

    #[test]
    fn test_disable_rejects_mutation() {
        let (core, _driver) = managed_core();
        core.disable();
        assert!(core.is_disabled());
        assert_eq!(core.set_user_limits(0, 200_000, 400_000), Err(Error::Disabled));
        assert_eq!(core.target(0, 400_000, Relation::Highest), Err(Error::Disabled));
        assert_eq!(core.update_policy(0), Err(Error::Disabled));
        // Reads still work.
        assert!(core.get_policy(0).is_ok());
    }

    // -------------------------------------------------------------------------
    // Per-CPU operations
    // -------------------------------------------------------------------------

    #[test]
    fn test_quick_accessors() {
        let (core, _driver) = managed_core();
        // The governor chased the ceiling on start.
        assert_eq!(core.quick_get(0), Ok(800_000));
        assert_eq!(core.quick_get_max(0), Ok(800_000));

        core.set_utilization(0, 250).unwrap();
        // Percentages saturate.
        assert_eq!(core.quick_get_util(0), Ok(100));

        assert_eq!(core.quick_get(7), Err(Error::NotManaged));
    }

    #[test]
    fn test_target_clamps_to_policy_bounds() {
        let (core, driver) = managed_core();
        core.set_user_limits(0, 200_000, 400_000).unwrap();

        // Requests below the floor are raised to it.
        core.target(0, 0, Relation::Lowest).unwrap();
        assert_eq!(driver.last_programmed(), Some((0, 200_000)));

        // Requests above the ceiling are lowered to it.
        core.target(0, 800_000, Relation::Highest).unwrap();
        assert_eq!(driver.last_programmed(), Some((0, 400_000)));
        assert_eq!(core.quick_get(0), Ok(400_000));

        // Re-targeting the current frequency never reaches the driver.
        let programmed = driver.programmed.lock().len();
        core.target(0, 400_000, Relation::Highest).unwrap();
        assert_eq!(driver.programmed.lock().len(), programmed);
    }

    #[test]
    fn test_get_corrects_drift_and_defers_update() {
        let (core, driver) = managed_core();
        assert_eq!(core.quick_get(0), Ok(800_000));

        // Firmware silently throttled the core.
        driver.fake_hw_freq(0, 400_000);
        assert_eq!(core.get(0), Ok(400_000));
        assert_eq!(core.quick_get(0), Ok(400_000));
        assert!(core.pending.lock().contains(0));

        // The deferred re-evaluation renegotiates and the governor
        // climbs back to the ceiling.
        core.process_pending();
        assert!(core.pending.lock().is_empty());
        assert_eq!(core.quick_get(0), Ok(800_000));
    }

    #[test]
    fn test_getavg_reports_current() {
        let (core, _driver) = managed_core();
        assert_eq!(core.getavg(0), Ok(800_000));
    }

    #[test]
    fn test_suspend_resume_queues_reevaluation() {
        let (core, _driver) = managed_core();
        // No suspend hook: quiescing is a no-op.
        core.suspend_one(0).unwrap();
        core.resume_one(0).unwrap();
        assert!(core.pending.lock().contains(0));
    }

    #[test]
    fn test_power_transitions_reject_out_of_range_cpu() {
        let (core, _driver) = managed_core();
        assert_eq!(core.suspend_one(MAX_CPUS as u32), Err(Error::InvalidCpu));
        assert_eq!(core.resume_one(MAX_CPUS as u32), Err(Error::InvalidCpu));
        assert!(core.pending.lock().is_empty());
    }

    #[test]
    fn test_update_policy_syncs_silently_for_const_loops() {
        let core = core_with_governor("testgov");
        let driver =
            TableDriver::with_flags(vec![200_000, 400_000, 800_000], DriverFlags::CONST_LOOPS);
        core.driver.register(driver.clone()).unwrap();
        assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Managed));
        assert_eq!(core.quick_get(0), Ok(800_000));

        let log: Arc<Mutex<Vec<(TransitionPhase, u32, u32)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        core.register_transition_notifier(move |phase, change| {
            sink.lock().push((phase, change.old_khz, change.new_khz));
        });

        // Firmware throttled the core behind our back.
        driver.fake_hw_freq(0, 400_000);
        core.update_policy(0).unwrap();

        // Timing-invariant hardware gets no synthetic pair: the cached
        // value is adopted quietly and the only broadcast is the
        // governor climbing back from it.
        assert_eq!(
            log.lock().clone(),
            vec![
                (TransitionPhase::Pre, 400_000, 800_000),
                (TransitionPhase::Post, 400_000, 800_000),
            ]
        );
        assert_eq!(core.quick_get(0), Ok(800_000));
    }

    #[test]
    fn test_transition_notifier_sees_governor_moves() {
        let (core, _driver) = managed_core();
        let log: Arc<Mutex<Vec<(TransitionPhase, u32, u32)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let id = core.register_transition_notifier(move |phase, change| {
            sink.lock().push((phase, change.old_khz, change.new_khz));
        });

        core.set_user_limits(0, 200_000, 400_000).unwrap();
        let seen = log.lock().clone();
        assert_eq!(
            seen,
            vec![
                (TransitionPhase::Pre, 800_000, 400_000),
                (TransitionPhase::Post, 800_000, 400_000),
            ]
        );

        assert!(core.unregister_transition_notifier(id));
        core.set_user_limits(0, 200_000, 800_000).unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    // -------------------------------------------------------------------------
    // Latency gating
    // -------------------------------------------------------------------------

    #[test]
    fn test_slow_hardware_falls_back() {
        let core = CpuFreq::new();
        core.register_governor(TestGovernor::with_latency("picky", 10))
            .unwrap();
        core.register_governor(TestGovernor::named("relaxed")).unwrap();
        core.set_fallback_governor("relaxed").unwrap();
        core.set_default_governor("picky").unwrap();
        core.driver
            .register(TableDriver::with_latency(vec![200_000, 800_000], 50))
            .unwrap();

        core.on_cpu_online(0).unwrap();
        let snap = core.get_policy(0).unwrap();
        assert_eq!(snap.governor.as_deref(), Some("relaxed"));
        assert_eq!(snap.gov_state, GovernorState::Running);
    }

    #[test]
    fn test_slow_hardware_without_fallback_fails() {
        let core = CpuFreq::new();
        core.register_governor(TestGovernor::with_latency("picky", 10))
            .unwrap();
        core.set_default_governor("picky").unwrap();
        core.driver
            .register(TableDriver::with_latency(vec![200_000, 800_000], 50))
            .unwrap();

        assert_eq!(core.on_cpu_online(0), Err(Error::LatencyIncompatible));
        assert!(core.get_policy(0).is_err());
    }

    // -------------------------------------------------------------------------
    // Governor facility
    // -------------------------------------------------------------------------

    #[test]
    fn test_unregister_governor_scrubs_saved_state() {
        let (core, _driver) = managed_core();
        core.on_cpu_offline(0).unwrap();
        assert_eq!(
            core.saved.lock().get(&0).and_then(|s| s.governor.clone()),
            Some(String::from("testgov"))
        );

        core.unregister_governor("testgov").unwrap();
        assert!(core.saved.lock().get(&0).is_some_and(|s| s.governor.is_none()));
    }

    #[test]
    fn test_running_governor_cannot_be_unregistered() {
        let (core, _driver) = managed_core();
        assert_eq!(core.unregister_governor("testgov"), Err(Error::GovernorInUse));
    }
}
