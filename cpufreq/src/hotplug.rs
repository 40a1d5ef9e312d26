//! CPU lifecycle: bringing CPUs under management and retiring them.
//!
//! A CPU coming online either becomes the representative of a fresh
//! policy, links into the policy of an already-online clock sibling, or
//! turns out to be managed already. A CPU going offline is unlinked
//! from its domain; when it was the representative, ownership migrates
//! to a surviving member, and when it was the last member the whole
//! policy is torn down:
//!
//! ```text
//!           online                     offline
//!   Offline ------> Onlining -> Owned ------> Offlining -> Offline
//!                       |        ^  |
//!                       v        |  v   (representative migration)
//!                     Linked ----+--'
//! ```
//!
//! Teardown drains outstanding policy borrows before releasing driver
//! state, and drops the router mapping only at the very end so that
//! concurrent resolutions keep finding a live object and fail on the
//! online re-check instead of dereferencing a dead one.

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::string::String;
use alloc::sync::Arc;

use crate::core::CpuFreq;
use crate::driver::{ActiveDriver, DriverOps, DriverView};
use crate::error::{Error, Result};
use crate::governor::{GovernorEvent, GovernorState};
use crate::mask::{CpuMask, MAX_CPUS};
use crate::notify::PolicyEvent;
use crate::policy::{HwPolicyKind, Policy, PolicyData, ScalingMode, UserLimits};

// =============================================================================
// PHASES
// =============================================================================

/// Lifecycle phase of a single CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuPhase {
    /// Not managed.
    Offline = 0,
    /// `on_cpu_online` is building or joining a policy for it.
    Onlining = 1,
    /// Representative of a live policy.
    Owned = 2,
    /// Member of a policy represented by another CPU.
    Linked = 3,
    /// `on_cpu_offline` is detaching it.
    Offlining = 4,
}

impl CpuPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CpuPhase::Onlining,
            2 => CpuPhase::Owned,
            3 => CpuPhase::Linked,
            4 => CpuPhase::Offlining,
            _ => CpuPhase::Offline,
        }
    }
}

/// Lock-free per-CPU phase table.
pub(crate) struct PhaseTable([AtomicU8; MAX_CPUS]);

impl PhaseTable {
    pub fn new() -> Self {
        Self(core::array::from_fn(|_| AtomicU8::new(CpuPhase::Offline as u8)))
    }

    pub fn get(&self, cpu: u32) -> CpuPhase {
        CpuPhase::from_u8(self.0[cpu as usize].load(Ordering::Acquire))
    }

    pub fn set(&self, cpu: u32, phase: CpuPhase) {
        self.0[cpu as usize].store(phase as u8, Ordering::Release);
    }
}

impl core::fmt::Debug for PhaseTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (cpu, slot) in self.0.iter().enumerate() {
            let phase = CpuPhase::from_u8(slot.load(Ordering::Relaxed));
            if phase != CpuPhase::Offline {
                map.entry(&cpu, &phase);
            }
        }
        map.finish()
    }
}

/// How an onlining CPU ended up managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineStatus {
    /// A fresh policy was created with this CPU as representative.
    Managed,
    /// The CPU joined the policy of an already-online clock sibling.
    Linked,
    /// The CPU was already covered by a live policy.
    AlreadyManaged,
    /// No driver is registered; the CPU is recorded as online and will
    /// be adopted when one arrives.
    Unmanaged,
}

/// User-visible policy state preserved across an offline/online cycle.
#[derive(Debug, Clone)]
pub(crate) struct SavedPolicy {
    pub governor: Option<String>,
    pub user: UserLimits,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl CpuFreq {
    /// Bring `cpu` under frequency management.
    pub fn on_cpu_online(&self, cpu: u32) -> Result<OnlineStatus> {
        self.ensure_enabled()?;
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        self.online.set(cpu);
        let driver = match self.driver.active() {
            Some(driver) => driver,
            None => return Ok(OnlineStatus::Unmanaged),
        };

        if self.table.get(cpu).is_some() {
            // Covered by a policy whose representative came up earlier.
            if self.phases.get(cpu) == CpuPhase::Offline {
                self.phases.set(cpu, CpuPhase::Linked);
            }
            return Ok(OnlineStatus::AlreadyManaged);
        }
        self.phases.set(cpu, CpuPhase::Onlining);

        let mut data = PolicyData::new(cpu);
        let cur_khz = match driver.driver.init(cpu, &mut data) {
            Ok(khz) => khz,
            Err(e) => {
                log::warn!("cpufreq: driver init failed for CPU {}: {}", cpu, e);
                self.phases.set(cpu, CpuPhase::Offline);
                return Err(e);
            }
        };

        data.related = data.related.or(CpuMask::single(cpu));
        data.cpus = data
            .cpus
            .or(CpuMask::single(cpu))
            .and(self.online.snapshot());
        data.user = UserLimits {
            min_khz: data.min_khz,
            max_khz: data.max_khz,
        };
        if driver.ops.contains(DriverOps::SETPOLICY) {
            data.mode = ScalingMode::HwPolicy(HwPolicyKind::Performance);
        }

        // Restore what the user had configured before this CPU last
        // went offline.
        let mut restored_gov = None;
        if let Some(snapshot) = self.saved.lock().remove(&cpu) {
            log::debug!("cpufreq: restoring saved policy state for CPU {}", cpu);
            data.user = snapshot.user;
            if let Some(name) = snapshot.governor {
                match data.mode {
                    ScalingMode::HwPolicy(_) => {
                        if let Some(kind) = HwPolicyKind::parse(&name) {
                            data.mode = ScalingMode::HwPolicy(kind);
                        }
                    }
                    ScalingMode::Governed => restored_gov = self.governors.get(&name),
                }
            }
        }

        // An online sibling sharing the clock domain already owns a
        // policy: join it instead of creating a second one.
        let sibling = data
            .related
            .iter()
            .filter(|&other| other != cpu)
            .find_map(|other| self.table.get(other));
        if let Some(sib) = sibling {
            return self.link_into(cpu, &sib, &driver, data);
        }

        let chosen_gov = match (data.mode, restored_gov) {
            (ScalingMode::HwPolicy(_), _) => None,
            (ScalingMode::Governed, Some(gov)) => Some(gov),
            (ScalingMode::Governed, None) => {
                let default = self.default_governor.lock().clone();
                match default.and_then(|name| self.governors.get(&name)) {
                    Some(gov) => Some(gov),
                    None => {
                        log::warn!("cpufreq: no governor available for CPU {}", cpu);
                        self.discard_domain(&driver, cpu, data);
                        self.phases.set(cpu, CpuPhase::Offline);
                        return Err(Error::UnknownGovernor);
                    }
                }
            }
        };

        let mut req = data.request(cpu);
        self.policy_events.broadcast(PolicyEvent::Start, &mut req);

        let members = data.cpus;
        let policy = Arc::new(Policy::new(cpu, data));
        policy.set_cur_khz(cur_khz);

        for member in members {
            self.table.insert(member, policy.clone());
            self.router.map(member, cpu);
        }

        let negotiated = {
            let mut d = policy.data.write();
            let (min, max) = (d.user.min_khz, d.user.max_khz);
            self.set_policy_locked(&policy, &mut d, min, max, chosen_gov, None)
        };
        if let Err(e) = negotiated {
            log::warn!("cpufreq: initial negotiation failed for CPU {}: {}", cpu, e);
            for member in members {
                self.table.remove(member);
                self.router.unmap(member);
            }
            self.exit_domain(&driver, &policy);
            self.phases.set(cpu, CpuPhase::Offline);
            return Err(e);
        }

        for member in members {
            self.phases.set(member, CpuPhase::Linked);
        }
        self.phases.set(cpu, CpuPhase::Owned);
        log::info!(
            "cpufreq: CPU {} online, represents domain {:?}",
            cpu,
            members
        );
        Ok(OnlineStatus::Managed)
    }

    /// Merge an onlining CPU into the live policy of a clock sibling.
    ///
    /// The group lock is held across the whole splice so the governor
    /// never observes a half-updated member set. `discarded` is the
    /// probe state built for the CPU before the sibling was found; its
    /// driver-side footprint still has to be released.
    fn link_into(
        &self,
        cpu: u32,
        sib: &Arc<Policy>,
        driver: &ActiveDriver,
        discarded: PolicyData,
    ) -> Result<OnlineStatus> {
        let rep = sib.representative();
        let new_related = discarded.related;

        let mut d = sib.data.write();
        let was_running =
            d.mode == ScalingMode::Governed && d.gov_state == GovernorState::Running;

        let spliced = (|| -> Result<()> {
            if was_running {
                self.run_governor(sib, &mut d, GovernorEvent::Stop)?;
            }
            d.cpus.set(cpu);
            d.related = d.related.or(new_related);
            self.table.insert(cpu, sib.clone());
            self.router.map(cpu, rep);
            if was_running {
                self.run_governor(sib, &mut d, GovernorEvent::Start)?;
                self.run_governor(sib, &mut d, GovernorEvent::Limits)?;
            }
            Ok(())
        })();

        if let Err(e) = spliced {
            log::warn!("cpufreq: linking CPU {} into CPU {}'s domain failed: {}", cpu, rep, e);
            d.cpus.clear(cpu);
            self.table.remove(cpu);
            drop(d);
            self.router.unmap(cpu);
            self.discard_domain(driver, cpu, discarded);
            self.phases.set(cpu, CpuPhase::Offline);
            return Err(e);
        }
        drop(d);

        self.discard_domain(driver, cpu, discarded);
        self.phases.set(cpu, CpuPhase::Linked);
        log::info!("cpufreq: CPU {} online, linked into CPU {}'s domain", cpu, rep);
        Ok(OnlineStatus::Linked)
    }

    /// Remove `cpu` from frequency management.
    pub fn on_cpu_offline(&self, cpu: u32) -> Result<()> {
        if cpu as usize >= MAX_CPUS {
            return Err(Error::InvalidCpu);
        }
        // Stale the CPU first: from here on, resolutions through the
        // router fail their online re-check.
        self.online.clear(cpu);
        let driver = match self.driver.active() {
            Some(driver) => driver,
            None => {
                self.phases.set(cpu, CpuPhase::Offline);
                return Ok(());
            }
        };
        if self.table.get(cpu).is_none() {
            self.phases.set(cpu, CpuPhase::Offline);
            return Err(Error::NotManaged);
        }
        self.phases.set(cpu, CpuPhase::Offlining);
        let result = self.retire_cpu(cpu, &driver);
        self.phases.set(cpu, CpuPhase::Offline);
        result
    }

    /// Detach `cpu` from its policy, migrating or tearing down as
    /// needed. Shared by offline handling and driver unregistration.
    pub(crate) fn retire_cpu(&self, cpu: u32, driver: &ActiveDriver) -> Result<()> {
        let policy = self.table.get(cpu).ok_or(Error::NotManaged)?;

        if policy.representative() != cpu {
            return self.unlink_member(cpu, &policy);
        }

        let mut d = policy.data.write();
        let survivors = d.cpus.without(CpuMask::single(cpu));
        if let Some(new_rep) = survivors.first() {
            log::debug!(
                "cpufreq: representative migrates {} -> {} in domain {:?}",
                cpu,
                new_rep,
                d.related
            );
            policy.set_representative(new_rep);
            for member in survivors {
                self.router.map(member, new_rep);
            }
            self.phases.set(new_rep, CpuPhase::Owned);
            drop(d);
            return self.unlink_member(cpu, &policy);
        }

        // Last member: preserve user-visible state, then tear down.
        let snapshot = SavedPolicy {
            governor: match d.mode {
                ScalingMode::Governed => {
                    d.governor.as_ref().map(|gov| String::from(gov.name()))
                }
                ScalingMode::HwPolicy(kind) => Some(String::from(kind.name())),
            },
            user: d.user,
        };
        self.saved.lock().insert(cpu, snapshot);

        if d.mode == ScalingMode::Governed && d.gov_state == GovernorState::Running {
            if let Err(e) = self.run_governor(&policy, &mut d, GovernorEvent::Stop) {
                log::warn!(
                    "cpufreq: governor stop failed while tearing down CPU {}: {}",
                    cpu,
                    e
                );
            }
        }
        d.governor = None;
        d.gov_state = GovernorState::Unattached;
        d.cpus.clear(cpu);
        drop(d);

        self.table.remove(cpu);
        policy.begin_retire();
        policy.wait_drained();
        self.exit_domain(driver, &policy);
        // The mapping goes away last; until now, resolutions found a
        // live object and failed the online re-check.
        self.router.unmap(cpu);
        log::info!("cpufreq: CPU {} offline, policy destroyed", cpu);
        Ok(())
    }

    /// Unlink a non-representative member from a surviving policy:
    /// stop the governor, shrink the member set, restart, re-evaluate.
    fn unlink_member(&self, cpu: u32, policy: &Arc<Policy>) -> Result<()> {
        let mut d = policy.data.write();
        let was_running =
            d.mode == ScalingMode::Governed && d.gov_state == GovernorState::Running;
        if was_running {
            if let Err(e) = self.run_governor(policy, &mut d, GovernorEvent::Stop) {
                log::warn!("cpufreq: governor stop failed unlinking CPU {}: {}", cpu, e);
            }
        }
        d.cpus.clear(cpu);
        self.table.remove(cpu);
        if was_running {
            match self.run_governor(policy, &mut d, GovernorEvent::Start) {
                Ok(()) => {
                    if let Err(e) = self.run_governor(policy, &mut d, GovernorEvent::Limits) {
                        log::warn!(
                            "cpufreq: limits re-evaluation failed after unlinking CPU {}: {}",
                            cpu,
                            e
                        );
                    }
                }
                Err(e) => log::warn!(
                    "cpufreq: governor restart failed after unlinking CPU {}: {}",
                    cpu,
                    e
                ),
            }
        }
        drop(d);
        self.router.unmap(cpu);
        log::info!("cpufreq: CPU {} offline, unlinked from domain", cpu);
        Ok(())
    }

    /// Release driver-side state of a policy being destroyed.
    fn exit_domain(&self, driver: &ActiveDriver, policy: &Policy) {
        if !driver.ops.contains(DriverOps::EXIT) {
            return;
        }
        let data = policy.data.read();
        let view = DriverView {
            data: &data,
            scope: self.scope_for(policy, &data, driver.const_loops()),
        };
        if let Err(e) = driver.driver.exit(&view) {
            log::warn!(
                "cpufreq: driver exit failed for CPU {}: {}",
                policy.representative(),
                e
            );
        }
    }

    /// Release driver-side state probed for a CPU whose policy was
    /// never published.
    fn discard_domain(&self, driver: &ActiveDriver, cpu: u32, data: PolicyData) {
        let tmp = Policy::new(cpu, data);
        self.exit_domain(driver, &tmp);
    }
}

// =============================================================================
// TESTS
// =============================================================================
