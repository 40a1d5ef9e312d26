//! Shared test fixtures: a table-backed hardware driver and a
//! scriptable governor.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::driver::{Driver, DriverFlags, DriverOps, DriverView, Relation};
use crate::error::{Error, Result};
use crate::governor::{GovernedPolicy, Governor, GovernorEvent};
use crate::mask::CpuMask;
use crate::policy::{HardwareLimits, PolicyData, PolicyRequest};

// =============================================================================
// TABLE DRIVER
// =============================================================================

/// Driver over a fixed frequency table, recording everything it is
/// asked to do.
pub(crate) struct TableDriver {
    freqs: Vec<u32>,
    domains: Vec<CpuMask>,
    latency_us: u32,
    ops: DriverOps,
    flags: DriverFlags,
    /// Frequencies actually programmed, as (representative, kHz).
    pub programmed: Mutex<Vec<(u32, u32)>>,
    /// What `get` reports per CPU; tests overwrite this to fake drift.
    pub hw_freq: Mutex<BTreeMap<u32, u32>>,
    /// Representatives whose domain state was released.
    pub exited: Mutex<Vec<u32>>,
    pub fail_init: AtomicBool,
    pub fail_verify: AtomicBool,
    pub fail_target: AtomicBool,
}

impl TableDriver {
    pub fn with_freqs(freqs: Vec<u32>) -> Arc<Self> {
        Self::build(freqs, Vec::new(), 20, DriverFlags::empty())
    }

    pub fn with_domains(freqs: Vec<u32>, domains: Vec<CpuMask>) -> Arc<Self> {
        Self::build(freqs, domains, 20, DriverFlags::empty())
    }

    pub fn with_latency(freqs: Vec<u32>, latency_us: u32) -> Arc<Self> {
        Self::build(freqs, Vec::new(), latency_us, DriverFlags::empty())
    }

    pub fn with_flags(freqs: Vec<u32>, flags: DriverFlags) -> Arc<Self> {
        Self::build(freqs, Vec::new(), 20, flags)
    }

    fn build(
        freqs: Vec<u32>,
        domains: Vec<CpuMask>,
        latency_us: u32,
        flags: DriverFlags,
    ) -> Arc<Self> {
        assert!(!freqs.is_empty());
        Arc::new(Self {
            freqs,
            domains,
            latency_us,
            ops: DriverOps::TARGET | DriverOps::GET | DriverOps::GETAVG | DriverOps::EXIT,
            flags,
            programmed: Mutex::new(Vec::new()),
            hw_freq: Mutex::new(BTreeMap::new()),
            exited: Mutex::new(Vec::new()),
            fail_init: AtomicBool::new(false),
            fail_verify: AtomicBool::new(false),
            fail_target: AtomicBool::new(false),
        })
    }

    fn hw(&self) -> HardwareLimits {
        HardwareLimits {
            min_khz: self.freqs[0],
            max_khz: *self.freqs.last().unwrap(),
            transition_latency_us: self.latency_us,
        }
    }

    fn round(&self, target_khz: u32, relation: Relation) -> u32 {
        match relation {
            Relation::Lowest => self
                .freqs
                .iter()
                .copied()
                .find(|&f| f >= target_khz)
                .unwrap_or(*self.freqs.last().unwrap()),
            Relation::Highest => self
                .freqs
                .iter()
                .rev()
                .copied()
                .find(|&f| f <= target_khz)
                .unwrap_or(self.freqs[0]),
        }
    }

    pub fn last_programmed(&self) -> Option<(u32, u32)> {
        self.programmed.lock().last().copied()
    }

    pub fn fake_hw_freq(&self, cpu: u32, khz: u32) {
        self.hw_freq.lock().insert(cpu, khz);
    }
}

impl Driver for TableDriver {
    fn name(&self) -> &'static str {
        "table-test"
    }

    fn ops(&self) -> DriverOps {
        self.ops
    }

    fn flags(&self) -> DriverFlags {
        self.flags
    }

    fn init(&self, cpu: u32, data: &mut PolicyData) -> Result<u32> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::DriverRejected);
        }
        let domain = self
            .domains
            .iter()
            .copied()
            .find(|d| d.contains(cpu))
            .unwrap_or_else(|| CpuMask::single(cpu));
        data.related = domain;
        data.cpus = domain;
        data.hw = self.hw();
        data.min_khz = data.hw.min_khz;
        data.max_khz = data.hw.max_khz;

        let cur = *self.hw_freq.lock().entry(cpu).or_insert(self.freqs[0]);
        Ok(cur)
    }

    fn verify(&self, req: &mut PolicyRequest) -> Result<()> {
        if self.fail_verify.load(Ordering::SeqCst) {
            return Err(Error::DriverRejected);
        }
        let hw = self.hw();
        req.clamp(hw.min_khz, hw.max_khz);
        Ok(())
    }

    fn target(&self, view: &DriverView<'_>, target_khz: u32, relation: Relation) -> Result<()> {
        let chosen = self.round(target_khz, relation);
        view.transition(view.cur_khz(), chosen, || {
            if self.fail_target.load(Ordering::SeqCst) {
                return Err(Error::DriverRejected);
            }
            self.programmed.lock().push((view.cpu(), chosen));
            let mut hw = self.hw_freq.lock();
            for cpu in view.cpus() {
                hw.insert(cpu, chosen);
            }
            Ok(())
        })
    }

    fn get(&self, cpu: u32) -> Result<u32> {
        Ok(self.hw_freq.lock().get(&cpu).copied().unwrap_or(0))
    }

    fn getavg(&self, view: &DriverView<'_>, _cpu: u32) -> Result<u32> {
        Ok(view.cur_khz())
    }

    fn exit(&self, view: &DriverView<'_>) -> Result<()> {
        self.exited.lock().push(view.cpu());
        Ok(())
    }
}

// =============================================================================
// TEST GOVERNOR
// =============================================================================

/// Governor that chases the policy maximum and records its events.
pub(crate) struct TestGovernor {
    name: &'static str,
    latency_us: u32,
    fail_start: bool,
    pub events: Mutex<Vec<GovernorEvent>>,
}

impl TestGovernor {
    pub fn named(name: &'static str) -> Arc<Self> {
        Self::build(name, 0, false)
    }

    pub fn with_latency(name: &'static str, latency_us: u32) -> Arc<Self> {
        Self::build(name, latency_us, false)
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        Self::build(name, 0, true)
    }

    fn build(name: &'static str, latency_us: u32, fail_start: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            latency_us,
            fail_start,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn event_log(&self) -> Vec<GovernorEvent> {
        self.events.lock().clone()
    }
}

impl Governor for TestGovernor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn max_transition_latency_us(&self) -> u32 {
        self.latency_us
    }

    fn govern(&self, policy: &mut GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        self.events.lock().push(event);
        match event {
            GovernorEvent::Start if self.fail_start => Err(Error::GovernorStartFailed),
            GovernorEvent::Start | GovernorEvent::Limits => {
                match policy.target(policy.max_khz(), Relation::Highest) {
                    Err(Error::NotSupported) => Ok(()),
                    other => other,
                }
            }
            _ => Ok(()),
        }
    }
}
