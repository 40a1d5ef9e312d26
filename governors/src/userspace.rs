//! Run each domain at a frequency chosen explicitly from the outside.
//!
//! The chosen setpoint survives renegotiation: when the bounds move,
//! the governor re-targets the stored value clamped into the new range.

use alloc::collections::BTreeMap;

use spin::Mutex;

use helix_cpufreq::{
    CpuFreq, GovernedPolicy, Governor, GovernorEvent, Relation, Result,
};

pub struct Userspace {
    /// Requested speed per domain, keyed by representative CPU.
    setpoints: Mutex<BTreeMap<u32, u32>>,
}

impl Userspace {
    pub fn new() -> Self {
        Self {
            setpoints: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ask the domain of `cpu` to run at `khz`. Only effective while
    /// this governor is attached there.
    pub fn set_speed(&self, core: &CpuFreq, cpu: u32, khz: u32) -> Result<()> {
        let rep = core.get_policy(cpu)?.representative;
        self.setpoints.lock().insert(rep, khz);
        core.target(cpu, khz, Relation::Lowest)
    }

    /// Currently requested speed for `cpu`'s domain, if any.
    pub fn speed(&self, core: &CpuFreq, cpu: u32) -> Result<Option<u32>> {
        let rep = core.get_policy(cpu)?.representative;
        Ok(self.setpoints.lock().get(&rep).copied())
    }
}

impl Default for Userspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Governor for Userspace {
    fn name(&self) -> &'static str {
        "userspace"
    }

    fn govern(&self, policy: &mut GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        match event {
            GovernorEvent::Start => {
                // Hold whatever the domain runs at until told otherwise.
                self.setpoints.lock().insert(policy.cpu(), policy.cur_khz());
                Ok(())
            }
            GovernorEvent::Limits => {
                let stored = self.setpoints.lock().get(&policy.cpu()).copied();
                let khz = match stored {
                    Some(khz) => khz.clamp(policy.min_khz(), policy.max_khz()),
                    None => policy.cur_khz(),
                };
                self.setpoints.lock().insert(policy.cpu(), khz);
                policy.target(khz, Relation::Lowest)
            }
            GovernorEvent::Stop => {
                self.setpoints.lock().remove(&policy.cpu());
                Ok(())
            }
            GovernorEvent::Init => Ok(()),
        }
    }
}
