//! End-to-end lifecycle tests driving the core through the built-in
//! governors and a table-backed test driver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::vec::Vec;

use spin::Mutex;

use helix_cpufreq::{
    ConstraintProvider, CpuFreq, CpuMask, Driver, DriverFlags, DriverOps, DriverView, Error,
    HardwareLimits, OnlineStatus, PolicyData, PolicyRequest, Relation, Result,
};
use helix_cpufreq_governors::{register_builtin_governors, Userspace};

// =============================================================================
// FIXTURE
// =============================================================================

struct TableDriver {
    freqs: Vec<u32>,
    domains: Vec<CpuMask>,
    programmed: Mutex<Vec<(u32, u32)>>,
    hw_freq: Mutex<BTreeMap<u32, u32>>,
}

impl TableDriver {
    fn new(freqs: Vec<u32>) -> Arc<Self> {
        Self::with_domains(freqs, Vec::new())
    }

    fn with_domains(freqs: Vec<u32>, domains: Vec<CpuMask>) -> Arc<Self> {
        Arc::new(Self {
            freqs,
            domains,
            programmed: Mutex::new(Vec::new()),
            hw_freq: Mutex::new(BTreeMap::new()),
        })
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

    fn last_programmed(&self) -> Option<(u32, u32)> {
        self.programmed.lock().last().copied()
    }
}

impl Driver for TableDriver {
    fn name(&self) -> &'static str {
        "table-test"
    }

    fn ops(&self) -> DriverOps {
        DriverOps::TARGET | DriverOps::GET | DriverOps::EXIT
    }

    fn flags(&self) -> DriverFlags {
        DriverFlags::empty()
    }

    fn init(&self, cpu: u32, data: &mut PolicyData) -> Result<u32> {
        let domain = self
            .domains
            .iter()
            .copied()
            .find(|d| d.contains(cpu))
            .unwrap_or_else(|| CpuMask::single(cpu));
        data.related = domain;
        data.cpus = domain;
        data.hw = HardwareLimits {
            min_khz: self.freqs[0],
            max_khz: *self.freqs.last().unwrap(),
            transition_latency_us: 20,
        };
        data.min_khz = data.hw.min_khz;
        data.max_khz = data.hw.max_khz;
        let cur = *self.hw_freq.lock().entry(cpu).or_insert(self.freqs[0]);
        Ok(cur)
    }

    fn verify(&self, req: &mut PolicyRequest) -> Result<()> {
        req.clamp(self.freqs[0], *self.freqs.last().unwrap());
        Ok(())
    }

    fn target(&self, view: &DriverView<'_>, target_khz: u32, relation: Relation) -> Result<()> {
        let chosen = self.round(target_khz, relation);
        view.transition(view.cur_khz(), chosen, || {
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

    fn exit(&self, _view: &DriverView<'_>) -> Result<()> {
        Ok(())
    }
}

fn fresh_core(default: &str) -> CpuFreq {
    let core = CpuFreq::new();
    register_builtin_governors(&core).unwrap();
    core.set_default_governor(default).unwrap();
    core
}

struct ExternalCap {
    max_khz: u32,
}

impl ConstraintProvider for ExternalCap {
    fn max_khz(&self, _cpu: u32) -> u32 {
        self.max_khz
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[test]
fn performance_chases_the_ceiling() {
    let core = fresh_core("performance");
    let driver = TableDriver::new(vec![200_000, 400_000, 800_000]);
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(driver.clone()).unwrap();

    assert_eq!(core.quick_get(0), Ok(800_000));

    // Narrowing the ceiling drags the frequency down with it.
    core.set_user_limits(0, 200_000, 400_000).unwrap();
    assert_eq!(core.quick_get(0), Ok(400_000));
    assert_eq!(driver.last_programmed(), Some((0, 400_000)));
}

#[test]
fn powersave_sits_on_the_floor() {
    let core = fresh_core("powersave");
    let driver = TableDriver::new(vec![200_000, 400_000, 800_000]);
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(driver).unwrap();

    assert_eq!(core.quick_get(0), Ok(200_000));

    core.set_user_limits(0, 400_000, 800_000).unwrap();
    assert_eq!(core.quick_get(0), Ok(400_000));
}

#[test]
fn userspace_holds_a_chosen_speed() {
    let core = CpuFreq::new();
    let userspace = Arc::new(Userspace::new());
    core.register_governor(userspace.clone()).unwrap();
    core.set_default_governor("userspace").unwrap();
    let driver = TableDriver::new(vec![200_000, 400_000, 600_000, 800_000]);
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(driver).unwrap();

    userspace.set_speed(&core, 0, 600_000).unwrap();
    assert_eq!(core.quick_get(0), Ok(600_000));
    assert_eq!(userspace.speed(&core, 0), Ok(Some(600_000)));

    // The setpoint is clamped when the bounds tighten around it.
    core.set_user_limits(0, 200_000, 400_000).unwrap();
    assert_eq!(core.quick_get(0), Ok(400_000));
    assert_eq!(userspace.speed(&core, 0), Ok(Some(400_000)));
}

#[test]
fn switching_governors_moves_the_frequency() {
    let core = fresh_core("performance");
    let driver = TableDriver::new(vec![200_000, 400_000, 800_000]);
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(driver).unwrap();
    assert_eq!(core.quick_get(0), Ok(800_000));

    core.set_governor(0, "powersave").unwrap();
    assert_eq!(core.quick_get(0), Ok(200_000));
    assert_eq!(
        core.get_policy(0).unwrap().governor.as_deref(),
        Some("powersave")
    );

    core.set_governor(0, "performance").unwrap();
    assert_eq!(core.quick_get(0), Ok(800_000));
}

#[test]
fn external_cap_bounds_a_user_request() {
    let core = fresh_core("performance");
    let driver = TableDriver::new(vec![
        200_000, 400_000, 600_000, 800_000, 900_000, 1_000_000,
    ]);
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(driver).unwrap();

    core.set_user_limits(0, 200_000, 800_000).unwrap();
    core.set_constraint_provider(Arc::new(ExternalCap { max_khz: 900_000 }));

    // A request reaching above the external cap is trimmed to it.
    core.set_user_limits(0, 600_000, 1_000_000).unwrap();
    let snap = core.get_policy(0).unwrap();
    assert_eq!((snap.min_khz, snap.max_khz), (600_000, 900_000));
    assert_eq!(core.quick_get(0), Ok(900_000));
}

#[test]
fn rejected_request_leaves_policy_untouched() {
    let core = fresh_core("performance");
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(TableDriver::new(vec![200_000, 400_000, 800_000]))
        .unwrap();
    core.set_user_limits(0, 200_000, 800_000).unwrap();

    assert_eq!(
        core.set_user_limits(0, 900_000, 1_000_000),
        Err(Error::RangeConflict)
    );
    let snap = core.get_policy(0).unwrap();
    assert_eq!((snap.min_khz, snap.max_khz), (200_000, 800_000));
    assert_eq!(core.quick_get(0), Ok(800_000));
}

#[test]
fn shared_domain_follows_one_policy() {
    let core = fresh_core("performance");
    let domain = CpuMask::single(0).or(CpuMask::single(1));
    let driver = TableDriver::with_domains(vec![200_000, 800_000], vec![domain]);
    assert_eq!(core.on_cpu_online(0), Ok(OnlineStatus::Unmanaged));
    core.register_driver(driver).unwrap();
    assert_eq!(core.on_cpu_online(1), Ok(OnlineStatus::Linked));

    // One negotiation moves both CPUs.
    core.set_user_limits(1, 200_000, 200_000).unwrap();
    assert_eq!(core.quick_get(0), Ok(200_000));
    assert_eq!(core.quick_get(1), Ok(200_000));

    // The representative going away hands the domain to the survivor.
    core.on_cpu_offline(0).unwrap();
    let snap = core.get_policy(1).unwrap();
    assert_eq!(snap.representative, 1);
    assert_eq!(core.quick_get(1), Ok(200_000));
}
