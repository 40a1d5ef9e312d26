//! # Governors
//!
//! A governor decides which frequency a governed domain runs at, within
//! the negotiated bounds. The core drives it through a small event
//! protocol:
//!
//! ```text
//!  Unattached ──Init──▶ Initialized ──Start──▶ Running ──Stop──▶ Stopped
//!                                                 │  ▲
//!                                          Limits │  │ Start
//!                                                 ▼  │
//!                                               Running
//! ```
//!
//! `Limits` is re-sent whenever the bounds change and is repeatable.
//! A governor that declares a maximum transition latency is never
//! started on hardware slower than that; the core substitutes the
//! registered fallback governor instead.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::driver::{ActiveDriver, DriverOps, DriverView, Relation};
use crate::error::{Error, Result};
use crate::mask::CpuMask;
use crate::notify::{TimingRef, TransitionChain, TransitionScope};
use crate::policy::{Policy, PolicyData};

// =============================================================================
// EVENTS AND STATE
// =============================================================================

/// Events delivered to a governor for one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorEvent {
    /// The governor has been attached to the policy.
    Init,
    /// Begin making frequency decisions.
    Start,
    /// The bounds changed; re-evaluate.
    Limits,
    /// Stop making frequency decisions.
    Stop,
}

/// Activation state of the governor attached to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Unattached,
    Initialized,
    Running,
    Stopped,
}

// =============================================================================
// GOVERNOR TRAIT
// =============================================================================

/// A frequency selection algorithm.
pub trait Governor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Worst transition latency this governor tolerates, in µs.
    /// Zero means unconstrained.
    fn max_transition_latency_us(&self) -> u32 {
        0
    }

    /// Handle one lifecycle event for `policy`.
    fn govern(&self, policy: &mut GovernedPolicy<'_>, event: GovernorEvent) -> Result<()>;
}

// =============================================================================
// GOVERNED POLICY VIEW
// =============================================================================

/// The view a governor operates on while the core holds the group
/// write lock. Frequency requests go straight to the driver; the
/// governor never re-enters the core's locks.
pub struct GovernedPolicy<'a> {
    pub(crate) policy: &'a Policy,
    pub(crate) data: &'a mut PolicyData,
    pub(crate) driver: &'a ActiveDriver,
    pub(crate) chain: &'a TransitionChain,
    pub(crate) timing: &'a TimingRef,
    pub(crate) online_cpus: u32,
}

impl GovernedPolicy<'_> {
    /// Representative CPU of the domain.
    pub fn cpu(&self) -> u32 {
        self.policy.representative()
    }

    pub fn min_khz(&self) -> u32 {
        self.data.min_khz
    }

    pub fn max_khz(&self) -> u32 {
        self.data.max_khz
    }

    pub fn cur_khz(&self) -> u32 {
        self.policy.cur_khz()
    }

    pub fn cpus(&self) -> CpuMask {
        self.data.cpus
    }

    fn view(&self) -> DriverView<'_> {
        DriverView {
            data: self.data,
            scope: TransitionScope {
                chain: self.chain,
                timing: self.timing,
                online_cpus: self.online_cpus,
                const_loops: self.driver.const_loops(),
                policy: self.policy,
                cpus: self.data.cpus,
            },
        }
    }

    /// Ask the driver to switch the domain to `target_khz`.
    ///
    /// The target is clamped into the policy bounds first; a request
    /// for the frequency already running is a no-op.
    pub fn target(&mut self, target_khz: u32, relation: Relation) -> Result<()> {
        let target = target_khz.clamp(self.data.min_khz, self.data.max_khz);
        if target == self.policy.cur_khz() {
            return Ok(());
        }
        if !self.driver.ops.contains(DriverOps::TARGET) {
            return Err(Error::NotSupported);
        }
        log::debug!(
            "cpufreq: governor targeting {} kHz on CPU {}",
            target,
            self.cpu()
        );
        self.driver.driver.target(&self.view(), target, relation)
    }

    /// Recent average frequency, if the hardware tracks it.
    pub fn getavg(&self) -> Result<u32> {
        if !self.driver.ops.contains(DriverOps::GETAVG) {
            return Err(Error::NotSupported);
        }
        self.driver.driver.getavg(&self.view(), self.cpu())
    }
}

impl core::fmt::Debug for GovernedPolicy<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GovernedPolicy")
            .field("cpu", &self.cpu())
            .field("min_khz", &self.min_khz())
            .field("max_khz", &self.max_khz())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// GOVERNOR REGISTRY
// =============================================================================

struct GovernorEntry {
    gov: Arc<dyn Governor>,
    /// Number of policies this governor is currently started on.
    active: usize,
}

/// Name-keyed registry of available governors.
pub struct GovernorRegistry {
    entries: Mutex<Vec<GovernorEntry>>,
    fallback: Mutex<Option<Arc<dyn Governor>>>,
}

impl GovernorRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fallback: Mutex::new(None),
        }
    }

    pub fn register(&self, gov: Arc<dyn Governor>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.gov.name() == gov.name()) {
            return Err(Error::GovernorExists);
        }
        log::debug!("cpufreq: registered governor {}", gov.name());
        entries.push(GovernorEntry { gov, active: 0 });
        Ok(())
    }

    /// Remove a governor. Fails while it is running on any policy.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let idx = entries
            .iter()
            .position(|e| e.gov.name() == name)
            .ok_or(Error::UnknownGovernor)?;
        if entries[idx].active != 0 {
            return Err(Error::GovernorInUse);
        }
        entries.remove(idx);
        drop(entries);

        let mut fallback = self.fallback.lock();
        if fallback.as_ref().is_some_and(|f| f.name() == name) {
            *fallback = None;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Governor>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.gov.name() == name)
            .map(|e| e.gov.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| String::from(e.gov.name()))
            .collect()
    }

    /// Governor substituted when a latency constraint cannot be met.
    pub fn set_fallback(&self, name: &str) -> Result<()> {
        let gov = self.get(name).ok_or(Error::UnknownGovernor)?;
        *self.fallback.lock() = Some(gov);
        Ok(())
    }

    pub fn fallback(&self) -> Option<Arc<dyn Governor>> {
        self.fallback.lock().clone()
    }

    /// Resolve the governor to actually start for a policy whose
    /// hardware switches in `hw_latency_us`.
    pub fn latency_gate(
        &self,
        gov: Arc<dyn Governor>,
        hw_latency_us: u32,
    ) -> Result<Arc<dyn Governor>> {
        let constraint = gov.max_transition_latency_us();
        if constraint == 0 || hw_latency_us <= constraint {
            return Ok(gov);
        }
        match self.fallback() {
            Some(fb) => {
                log::warn!(
                    "cpufreq: governor {} needs {} us but hardware takes {} us, falling back to {}",
                    gov.name(),
                    constraint,
                    hw_latency_us,
                    fb.name()
                );
                Ok(fb)
            }
            None => Err(Error::LatencyIncompatible),
        }
    }

    /// Account one started policy. Keeps the governor unregisterable.
    pub(crate) fn pin(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.gov.name() == name)
            .ok_or(Error::UnknownGovernor)?;
        entry.active += 1;
        Ok(())
    }

    pub(crate) fn unpin(&self, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.gov.name() == name) {
            entry.active = entry.active.saturating_sub(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self, name: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .find(|e| e.gov.name() == name)
            .map_or(0, |e| e.active)
    }
}

impl Default for GovernorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for GovernorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GovernorRegistry")
            .field("governors", &self.names())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        name: &'static str,
        latency_us: u32,
    }

    impl Governor for Dummy {
        fn name(&self) -> &'static str {
            self.name
        }
        fn max_transition_latency_us(&self) -> u32 {
            self.latency_us
        }
        fn govern(&self, _policy: &mut GovernedPolicy<'_>, _event: GovernorEvent) -> Result<()> {
            Ok(())
        }
    }

    fn dummy(name: &'static str, latency_us: u32) -> Arc<dyn Governor> {
        Arc::new(Dummy { name, latency_us })
    }

    #[test]
    fn test_register_duplicate_name_rejected() {
        let reg = GovernorRegistry::new();
        reg.register(dummy("ondemand", 0)).unwrap();
        assert_eq!(
            reg.register(dummy("ondemand", 0)),
            Err(Error::GovernorExists)
        );
    }

    #[test]
    fn test_unregister_while_active_rejected() {
        let reg = GovernorRegistry::new();
        reg.register(dummy("ondemand", 0)).unwrap();

        reg.pin("ondemand").unwrap();
        assert_eq!(reg.unregister("ondemand"), Err(Error::GovernorInUse));

        reg.unpin("ondemand");
        assert!(reg.unregister("ondemand").is_ok());
        assert_eq!(reg.unregister("ondemand"), Err(Error::UnknownGovernor));
    }

    #[test]
    fn test_latency_gate_passthrough() {
        let reg = GovernorRegistry::new();
        let gov = dummy("fast", 50);
        let resolved = reg.latency_gate(gov, 10).unwrap();
        assert_eq!(resolved.name(), "fast");
    }

    #[test]
    fn test_latency_gate_falls_back() {
        let reg = GovernorRegistry::new();
        reg.register(dummy("performance", 0)).unwrap();
        reg.set_fallback("performance").unwrap();

        // Governor tolerates 10 us, hardware takes 50 us.
        let resolved = reg.latency_gate(dummy("picky", 10), 50).unwrap();
        assert_eq!(resolved.name(), "performance");
    }

    #[test]
    fn test_latency_gate_without_fallback_fails() {
        let reg = GovernorRegistry::new();
        assert_eq!(
            reg.latency_gate(dummy("picky", 10), 50).map(|g| g.name()),
            Err(Error::LatencyIncompatible)
        );
    }

    #[test]
    fn test_unregister_clears_fallback() {
        let reg = GovernorRegistry::new();
        reg.register(dummy("performance", 0)).unwrap();
        reg.set_fallback("performance").unwrap();
        reg.unregister("performance").unwrap();
        assert!(reg.fallback().is_none());
    }
}
