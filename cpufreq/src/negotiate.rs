//! # Policy Negotiation
//!
//! Turning a requested frequency range into an applied one is a
//! pipeline with a fixed order:
//!
//! ```text
//! request ──▶ external clamp ──▶ user-limit check ──▶ driver verify
//!         ──▶ Adjust ──▶ Incompatible ──▶ driver verify ──▶ Notify
//!         ──▶ commit bounds ──▶ governor switch / setpolicy ──▶ Limits
//! ```
//!
//! The second `verify` exists because observers may have narrowed the
//! range to something the hardware cannot express exactly. A failing
//! pipeline leaves the previously negotiated bounds in force.
//!
//! The governor switch sequence is stop-old, reassign, start-new; if
//! the new governor refuses to start, the old one is restarted. Only
//! when that rollback also fails is the policy left ungoverned, which
//! the core reports as the fatal [`Error::Ungoverned`].

use alloc::sync::Arc;

use crate::core::CpuFreq;
use crate::driver::{DriverOps, DriverView};
use crate::error::{Error, Result};
use crate::governor::{Governor, GovernorEvent, GovernorState};
use crate::notify::PolicyEvent;
use crate::policy::{Policy, PolicyData, PolicyRequest, ScalingMode};

// =============================================================================
// EXTERNAL CONSTRAINTS
// =============================================================================

/// Source of externally imposed frequency floors and ceilings
/// (thermal management, battery throttling, platform firmware).
///
/// Aggregation of multiple requesters is the provider's business; the
/// core only consumes the net result per CPU.
pub trait ConstraintProvider: Send + Sync {
    /// External floor for `cpu`, kHz. Zero means unconstrained.
    fn min_khz(&self, _cpu: u32) -> u32 {
        0
    }

    /// External ceiling for `cpu`, kHz.
    fn max_khz(&self, _cpu: u32) -> u32 {
        u32::MAX
    }
}

// =============================================================================
// NEGOTIATION
// =============================================================================

impl CpuFreq {
    /// Negotiate and apply new bounds for a policy whose group write
    /// lock the caller holds.
    ///
    /// `new_governor` switches the attached governor as part of the
    /// same negotiation; `new_mode` switches between governed and
    /// autonomous operation. The stored user limits are read, never
    /// written: callers that represent the user update them on success.
    pub(crate) fn set_policy_locked(
        &self,
        policy: &Policy,
        data: &mut PolicyData,
        req_min_khz: u32,
        req_max_khz: u32,
        new_governor: Option<Arc<dyn Governor>>,
        new_mode: Option<ScalingMode>,
    ) -> Result<()> {
        let driver = self.driver.active().ok_or(Error::NoDriver)?;
        let cpu = policy.representative();

        // External constraints are themselves bounded by what the user
        // asked for: a thermal floor may not push above the user
        // ceiling, nor a cap below the user floor.
        let (ext_min, ext_max) = {
            let constraints = self.constraints.read();
            match constraints.as_ref() {
                Some(p) => (p.min_khz(cpu), p.max_khz(cpu)),
                None => (0, u32::MAX),
            }
        };
        let floor = ext_min.min(data.user.max_khz);
        let ceiling = ext_max.max(data.user.min_khz);

        let mut req = PolicyRequest {
            cpu,
            min_khz: req_min_khz.max(floor),
            max_khz: req_max_khz.min(ceiling),
            hw: data.hw,
        };

        if req.min_khz > data.user.max_khz || req.max_khz < data.user.min_khz {
            return Err(Error::RangeConflict);
        }

        // Observers may narrow the range between the two verifications,
        // so the driver gets a second chance to object.
        driver
            .driver
            .verify(&mut req)
            .map_err(|_| Error::RangeConflict)?;
        self.policy_events.broadcast(PolicyEvent::Adjust, &mut req);
        self.policy_events
            .broadcast(PolicyEvent::Incompatible, &mut req);
        driver
            .driver
            .verify(&mut req)
            .map_err(|_| Error::RangeConflict)?;
        self.policy_events.broadcast(PolicyEvent::Notify, &mut req);

        data.min_khz = req.min_khz;
        data.max_khz = req.max_khz;
        log::debug!(
            "cpufreq: CPU {} bounds negotiated to {} - {} kHz",
            cpu,
            data.min_khz,
            data.max_khz
        );

        match new_mode.unwrap_or(data.mode) {
            ScalingMode::HwPolicy(kind) => {
                if !driver.ops.contains(DriverOps::SETPOLICY) {
                    return Err(Error::NotSupported);
                }
                data.mode = ScalingMode::HwPolicy(kind);
                let shared = &*data;
                let view = DriverView {
                    data: shared,
                    scope: self.scope_for(policy, shared, driver.const_loops()),
                };
                driver.driver.setpolicy(&view, kind)?;
            }
            ScalingMode::Governed => {
                data.mode = ScalingMode::Governed;
                let switching = match (&data.governor, &new_governor) {
                    (Some(old), Some(new)) => old.name() != new.name(),
                    (None, Some(_)) => true,
                    _ => false,
                };
                if switching {
                    self.switch_governor(policy, data, new_governor)?;
                }
                if data.gov_state == GovernorState::Running {
                    self.run_governor(policy, data, GovernorEvent::Limits)?;
                }
            }
        }
        Ok(())
    }

    /// Stop the old governor, attach and start the new one, rolling
    /// back to the old governor if the new one refuses.
    fn switch_governor(
        &self,
        policy: &Policy,
        data: &mut PolicyData,
        new_governor: Option<Arc<dyn Governor>>,
    ) -> Result<()> {
        let old = data.governor.clone();
        let old_state = data.gov_state;

        if old_state == GovernorState::Running {
            self.run_governor(policy, data, GovernorEvent::Stop)?;
        }

        data.governor = new_governor;
        data.gov_state = GovernorState::Unattached;

        let failure = match self
            .run_governor(policy, data, GovernorEvent::Init)
            .and_then(|()| self.run_governor(policy, data, GovernorEvent::Start))
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        log::warn!(
            "cpufreq: new governor failed to start on CPU {}, restoring previous one",
            policy.representative()
        );
        data.governor = old;
        data.gov_state = GovernorState::Stopped;
        if data.governor.is_none() {
            data.gov_state = GovernorState::Unattached;
            return Err(failure);
        }
        if old_state == GovernorState::Running
            && self
                .run_governor(policy, data, GovernorEvent::Start)
                .is_err()
        {
            log::error!(
                "cpufreq: rollback governor also failed, CPU {} left ungoverned",
                policy.representative()
            );
            data.governor = None;
            data.gov_state = GovernorState::Unattached;
            return Err(Error::Ungoverned);
        }
        Err(Error::GovernorStartFailed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
