//! Run every CPU of the domain at the lowest permitted frequency.

use helix_cpufreq::{GovernedPolicy, Governor, GovernorEvent, Relation, Result};

pub struct Powersave;

impl Governor for Powersave {
    fn name(&self) -> &'static str {
        "powersave"
    }

    fn govern(&self, policy: &mut GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        match event {
            GovernorEvent::Start | GovernorEvent::Limits => {
                log::debug!(
                    "cpufreq: powersave: CPU {} to {} kHz",
                    policy.cpu(),
                    policy.min_khz()
                );
                policy.target(policy.min_khz(), Relation::Lowest)
            }
            GovernorEvent::Init | GovernorEvent::Stop => Ok(()),
        }
    }
}
