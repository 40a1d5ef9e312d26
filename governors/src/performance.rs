//! Run every CPU of the domain at the highest permitted frequency.

use helix_cpufreq::{GovernedPolicy, Governor, GovernorEvent, Relation, Result};

pub struct Performance;

impl Governor for Performance {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn govern(&self, policy: &mut GovernedPolicy<'_>, event: GovernorEvent) -> Result<()> {
        match event {
            GovernorEvent::Start | GovernorEvent::Limits => {
                log::debug!(
                    "cpufreq: performance: CPU {} to {} kHz",
                    policy.cpu(),
                    policy.max_khz()
                );
                policy.target(policy.max_khz(), Relation::Highest)
            }
            GovernorEvent::Init | GovernorEvent::Stop => Ok(()),
        }
    }
}
