//! Built-in frequency governors.
//!
//! Three governors ship with the core:
//!
//! - `performance` pins the domain at its negotiated upper bound,
//! - `powersave` pins it at the lower bound,
//! - `userspace` runs at a frequency chosen explicitly per domain.

#![no_std]

extern crate alloc;

pub mod performance;
pub mod powersave;
pub mod userspace;

pub use performance::Performance;
pub use powersave::Powersave;
pub use userspace::Userspace;

use alloc::sync::Arc;

use helix_cpufreq::{CpuFreq, Result};

/// Register the built-in governors with `core` and make `performance`
/// the latency fallback.
pub fn register_builtin_governors(core: &CpuFreq) -> Result<()> {
    core.register_governor(Arc::new(Performance))?;
    core.register_governor(Arc::new(Powersave))?;
    core.register_governor(Arc::new(Userspace::new()))?;
    core.set_fallback_governor("performance")?;
    log::debug!("cpufreq: built-in governors registered");
    Ok(())
}
