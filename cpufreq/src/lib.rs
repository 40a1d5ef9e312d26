//! # Helix CPU Frequency Scaling Core
//!
//! Policy lifecycle and concurrency core for CPU frequency scaling.
//!
//! Every CPU clock domain is represented by a shared [`Policy`] object
//! covering one or more CPUs. A pluggable hardware [`Driver`] enumerates
//! domains and programs frequencies; pluggable [`Governor`]s decide which
//! frequency to request within the policy bounds.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CPUFREQ CORE                             │
//! │                                                                 │
//! │   on_cpu_online/offline      set_user_limits / set_governor     │
//! │            │                             │                      │
//! │            ▼                             ▼                      │
//! │   ┌─────────────────┐         ┌──────────────────┐              │
//! │   │    Hotplug      │         │   Negotiation    │              │
//! │   │   Lifecycle     │         │  (clamp/verify)  │              │
//! │   └────────┬────────┘         └────────┬─────────┘              │
//! │            │                           │                        │
//! │            ▼                           ▼                        │
//! │   ┌────────────────────────────────────────────┐                │
//! │   │      Lock Router + Policy Registry         │                │
//! │   │   (per-CPU → representative indirection)   │                │
//! │   └────────┬──────────────────────┬────────────┘                │
//! │            │                      │                             │
//! │            ▼                      ▼                             │
//! │   ┌─────────────────┐    ┌─────────────────┐                    │
//! │   │  Policy Object  │    │ Notifier Chains │                    │
//! │   │  (per domain)   │    │  (pre/post +    │                    │
//! │   │                 │    │   policy events)│                    │
//! │   └────────┬────────┘    └─────────────────┘                    │
//! │            │                                                    │
//! │            ▼                                                    │
//! │   ┌─────────────────┐    ┌─────────────────┐                    │
//! │   │    Governor     │───▶│  Driver (HW)    │                    │
//! │   └─────────────────┘    └─────────────────┘                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Mutation of a policy always goes through the lock router: callers name
//! a CPU, the router resolves the owning representative and takes that
//! policy's group lock, then re-checks that the CPU is still online.
//! Offlining marks the CPU stale *before* tearing anything down, so
//! concurrent entry points fail with [`Error::StaleCpu`] instead of
//! touching a dying policy. Destruction waits for all outstanding policy
//! borrows to drain, and the router mapping is cleared last.

#![no_std]

extern crate alloc;

// =============================================================================
// MODULES
// =============================================================================

pub mod core;
pub mod driver;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod governor;
pub mod hotplug;
pub mod mask;
pub mod negotiate;
pub mod notify;
pub mod policy;
pub mod registry;
pub mod router;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use crate::core::{global, CpuFreq};
pub use driver::{Driver, DriverFlags, DriverOps, DriverView, Relation};
pub use error::{Error, Result};
pub use governor::{GovernedPolicy, Governor, GovernorEvent, GovernorState};
pub use hotplug::{CpuPhase, OnlineStatus};
pub use mask::{CpuMask, MAX_CPUS};
pub use negotiate::ConstraintProvider;
pub use notify::{FreqChange, PolicyEvent, SubscriptionId, TransitionPhase};
pub use policy::{
    HardwareLimits, HwPolicyKind, Policy, PolicyData, PolicyRequest, PolicySnapshot, ScalingMode,
    UserLimits,
};
