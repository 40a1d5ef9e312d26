//! Error types for the frequency scaling core.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! are deliberately coarse: callers branch on *what went wrong*
//! (not managed, raced with hotplug, rejected by hardware), never on
//! free-form detail strings.

use core::fmt;

/// Errors surfaced by the frequency scaling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The CPU has no policy (never onlined, or already torn down).
    NotManaged,

    /// The CPU went offline between lookup and lock acquisition.
    StaleCpu,

    /// Requested limits cannot be reconciled with the stored user limits.
    RangeConflict,

    /// The new governor failed to start and rollback recovered the old one.
    GovernorStartFailed,

    /// Governor demands a lower transition latency than the hardware has,
    /// and no fallback governor is registered.
    LatencyIncompatible,

    /// A driver is already registered, or the driver is still pinned.
    DriverBusy,

    /// The driver rejected the request (invalid hook set, failed verify,
    /// or no CPU could be initialized).
    DriverRejected,

    /// No hardware driver is registered.
    NoDriver,

    /// CPU identifier out of range.
    InvalidCpu,

    /// A governor with this name is already registered.
    GovernorExists,

    /// No governor with this name is registered.
    UnknownGovernor,

    /// The governor is still running on at least one policy.
    GovernorInUse,

    /// The driver does not implement this operation.
    NotSupported,

    /// The core has been administratively disabled.
    Disabled,

    /// Governor rollback failed; the policy is left without a running
    /// governor. Fatal from the core's point of view.
    Ungoverned,
}

impl Error {
    /// Errors after which the affected policy is in a degraded state.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Error::Ungoverned)
    }

    /// Errors caused by racing with CPU hotplug; the operation may be
    /// retried once the topology settles.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Error::StaleCpu)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotManaged => "CPU is not managed by any policy",
            Error::StaleCpu => "CPU went offline during the operation",
            Error::RangeConflict => "requested limits conflict with user limits",
            Error::GovernorStartFailed => "new governor failed to start",
            Error::LatencyIncompatible => "governor latency requirement not met",
            Error::DriverBusy => "driver already registered or still in use",
            Error::DriverRejected => "driver rejected the request",
            Error::NoDriver => "no frequency driver registered",
            Error::InvalidCpu => "CPU identifier out of range",
            Error::GovernorExists => "governor name already registered",
            Error::UnknownGovernor => "no such governor",
            Error::GovernorInUse => "governor is running on a policy",
            Error::NotSupported => "operation not supported by the driver",
            Error::Disabled => "frequency scaling is disabled",
            Error::Ungoverned => "policy left without a running governor",
        };
        f.write_str(msg)
    }
}

/// Result type for frequency scaling operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// TESTS
// =============================================================================
