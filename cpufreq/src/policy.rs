//! # Policy Object
//!
//! A [`Policy`] describes one CPU clock domain: the CPUs sharing the
//! clock, the negotiated frequency bounds, the stored user limits, and
//! the governor currently attached. One policy may cover several CPUs;
//! exactly one of them is the *representative* whose identifier names
//! the domain.
//!
//! ## Locking
//!
//! All negotiated state lives in [`PolicyData`] behind the policy's
//! group `RwLock`. Three values deliberately sit *outside* that lock in
//! atomics:
//!
//! - `cur_khz`: committed by the post-transition notifier, which may run
//!   while a writer holds the group lock;
//! - `util`: published by schedulers on a hot path;
//! - `representative`: re-pointed during representative migration while
//!   the group lock is held, but read lock-free by the router.
//!
//! Destruction is gated on a borrow count: every outstanding
//! [`PolicyRef`](crate::registry::PolicyRef) holds the object alive, and
//! teardown waits on a one-shot [`Completion`] signalled when the last
//! borrower leaves.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use alloc::string::String;
use alloc::sync::Arc;

use spin::RwLock;
use static_assertions::assert_impl_all;

use crate::governor::{Governor, GovernorState};
use crate::mask::CpuMask;

// =============================================================================
// LIMIT TYPES
// =============================================================================

/// Frequency limits requested by the user, in kHz.
///
/// These survive negotiation unchanged: external constraints narrow the
/// *effective* bounds but never rewrite what the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLimits {
    pub min_khz: u32,
    pub max_khz: u32,
}

/// Immutable hardware capabilities reported by the driver at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareLimits {
    pub min_khz: u32,
    pub max_khz: u32,
    /// Worst-case frequency switch latency.
    pub transition_latency_us: u32,
}

/// Fixed operating point selected when the hardware scales on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwPolicyKind {
    Performance,
    Powersave,
}

impl HwPolicyKind {
    /// On autonomous hardware the governor namespace collapses to the
    /// two fixed operating points.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "performance" => Some(Self::Performance),
            "powersave" => Some(Self::Powersave),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Powersave => "powersave",
        }
    }
}

/// How frequency decisions are made for this domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// A governor picks target frequencies within the bounds.
    Governed,
    /// The hardware scales autonomously; the core only conveys bounds.
    HwPolicy(HwPolicyKind),
}

// =============================================================================
// POLICY REQUEST
// =============================================================================

/// Candidate bounds flowing through negotiation.
///
/// Handed mutably to the driver's `verify` hook and to policy-chain
/// observers, which may narrow (never widen) the range.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest {
    /// Representative CPU of the domain under negotiation.
    pub cpu: u32,
    pub min_khz: u32,
    pub max_khz: u32,
    pub hw: HardwareLimits,
}

impl PolicyRequest {
    /// Clamp the candidate range into `[lo, hi]`.
    ///
    /// The standard building block for `verify` implementations: clamp
    /// into the hardware limits, then reconcile an inverted range.
    pub fn clamp(&mut self, lo_khz: u32, hi_khz: u32) {
        self.min_khz = self.min_khz.clamp(lo_khz, hi_khz);
        self.max_khz = self.max_khz.clamp(lo_khz, hi_khz);
        if self.min_khz > self.max_khz {
            self.min_khz = self.max_khz;
        }
    }
}

// =============================================================================
// POLICY DATA (under the group lock)
// =============================================================================

/// Mutable per-domain state, guarded by the policy's group lock.
pub struct PolicyData {
    /// Effective lower bound after negotiation, kHz.
    pub min_khz: u32,
    /// Effective upper bound after negotiation, kHz.
    pub max_khz: u32,
    /// What the user asked for.
    pub user: UserLimits,
    /// Online CPUs in this domain.
    pub cpus: CpuMask,
    /// All CPUs sharing the clock, online or not.
    pub related: CpuMask,
    /// Hardware capabilities.
    pub hw: HardwareLimits,
    pub mode: ScalingMode,
    /// Attached governor, when `mode` is `Governed`.
    pub governor: Option<Arc<dyn Governor>>,
    pub gov_state: GovernorState,
}

impl PolicyData {
    /// Fresh single-CPU domain, to be filled in by the driver's init.
    pub fn new(cpu: u32) -> Self {
        Self {
            min_khz: 0,
            max_khz: 0,
            user: UserLimits {
                min_khz: 0,
                max_khz: 0,
            },
            cpus: CpuMask::single(cpu),
            related: CpuMask::single(cpu),
            hw: HardwareLimits::default(),
            mode: ScalingMode::Governed,
            governor: None,
            gov_state: GovernorState::Unattached,
        }
    }

    /// Candidate request seeded from the current effective bounds.
    pub fn request(&self, cpu: u32) -> PolicyRequest {
        PolicyRequest {
            cpu,
            min_khz: self.min_khz,
            max_khz: self.max_khz,
            hw: self.hw,
        }
    }
}

// =============================================================================
// COMPLETION
// =============================================================================

/// One-shot completion event.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin until completed.
    pub fn wait(&self) {
        while !self.is_complete() {
            core::hint::spin_loop();
        }
    }
}

// =============================================================================
// POLICY
// =============================================================================

/// Shared frequency policy for one clock domain.
pub struct Policy {
    /// CPU whose identifier names this domain.
    representative: AtomicU32,
    /// Last committed frequency, kHz. Written by the transition
    /// notifier's post phase, read lock-free by `quick_get`.
    cur_khz: AtomicU32,
    /// Utilization hint published by the scheduler, percent.
    util: AtomicU32,
    /// Outstanding borrows.
    borrowers: AtomicUsize,
    /// Set once teardown has started; borrows fail from then on.
    retiring: AtomicBool,
    /// Signalled when the last borrower of a retiring policy leaves.
    drained: Completion,
    /// Negotiated state, under the group lock.
    pub data: RwLock<PolicyData>,
}

assert_impl_all!(Policy: Send, Sync);

impl Policy {
    pub fn new(representative: u32, data: PolicyData) -> Self {
        Self {
            representative: AtomicU32::new(representative),
            cur_khz: AtomicU32::new(0),
            util: AtomicU32::new(0),
            borrowers: AtomicUsize::new(0),
            retiring: AtomicBool::new(false),
            drained: Completion::new(),
            data: RwLock::new(data),
        }
    }

    pub fn representative(&self) -> u32 {
        self.representative.load(Ordering::SeqCst)
    }

    /// Re-point the domain at a new representative. Caller holds the
    /// group write lock.
    pub fn set_representative(&self, cpu: u32) {
        self.representative.store(cpu, Ordering::SeqCst);
    }

    pub fn cur_khz(&self) -> u32 {
        self.cur_khz.load(Ordering::SeqCst)
    }

    pub fn set_cur_khz(&self, khz: u32) {
        self.cur_khz.store(khz, Ordering::SeqCst);
    }

    pub fn util(&self) -> u32 {
        self.util.load(Ordering::SeqCst)
    }

    pub fn set_util(&self, util: u32) {
        self.util.store(util, Ordering::SeqCst);
    }

    /// Take a logical borrow. Fails once teardown has started.
    pub(crate) fn borrow(&self) -> bool {
        self.borrowers.fetch_add(1, Ordering::SeqCst);
        if self.retiring.load(Ordering::SeqCst) {
            self.unborrow();
            return false;
        }
        true
    }

    pub(crate) fn unborrow(&self) {
        let prev = self.borrowers.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.retiring.load(Ordering::SeqCst) {
            self.drained.complete();
        }
    }

    /// Begin teardown: refuse new borrows, arm the drain completion.
    pub(crate) fn begin_retire(&self) {
        self.retiring.store(true, Ordering::SeqCst);
        if self.borrowers.load(Ordering::SeqCst) == 0 {
            self.drained.complete();
        }
    }

    /// Block until all borrows taken before [`begin_retire`] are gone.
    ///
    /// [`begin_retire`]: Policy::begin_retire
    pub(crate) fn wait_drained(&self) {
        self.drained.wait();
    }

    /// Owned copy of the externally visible state.
    pub fn snapshot(&self) -> PolicySnapshot {
        let data = self.data.read();
        PolicySnapshot {
            representative: self.representative(),
            cpus: data.cpus,
            related: data.related,
            min_khz: data.min_khz,
            max_khz: data.max_khz,
            cur_khz: self.cur_khz(),
            util: self.util(),
            user: data.user,
            hw: data.hw,
            mode: data.mode,
            governor: data.governor.as_ref().map(|g| String::from(g.name())),
            gov_state: data.gov_state,
        }
    }
}

impl core::fmt::Debug for Policy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Policy")
            .field("representative", &self.representative())
            .field("cur_khz", &self.cur_khz())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Owned, lock-free copy of a policy's externally visible state.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    pub representative: u32,
    pub cpus: CpuMask,
    pub related: CpuMask,
    pub min_khz: u32,
    pub max_khz: u32,
    pub cur_khz: u32,
    pub util: u32,
    pub user: UserLimits,
    pub hw: HardwareLimits,
    pub mode: ScalingMode,
    /// Name of the attached governor, when governed.
    pub governor: Option<String>,
    pub gov_state: GovernorState,
}

// =============================================================================
// TESTS
// =============================================================================
