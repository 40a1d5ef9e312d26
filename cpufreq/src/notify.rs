//! # Notifier Chains and the Transition Protocol
//!
//! Two observer chains exist:
//!
//! - the **transition chain** sees every frequency change twice, once
//!   before the hardware is reprogrammed ([`TransitionPhase::Pre`]) and
//!   once after ([`TransitionPhase::Post`]);
//! - the **policy chain** participates in bound negotiation and policy
//!   lifecycle ([`PolicyEvent`]).
//!
//! The pre/post protocol has a fixed internal ordering that observers
//! rely on:
//!
//! ```text
//! Pre:   drift-correct old ──▶ broadcast Pre  ──▶ timing adjust
//! Post:  timing adjust     ──▶ broadcast Post ──▶ commit cur_khz
//! ```
//!
//! If the observed hardware frequency disagrees with the recorded one
//! (firmware throttling, thermal capping), [`out_of_sync`] is never an
//! error: it emits a synthetic pre/post pair so observers converge on
//! reality, and queues the CPU for deferred re-evaluation.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::mask::CpuMask;
use crate::policy::{Policy, PolicyRequest};

/// Handle returned by chain registration, used to unregister.
pub type SubscriptionId = u64;

// =============================================================================
// TRANSITION CHAIN
// =============================================================================

/// Which side of the hardware reprogramming a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    /// The change is about to happen.
    Pre,
    /// The change has happened (or been rolled back to `old_khz`).
    Post,
}

/// One CPU's frequency change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqChange {
    pub cpu: u32,
    pub old_khz: u32,
    pub new_khz: u32,
}

type TransitionHandler = Box<dyn Fn(TransitionPhase, &FreqChange) + Send + Sync>;

struct TransitionSub {
    id: SubscriptionId,
    handler: TransitionHandler,
}

/// Ordered list of transition observers.
pub struct TransitionChain {
    subs: RwLock<Vec<TransitionSub>>,
    next_id: AtomicU64,
}

impl TransitionChain {
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(TransitionPhase, &FreqChange) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.write().push(TransitionSub {
            id,
            handler: Box::new(handler),
        });
        id
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn broadcast(&self, phase: TransitionPhase, change: &FreqChange) {
        for sub in self.subs.read().iter() {
            (sub.handler)(phase, change);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subs.read().len()
    }
}

impl Default for TransitionChain {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// POLICY CHAIN
// =============================================================================

/// Policy negotiation and lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Observers may narrow the candidate bounds (e.g. thermal caps).
    Adjust,
    /// Second narrowing round for constraints that depend on the
    /// adjusted range.
    Incompatible,
    /// The bounds are final; informational only.
    Notify,
    /// A new policy is coming up; informational only.
    Start,
}

type PolicyHandler = Box<dyn Fn(PolicyEvent, &mut PolicyRequest) + Send + Sync>;

struct PolicySub {
    id: SubscriptionId,
    handler: PolicyHandler,
}

/// Ordered list of policy observers.
pub struct PolicyChain {
    subs: RwLock<Vec<PolicySub>>,
    next_id: AtomicU64,
}

impl PolicyChain {
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(PolicyEvent, &mut PolicyRequest) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.write().push(PolicySub {
            id,
            handler: Box::new(handler),
        });
        id
    }

    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn broadcast(&self, event: PolicyEvent, req: &mut PolicyRequest) {
        for sub in self.subs.read().iter() {
            (sub.handler)(event, req);
        }
    }
}

impl Default for PolicyChain {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TIMING REFERENCE
// =============================================================================

/// Frequency-derived timing reference (delay-loop calibration analog).
///
/// On the first observed change the pre-change frequency and the seeded
/// calibration value are captured as the reference; later changes
/// rescale proportionally. Only meaningful while a single CPU is
/// online, and skipped entirely for constant-rate drivers.
pub struct TimingRef {
    /// (reference value, reference frequency in kHz), captured once.
    base: Mutex<Option<(u64, u32)>>,
    current: AtomicU64,
}

impl TimingRef {
    pub fn new(initial: u64) -> Self {
        Self {
            base: Mutex::new(None),
            current: AtomicU64::new(initial),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Install the calibrated value. Done once at boot, before any
    /// frequency change has been observed.
    pub fn seed(&self, value: u64) {
        self.current.store(value, Ordering::SeqCst);
    }

    /// Rescale around a frequency change.
    ///
    /// Raising the frequency is applied on the pre phase, lowering on
    /// the post phase, so the value is never optimistic about how fast
    /// the CPU currently runs.
    pub fn adjust(&self, phase: TransitionPhase, change: &FreqChange) {
        let mut base = self.base.lock();
        let (ref_val, ref_khz) = *base.get_or_insert((self.current(), change.old_khz));
        if ref_khz == 0 {
            return;
        }

        let speeding_up = change.new_khz > change.old_khz;
        let apply = match phase {
            TransitionPhase::Pre => speeding_up,
            TransitionPhase::Post => !speeding_up,
        };
        if apply {
            let scaled = ref_val * u64::from(change.new_khz) / u64::from(ref_khz);
            self.current.store(scaled, Ordering::SeqCst);
        }
    }
}

impl core::fmt::Debug for TimingRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimingRef")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TRANSITION SCOPE
// =============================================================================

/// Everything a single frequency transition needs from the core.
///
/// Constructed per operation and handed to the driver through
/// [`DriverView`](crate::driver::DriverView); `run` wraps the hardware
/// reprogramming closure in the pre/post protocol for every CPU of the
/// domain.
pub struct TransitionScope<'a> {
    pub(crate) chain: &'a TransitionChain,
    pub(crate) timing: &'a TimingRef,
    pub(crate) online_cpus: u32,
    pub(crate) const_loops: bool,
    pub(crate) policy: &'a Policy,
    pub(crate) cpus: CpuMask,
}

impl TransitionScope<'_> {
    /// Run `program` (the hardware write) bracketed by pre/post
    /// notifications at `new_khz`. `assumed_old_khz` is what the caller
    /// believes the CPU currently runs at.
    ///
    /// On failure the post phase is still emitted, reverted to the old
    /// frequency, so observers never stay in a half-announced state.
    pub(crate) fn run<F>(
        &self,
        assumed_old_khz: u32,
        new_khz: u32,
        program: F,
    ) -> crate::error::Result<()>
    where
        F: FnOnce() -> crate::error::Result<()>,
    {
        let mut old_khz = assumed_old_khz;

        // Drift correction: trust the recorded frequency over whatever
        // the caller assumed, unless the clock rate is constant.
        if !self.const_loops {
            let recorded = self.policy.cur_khz();
            if recorded != 0 && recorded != old_khz {
                log::warn!(
                    "cpufreq: recorded frequency {} kHz disagrees with assumed {} kHz",
                    recorded,
                    old_khz
                );
                old_khz = recorded;
            }
        }

        self.each_phase(TransitionPhase::Pre, old_khz, new_khz);

        match program() {
            Ok(()) => {
                self.each_phase(TransitionPhase::Post, old_khz, new_khz);
                self.policy.set_cur_khz(new_khz);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "cpufreq: transition to {} kHz failed, reverting observers",
                    new_khz
                );
                self.each_phase(TransitionPhase::Post, new_khz, old_khz);
                Err(e)
            }
        }
    }

    fn each_phase(&self, phase: TransitionPhase, old_khz: u32, new_khz: u32) {
        for cpu in self.cpus {
            let change = FreqChange {
                cpu,
                old_khz,
                new_khz,
            };
            match phase {
                TransitionPhase::Pre => {
                    self.chain.broadcast(TransitionPhase::Pre, &change);
                    self.timing_adjust(TransitionPhase::Pre, &change);
                }
                TransitionPhase::Post => {
                    self.timing_adjust(TransitionPhase::Post, &change);
                    self.chain.broadcast(TransitionPhase::Post, &change);
                }
            }
        }
    }

    fn timing_adjust(&self, phase: TransitionPhase, change: &FreqChange) {
        // The timing reference is a uniprocessor concept.
        if self.const_loops || self.online_cpus != 1 {
            return;
        }
        self.timing.adjust(phase, change);
    }
}

/// Emit a synthetic pre/post pair for a change that already happened
/// behind the core's back, then record the corrected frequency.
pub(crate) fn out_of_sync(scope: &TransitionScope<'_>, cpu: u32, old_khz: u32, new_khz: u32) {
    log::debug!(
        "cpufreq: CPU {} frequency out of sync, {} kHz -> {} kHz",
        cpu,
        old_khz,
        new_khz
    );
    let change = FreqChange {
        cpu,
        old_khz,
        new_khz,
    };
    scope.chain.broadcast(TransitionPhase::Pre, &change);
    scope.timing_adjust(TransitionPhase::Pre, &change);
    scope.timing_adjust(TransitionPhase::Post, &change);
    scope.chain.broadcast(TransitionPhase::Post, &change);
    scope.policy.set_cur_khz(new_khz);
}

// =============================================================================
// TESTS
// =============================================================================
