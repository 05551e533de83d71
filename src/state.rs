//! Shared trigger state between the control listener and the drain loop.
//!
//! One `DumpState` instance exists per observation. The control listener is
//! the only writer of `target` and the only setter of `pending`; the drain
//! loop is the only clearer. All fields are atomics, so the two tasks share
//! the state without locks while keeping the arm/resolve transitions well
//! defined.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Coordination surface for the at-most-one pending trigger contract.
#[derive(Debug, Default)]
pub struct DumpState {
    pending: AtomicBool,
    target: AtomicU64,
    trigger_count: AtomicU64,
    dump_count: AtomicU64,
    advisory: AtomicU64,
}

impl DumpState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a received control datagram, whatever its fate.
    pub fn record_command(&self) {
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm a trigger at `target`, or reject if one is already pending.
    ///
    /// On rejection the still-armed target is returned for the error log;
    /// the armed target is never overwritten while pending.
    pub fn try_arm(&self, target: u64) -> Result<(), u64> {
        if self.pending.load(Ordering::Acquire) {
            return Err(self.target.load(Ordering::Relaxed));
        }
        // Target must be in place before pending is observable.
        self.target.store(target, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
        Ok(())
    }

    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Armed target position. Meaningful only while [`pending`](Self::pending).
    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Relaxed)
    }

    /// Resolve the pending trigger as served.
    pub fn complete_dump(&self) {
        self.dump_count.fetch_add(1, Ordering::Relaxed);
        self.pending.store(false, Ordering::Release);
    }

    /// Resolve the pending trigger as late: dropped, not counted as a dump.
    pub fn drop_late(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn set_advisory(&self, position: u64) {
        self.advisory.store(position, Ordering::Relaxed);
    }

    pub fn advisory(&self) -> u64 {
        self.advisory.load(Ordering::Relaxed)
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Relaxed)
    }

    pub fn dump_count(&self) -> u64 {
        self.dump_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_publishes_target() {
        let state = DumpState::new();
        assert!(!state.pending());

        state.try_arm(96).expect("first arm succeeds");
        assert!(state.pending());
        assert_eq!(state.target(), 96);
    }

    #[test]
    fn second_arm_rejected_and_target_preserved() {
        let state = DumpState::new();
        state.try_arm(96).expect("first arm succeeds");

        let rejected = state.try_arm(128);
        assert_eq!(rejected, Err(96));
        assert_eq!(state.target(), 96);
    }

    #[test]
    fn resolution_allows_rearming() {
        let state = DumpState::new();
        state.try_arm(96).expect("first arm succeeds");
        state.complete_dump();

        assert!(!state.pending());
        assert_eq!(state.dump_count(), 1);
        state.try_arm(128).expect("rearm after resolution");
        assert_eq!(state.target(), 128);
    }

    #[test]
    fn late_drop_does_not_count_a_dump() {
        let state = DumpState::new();
        state.try_arm(96).expect("arm succeeds");
        state.drop_late();

        assert!(!state.pending());
        assert_eq!(state.dump_count(), 0);
    }

    #[test]
    fn advisory_is_independent_of_pending() {
        let state = DumpState::new();
        state.set_advisory(48);
        assert_eq!(state.advisory(), 48);
        assert!(!state.pending());

        state.try_arm(96).expect("arm succeeds");
        state.set_advisory(64);
        assert_eq!(state.advisory(), 64);
        assert_eq!(state.target(), 96);
    }

    #[test]
    fn every_datagram_counts() {
        let state = DumpState::new();
        state.record_command();
        state.record_command();
        state.record_command();
        assert_eq!(state.trigger_count(), 3);
        assert_eq!(state.dump_count(), 0);
    }
}
