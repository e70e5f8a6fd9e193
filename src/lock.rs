//! Global cooperative/interrupt lock.
//!
//! Two priority levels share one MAC context: the slot engine runs from a
//! high-resolution timer interrupt and owns `current_asn`/`last_sync_asn`/
//! radio state; everything else runs cooperatively and performs structural
//! mutation (schedule edits, neighbour add/remove, callback dispatch).
//! The interrupt side never blocks -- it only ever checks `requested` and
//! skips a slot. Cooperative acquire busy-waits, bounded, for a slot
//! operation already in flight to finish before taking the lock.

use core::sync::atomic::{AtomicBool, Ordering};

/// Upper bound on spin iterations while waiting for a slot operation to
/// clear. A slot is a small, fixed amount of work; reaching this bound
/// means the interrupt side got stuck, and acquisition fails the same as
/// it would against a genuinely held lock.
const MAX_ACQUIRE_SPINS: u32 = 1_000;

pub struct GlobalLock {
    requested: AtomicBool,
    held: AtomicBool,
    in_slot_operation: AtomicBool,
}

impl GlobalLock {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            held: AtomicBool::new(false),
            in_slot_operation: AtomicBool::new(false),
        }
    }

    /// Called by the slot engine at entry to every slot: true means the
    /// slot must be skipped rather than proceed.
    pub fn slot_should_yield(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Called by the slot engine once it commits to running a slot.
    pub fn enter_slot_operation(&self) {
        self.in_slot_operation.store(true, Ordering::Release);
    }

    pub fn exit_slot_operation(&self) {
        self.in_slot_operation.store(false, Ordering::Release);
    }

    /// Acquire for cooperative code: sets `requested`, busy-waits for
    /// `in_slot_operation` to clear (a slot is a small, bounded amount of
    /// work, so the spin is capped rather than unbounded), then atomically
    /// sets `held` and clears `requested`. Only a lock already held by
    /// another cooperative caller -- or a slot operation that overran the
    /// spin bound -- returns failure.
    pub fn try_acquire(&self) -> bool {
        self.requested.store(true, Ordering::Release);

        let mut spins = 0u32;
        while self.in_slot_operation.load(Ordering::Acquire) {
            spins += 1;
            if spins >= MAX_ACQUIRE_SPINS {
                self.requested.store(false, Ordering::Release);
                return false;
            }
            core::hint::spin_loop();
        }

        if self.held.swap(true, Ordering::AcqRel) {
            self.requested.store(false, Ordering::Release);
            return false;
        }

        self.requested.store(false, Ordering::Release);
        true
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// RAII guard form of `try_acquire`.
    pub fn lock(&self) -> Option<LockGuard<'_>> {
        if self.try_acquire() {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }
}

impl Default for GlobalLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LockGuard<'a> {
    lock: &'a GlobalLock,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
