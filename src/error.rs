//! Error kinds surfaced by the TSCH core.
//!
//! Nothing propagates above the MAC except through packet-sent callbacks,
//! the upward packet-input call, and the observable `associated` state
//! variable (see `mac::Mac::is_associated`) -- this enum exists for the
//! synchronous call sites that can fail directly.

use ieee802154::mac::DecodeError;

/// Terminal result of a single transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Radio ACKed (unicast) or broadcast transmission completed.
    Ok,
    /// No ACK was heard within the guard time.
    NoAck,
    /// CCA found the channel busy.
    Collision,
    /// The radio driver rejected the send.
    Err,
    /// No packet was available, or the prepared buffer was invalid.
    ErrFatal,
}

impl Default for TxOutcome {
    fn default() -> Self {
        TxOutcome::Err
    }
}

/// Core MAC errors surfaced by the synchronous call sites that can fail directly.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Per-neighbour queue full, no neighbour slot available, or the
    /// global lock is held by cooperative code.
    EnqueueFail,

    /// The input ring had no free slot; the packet was dropped.
    InputQueueFull,

    /// The dequeued-packet ring had no free slot.
    DequeueFull,

    /// The timer interrupt fired after its deadline; the slot was skipped.
    DeadlineMiss,

    /// `last_sync_asn` exceeded the desynchronisation threshold.
    Desync,

    /// An Enhanced Beacon advertised a join priority beyond the
    /// configured maximum.
    JoinPriorityTooHigh,

    /// 802.15.4 frame decode failure.
    Decode(DecodeError),

    /// Wrapper for unhandled / underlying radio errors.
    Radio(E),

    /// The global lock could not be acquired or is held by the other side.
    LockHeld,
}

impl<E> From<DecodeError> for CoreError<E> {
    fn from(e: DecodeError) -> Self {
        CoreError::Decode(e)
    }
}
