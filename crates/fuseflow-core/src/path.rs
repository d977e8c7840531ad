//! Paths: credit-tracked conduits between two stages.
//!
//! A [`Path`] carries elements of exactly one declared type in one direction.
//! Each side of a connection holds its own `Path` value under its own
//! [`SlotId`]; the two halves refer to each other through [`Peer`].
//!
//! ```text
//!   upstream stage                          downstream stage
//! ┌────────────────────┐                ┌────────────────────┐
//! │ outbound slot-1    │── Batch ──────▶│ inbound slot-4     │
//! │ credit  = window   │◀─ BatchAck ────│ credit = granted,  │
//! │ in_flight = unacked│◀─ CreditGrant ─│   not yet received │
//! └────────────────────┘                └────────────────────┘
//! ```
//!
//! Credit arithmetic lives in [`CreditController`](crate::credit::CreditController);
//! this module only holds the per-path state.

use std::fmt;
use std::time::Duration;

use crate::payload::TypeTag;

/// Identifier of a path inside one stage.
///
/// Inbound and outbound paths share one slot namespace per stage.
/// `SlotId(0)` is reserved as [`SlotId::INVALID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u16);

impl SlotId {
    /// Reserved slot that never names a path.
    pub const INVALID: SlotId = SlotId(0);
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Identifier of a stage inside a host registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage-{}", self.0)
    }
}

/// The remote half of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Stage holding the other half.
    pub stage: StageId,
    /// Slot of the other half inside that stage.
    pub slot: SlotId,
}

/// Direction of a path relative to the stage holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Elements arrive on this path.
    Inbound,
    /// Elements leave on this path.
    Outbound,
}

/// Lifecycle of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathState {
    /// Accepting and delivering elements.
    Open,
    /// Draining what is left; no new elements are assigned.
    Closing,
    /// Finished. Terminal.
    Closed,
}

/// Result of checking an inbound batch sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// The expected next sequence number.
    InOrder,
    /// Later than expected; some batches were skipped.
    Gap {
        /// Sequence number that was expected.
        expected: u64,
    },
    /// Already seen.
    Duplicate {
        /// Sequence number that was expected.
        expected: u64,
    },
}

/// One half of a directed, credit-tracked conduit.
#[derive(Debug, Clone)]
pub struct Path {
    pub(crate) slot: SlotId,
    pub(crate) peer: Peer,
    pub(crate) direction: Direction,
    pub(crate) type_tag: TypeTag,
    pub(crate) credit: u32,
    pub(crate) in_flight: u32,
    pub(crate) state: PathState,
    /// Outbound: next sequence number to send. Inbound: next one expected.
    pub(crate) seq: u64,
    pub(crate) last_dispatch: Option<Duration>,
}

impl Path {
    /// Local slot of this path.
    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Remote half of this path.
    #[must_use]
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Direction relative to the owning stage.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Declared element type.
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Current credit.
    ///
    /// Outbound: the window granted by the receiver. Inbound: credit handed
    /// to the sender that has not been used yet.
    #[must_use]
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Elements sent and not yet acknowledged (outbound only).
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Credit that can still be spent: `credit - in_flight`.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.credit.saturating_sub(self.in_flight)
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> PathState {
        self.state
    }

    /// Returns `true` unless the path is closed.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != PathState::Closed
    }

    /// Returns `true` once the path is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == PathState::Closed
    }

    /// Time of the last dispatch on this path, if any.
    #[must_use]
    pub fn last_dispatch(&self) -> Option<Duration> {
        self.last_dispatch
    }

    /// Takes the next outbound sequence number.
    pub(crate) fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq = self.seq.saturating_add(1);
        seq
    }

    /// Checks an inbound sequence number and advances the expectation.
    ///
    /// Duplicates leave the expectation untouched. The expectation saturates
    /// at `u64::MAX`.
    pub(crate) fn check_seq(&mut self, seq: u64) -> SeqCheck {
        let expected = self.seq;
        if seq < expected {
            return SeqCheck::Duplicate { expected };
        }
        self.seq = seq.saturating_add(1);
        if seq == expected {
            SeqCheck::InOrder
        } else {
            SeqCheck::Gap { expected }
        }
    }
}

/// Hands out slot ids for one stage.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    next: u16,
}

impl SlotAllocator {
    /// Creates an allocator whose first slot is `slot-1`.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns the next slot for which `in_use` is false.
    ///
    /// Wraps around and skips [`SlotId::INVALID`]. Returns `None` if every
    /// slot is taken.
    pub fn allocate(&mut self, mut in_use: impl FnMut(SlotId) -> bool) -> Option<SlotId> {
        for _ in 0..u16::MAX {
            let candidate = SlotId(self.next);
            self.next = self.next.checked_add(1).unwrap_or(1);
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}
