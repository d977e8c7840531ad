//! Messages exchanged between stages.
//!
//! Every `slot` field names the *recipient's* local slot, so a stage can
//! look a message up in its own tables without translating ids. The only
//! exception is [`StreamMsg::Handshake`], which is sent before the recipient
//! has a slot and therefore carries the sender's outbound slot.

use std::fmt;

use smallvec::SmallVec;

use crate::path::{SlotId, StageId};
use crate::payload::TypeTag;

/// Ordered list of type tags a fused stage emits.
pub type FusedLayout = SmallVec<[TypeTag; 4]>;

/// Why a path was closed or aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// All elements were delivered.
    Completed,
    /// The consumer no longer wants data.
    Cancelled,
    /// The declared type is not accepted by the receiver.
    TypeMismatch,
    /// The handshake was refused for another reason.
    Rejected,
    /// The sender violated the credit protocol.
    FlowControlViolation,
    /// Any other failure.
    Failure(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TypeMismatch => f.write_str("type mismatch"),
            Self::Rejected => f.write_str("rejected"),
            Self::FlowControlViolation => f.write_str("flow control violation"),
            Self::Failure(msg) => write!(f, "failure: {msg}"),
        }
    }
}

/// A batch of elements of one declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<P> {
    /// Recipient's inbound slot.
    pub slot: SlotId,
    /// Per-path sequence number, starting at 0.
    pub seq: u64,
    /// The elements.
    pub payload: P,
}

/// Stream protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMsg<P> {
    /// Downstream asks upstream to open a path of `declared_type` towards it.
    Join {
        /// Element type the downstream wants.
        declared_type: TypeTag,
    },
    /// Upstream offers a path.
    Handshake {
        /// Sender's outbound slot.
        slot: SlotId,
        /// Element type carried by the path.
        declared_type: TypeTag,
        /// Every type the sender emits.
        layout: FusedLayout,
    },
    /// Downstream accepted a path.
    HandshakeAck {
        /// Recipient's outbound slot.
        slot: SlotId,
        /// Sender's new inbound slot.
        inbound_slot: SlotId,
        /// Credit the sender may spend right away.
        initial_credit: u32,
    },
    /// Elements.
    Batch(Batch<P>),
    /// Receipt for a batch.
    BatchAck {
        /// Recipient's outbound slot.
        slot: SlotId,
        /// Acknowledged sequence number.
        seq: u64,
        /// Elements in the acknowledged batch.
        count: u32,
    },
    /// Additional credit.
    CreditGrant {
        /// Recipient's outbound slot.
        slot: SlotId,
        /// Credit to add. Negative values are protocol violations.
        amount: i64,
    },
    /// Graceful close after the last element.
    PathClose {
        /// Recipient's slot.
        slot: SlotId,
        /// Why the path closed.
        reason: CloseReason,
    },
    /// Immediate close; buffered elements are dropped.
    Abort {
        /// Recipient's slot.
        slot: SlotId,
        /// Why the path was aborted.
        reason: CloseReason,
    },
}

impl<P> StreamMsg<P> {
    /// Short message name for logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake-ack",
            Self::Batch(_) => "batch",
            Self::BatchAck { .. } => "batch-ack",
            Self::CreditGrant { .. } => "credit",
            Self::PathClose { .. } => "close",
            Self::Abort { .. } => "abort",
        }
    }
}

/// A message in transit between two stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<P> {
    /// Sending stage.
    pub from: StageId,
    /// Receiving stage.
    pub to: StageId,
    /// The message.
    pub msg: StreamMsg<P>,
}

impl<P> Envelope<P> {
    /// Creates an envelope.
    #[must_use]
    pub fn new(from: StageId, to: StageId, msg: StreamMsg<P>) -> Self {
        Self { from, to, msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Completed.to_string(), "completed");
        assert_eq!(
            CloseReason::Failure("disk full".into()).to_string(),
            "failure: disk full"
        );
    }

    #[test]
    fn test_kind() {
        let msg: StreamMsg<()> = StreamMsg::CreditGrant {
            slot: SlotId(1),
            amount: 4,
        };
        assert_eq!(msg.kind(), "credit");
        let env = Envelope::new(StageId(1), StageId(2), msg);
        assert_eq!(env.to, StageId(2));
    }
}
