//! Error types for stream stages.
//!
//! Message-level errors (`TypeMismatch`, `UnknownSlot`, `FlowControlViolation`,
//! `PrematureClose`) never terminate a stage: handlers log them, count them
//! in [`StageMetrics`](crate::stage::StageMetrics) and carry on. The
//! remaining variants are configuration or host errors returned to callers.

use crate::path::{SlotId, StageId};
use crate::payload::TypeTag;

/// Errors produced by paths, scatterers, stages and the local runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// A batch carries a type that the receiving path or stage does not handle.
    #[error("type mismatch on {slot}: batch of type {actual} matches no registered scatterer")]
    TypeMismatch {
        /// Slot the batch arrived on.
        slot: SlotId,
        /// Type tag carried by the batch.
        actual: TypeTag,
    },

    /// A message references a slot absent from the path tables.
    #[error("unknown {slot} in {message} message")]
    UnknownSlot {
        /// The unknown slot.
        slot: SlotId,
        /// Kind of message that referenced it.
        message: &'static str,
    },

    /// A credit grant was negative or would overflow the path's credit.
    #[error("flow control violation on {slot}: grant of {amount} to credit {credit}")]
    FlowControlViolation {
        /// Offending path.
        slot: SlotId,
        /// Requested grant.
        amount: i64,
        /// Credit at the time of the grant.
        credit: u32,
    },

    /// A path was closed while it still buffered data.
    #[error("premature close of {slot}: {discarded} buffered elements discarded")]
    PrematureClose {
        /// Closed path.
        slot: SlotId,
        /// Number of elements dropped.
        discarded: usize,
    },

    /// No scatterer is registered for the requested element type.
    #[error("no scatterer registered for type {0}")]
    UnregisteredType(TypeTag),

    /// A scatterer for the element type is already registered.
    #[error("scatterer for type {0} registered twice")]
    DuplicateType(TypeTag),

    /// All slot ids of a stage are in use.
    #[error("slot space exhausted")]
    SlotsExhausted,

    /// A stage id does not resolve to a live stage.
    #[error("unknown stage {0}")]
    UnknownStage(StageId),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A driven pipeline did not reach its goal within the cycle limit.
    #[error("pipeline stalled after {cycles} credit cycles")]
    Stalled {
        /// Number of cycles that were run.
        cycles: usize,
    },
}
