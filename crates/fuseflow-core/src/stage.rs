//! # Stage
//!
//! A stage is the stream manager of one processing unit. It owns the
//! inbound path table, the outbound [`FusedScatterer`] and the
//! [`CreditController`], and routes every [`StreamMsg`] to the right one.
//!
//! ## Lifecycle
//!
//! ```text
//!   Idle ──(first path)──▶ Active ──(!continuous, no pending handshakes)──▶ Draining
//!                                                                            │
//!                                  (no inbound paths, outbound clean)        ▼
//!                                                                           Done
//! ```
//!
//! While draining, every output type whose input is exhausted and whose
//! buffer is empty is closed gracefully. Types are closed independently, so
//! one finished stream never holds up another.
//!
//! ## Handshake
//!
//! ```text
//!  downstream                     upstream
//!      │──── Join{type} ────────────▶│  open_output: allocate slot, pending += 1
//!      │◀─── Handshake{slot,type} ───│
//!      │  open inbound path          │
//!      │──── HandshakeAck{credit} ──▶│  open outbound path, pending -= 1
//! ```
//!
//! What a stage does with received elements is decided by its
//! [`StageLogic`]. [`Forward`] feeds every batch into the outbound scatterer
//! of the same type, which makes the stage a fused multiplexer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StageConfig;
use crate::credit::CreditController;
use crate::error::StreamError;
use crate::fused::FusedScatterer;
use crate::message::{Batch, CloseReason, Envelope, StreamMsg};
use crate::path::{Direction, Path, Peer, SeqCheck, SlotAllocator, SlotId, StageId};
use crate::payload::{Element, Payload, TypeTag};

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    /// No path established yet.
    Idle,
    /// Streaming.
    Active,
    /// Not continuous and no handshake pending; closing outputs as inputs end.
    Draining,
    /// Nothing left to do.
    Done,
}

/// Per-stage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageMetrics {
    /// Batches accepted on inbound paths.
    pub batches_received: u64,
    /// Elements accepted on inbound paths.
    pub elements_received: u64,
    /// Batches sent on outbound paths.
    pub batches_dispatched: u64,
    /// Elements sent on outbound paths.
    pub elements_dispatched: u64,
    /// Batches dropped because of their type.
    pub type_mismatches: u64,
    /// Messages naming an unknown slot.
    pub unknown_slots: u64,
    /// Rejected grants and batches exceeding credit.
    pub flow_control_violations: u64,
    /// Outbound paths closed with elements still queued.
    pub premature_closes: u64,
    /// Elements dropped by premature closes and aborts.
    pub elements_discarded: u64,
    /// Handshakes refused.
    pub handshakes_rejected: u64,
    /// Credit rounds run.
    pub credit_rounds: u64,
    /// Total credit granted to upstream stages.
    pub credit_granted: u64,
}

/// Decides what a stage does with its input and when its input is over.
pub trait StageLogic<P: Payload>: Send + 'static {
    /// Whether an inbound path of type `tag` can be accepted.
    fn accepts(&self, tag: TypeTag, out: &FusedScatterer<P>) -> bool;

    /// Called once an inbound path passed `accepts`. Returning `false`
    /// rejects the handshake.
    fn on_inbound_open(&mut self, slot: SlotId, tag: TypeTag) -> bool {
        let _ = (slot, tag);
        true
    }

    /// Consumes one batch.
    ///
    /// # Errors
    ///
    /// Errors are logged and counted by the stage; the batch is still
    /// acknowledged.
    fn on_batch(
        &mut self,
        slot: SlotId,
        payload: P,
        out: &mut FusedScatterer<P>,
    ) -> Result<(), StreamError>;

    /// Called when an inbound path closes (`aborted == false`) or is aborted.
    fn on_inbound_closed(&mut self, slot: SlotId, tag: TypeTag, aborted: bool) {
        let _ = (slot, tag, aborted);
    }

    /// Produces new elements. Runs before every dispatch.
    fn generate(&mut self, out: &mut FusedScatterer<P>) {
        let _ = out;
    }

    /// Whether no more elements of `tag` will be produced, given the number
    /// of inbound paths of that type still open.
    fn input_exhausted(&self, tag: TypeTag, inbound_of_tag: usize) -> bool {
        let _ = tag;
        inbound_of_tag == 0
    }

    /// Keeps the stage from draining, in addition to the `continuous` flag.
    fn keep_alive(&self) -> bool {
        false
    }
}

/// Forwards every batch to the outbound scatterer of its type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Forward;

impl<P: Payload> StageLogic<P> for Forward {
    fn accepts(&self, tag: TypeTag, out: &FusedScatterer<P>) -> bool {
        out.contains(tag)
    }

    fn on_batch(
        &mut self,
        slot: SlotId,
        payload: P,
        out: &mut FusedScatterer<P>,
    ) -> Result<(), StreamError> {
        out.absorb(payload)
            .map(|_| ())
            .map_err(|payload| StreamError::TypeMismatch {
                slot,
                actual: payload.type_tag(),
            })
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingHandshake {
    tag: TypeTag,
    peer: StageId,
}

/// Stream manager of one processing unit.
pub struct Stage<P, L = Forward> {
    id: StageId,
    logic: L,
    out: FusedScatterer<P>,
    inbound: BTreeMap<SlotId, Path>,
    pending: BTreeMap<SlotId, PendingHandshake>,
    controller: CreditController,
    slots: SlotAllocator,
    continuous: bool,
    state: StageState,
    ever_active: bool,
    metrics: StageMetrics,
}

impl<P: Payload, L> fmt::Debug for Stage<P, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("continuous", &self.continuous)
            .field("inbound", &self.inbound.len())
            .field("pending", &self.pending.len())
            .field("out", &self.out)
            .finish_non_exhaustive()
    }
}

type RegisterFn<P> = fn(&mut FusedScatterer<P>) -> Result<(), StreamError>;

fn register_output<P: Payload, T: Element<P>>(
    out: &mut FusedScatterer<P>,
) -> Result<(), StreamError> {
    out.register::<T>()
}

/// Builder for [`Stage`].
pub struct StageBuilder<P> {
    id: StageId,
    config: StageConfig,
    clock: Option<Arc<dyn Clock>>,
    outputs: Vec<RegisterFn<P>>,
}

impl<P: Payload> StageBuilder<P> {
    /// Starts a stage with default configuration and no outputs.
    #[must_use]
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            config: StageConfig::default(),
            clock: None,
            outputs: Vec::new(),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the `continuous` flag.
    #[must_use]
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.config.continuous = continuous;
        self
    }

    /// Sets the clock. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Registers an outbound element type.
    #[must_use]
    pub fn output<T: Element<P>>(mut self) -> Self {
        self.outputs.push(register_output::<P, T>);
        self
    }

    /// Builds a [`Forward`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidConfig`] or
    /// [`StreamError::DuplicateType`].
    pub fn build(self) -> Result<Stage<P, Forward>, StreamError> {
        self.build_with(Forward)
    }

    /// Builds a stage driven by `logic`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidConfig`] or
    /// [`StreamError::DuplicateType`].
    pub fn build_with<L: StageLogic<P>>(self, logic: L) -> Result<Stage<P, L>, StreamError> {
        let mut out =
            FusedScatterer::new(self.config.dispatch_policy, self.config.credit.max_batch_size);
        for register in self.outputs {
            register(&mut out)?;
        }
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        Stage::new(self.id, self.config, clock, logic, out)
    }
}

impl<P: Payload> Stage<P, Forward> {
    /// Starts building a [`Forward`] stage.
    #[must_use]
    pub fn builder(id: StageId) -> StageBuilder<P> {
        StageBuilder::new(id)
    }
}

impl<P: Payload, L: StageLogic<P>> Stage<P, L> {
    /// Creates a stage around an already populated outbound scatterer.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidConfig`] if the credit configuration
    /// does not validate.
    pub fn new(
        id: StageId,
        config: StageConfig,
        clock: Arc<dyn Clock>,
        logic: L,
        out: FusedScatterer<P>,
    ) -> Result<Self, StreamError> {
        config.credit.validate()?;
        Ok(Self {
            id,
            logic,
            out,
            inbound: BTreeMap::new(),
            pending: BTreeMap::new(),
            controller: CreditController::new(config.credit, clock),
            slots: SlotAllocator::new(),
            continuous: config.continuous,
            state: StageState::Idle,
            ever_active: false,
            metrics: StageMetrics::default(),
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Stage id.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> StageState {
        self.state
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        self.metrics
    }

    /// The stage logic.
    #[must_use]
    pub fn logic(&self) -> &L {
        &self.logic
    }

    /// The stage logic, mutably.
    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.logic
    }

    /// Outbound side.
    #[must_use]
    pub fn outbound(&self) -> &FusedScatterer<P> {
        &self.out
    }

    /// Outbound side, mutably. Call [`tick`](Self::tick) or
    /// [`flush`](Self::flush) afterwards to dispatch pushed elements.
    pub fn outbound_mut(&mut self) -> &mut FusedScatterer<P> {
        &mut self.out
    }

    /// Open inbound paths, by slot.
    pub fn inbound_paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.inbound.values()
    }

    /// Inbound path on `slot`.
    #[must_use]
    pub fn inbound(&self, slot: SlotId) -> Option<&Path> {
        self.inbound.get(&slot)
    }

    /// Credit controller.
    #[must_use]
    pub fn controller(&self) -> &CreditController {
        &self.controller
    }

    /// Handshakes sent and not yet acknowledged.
    #[must_use]
    pub fn pending_handshakes(&self) -> usize {
        self.pending.len()
    }

    /// Whether the stage stays alive without inbound demand.
    #[must_use]
    pub fn continuous(&self) -> bool {
        self.continuous || self.logic.keep_alive()
    }

    /// Sets the `continuous` flag.
    pub fn set_continuous(&mut self, continuous: bool) {
        self.continuous = continuous;
        self.refresh_state();
    }

    /// Returns `true` if the outbound side has no capacity left.
    #[must_use]
    pub fn congested(&self) -> bool {
        self.out.capacity() == 0
    }

    /// Returns `true` once the stage has nothing left to do.
    #[must_use]
    pub fn done(&self) -> bool {
        !self.continuous()
            && self.pending.is_empty()
            && self.inbound.is_empty()
            && self.out.clean()
    }

    // ---------------------------------------------------------------------
    // Outbound handshakes
    // ---------------------------------------------------------------------

    /// Allocates an outbound slot of type `tag` towards `peer` and returns
    /// the handshake to send.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`] or
    /// [`StreamError::SlotsExhausted`].
    pub fn open_output(&mut self, tag: TypeTag, peer: StageId) -> Result<StreamMsg<P>, StreamError> {
        if !self.out.contains(tag) {
            return Err(StreamError::UnregisteredType(tag));
        }
        let slot = self.allocate_slot()?;
        self.pending.insert(slot, PendingHandshake { tag, peer });
        debug!(stage = %self.id, %slot, type_tag = %tag, %peer, "handshake pending");
        self.make_handshake(slot)
            .ok_or(StreamError::UnknownSlot {
                slot,
                message: "handshake",
            })
    }

    /// Builds the handshake for a pending outbound slot.
    #[must_use]
    pub fn make_handshake(&self, slot: SlotId) -> Option<StreamMsg<P>> {
        self.pending.get(&slot).map(|p| StreamMsg::Handshake {
            slot,
            declared_type: p.tag,
            layout: self.out.layout(),
        })
    }

    /// Starts a graceful close of every outbound path of `tag` and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`].
    pub fn close_output(
        &mut self,
        tag: TypeTag,
        out: &mut Vec<Envelope<P>>,
    ) -> Result<(), StreamError> {
        self.out.close_type(tag)?;
        self.flush(out);
        self.refresh_state();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Message handling
    // ---------------------------------------------------------------------

    /// Handles one message from stage `from`. Replies and follow-up
    /// messages are appended to `out`.
    pub fn handle(&mut self, from: StageId, msg: StreamMsg<P>, out: &mut Vec<Envelope<P>>) {
        match msg {
            StreamMsg::Join { declared_type } => match self.open_output(declared_type, from) {
                Ok(handshake) => out.push(Envelope::new(self.id, from, handshake)),
                Err(err) => {
                    warn!(stage = %self.id, peer = %from, %err, "join refused");
                }
            },
            StreamMsg::Handshake {
                slot,
                declared_type,
                layout,
            } => {
                debug!(stage = %self.id, peer = %from, ?layout, "handshake received");
                self.on_handshake(from, slot, declared_type, out);
            }
            StreamMsg::HandshakeAck {
                slot,
                inbound_slot,
                initial_credit,
            } => self.on_handshake_ack(from, slot, inbound_slot, initial_credit),
            StreamMsg::Batch(batch) => self.on_batch(batch, out),
            StreamMsg::BatchAck { slot, count, .. } => match self.out.path_mut(slot) {
                Some(path) => self.controller.acknowledge(path, count),
                None => self.unknown_slot(slot, "batch-ack"),
            },
            StreamMsg::CreditGrant { slot, amount } => self.on_credit(slot, amount),
            StreamMsg::PathClose { slot, reason } => self.on_close(slot, &reason, false),
            StreamMsg::Abort { slot, reason } => self.on_close(slot, &reason, true),
        }
        self.advance(out);
    }

    /// Periodic entry point: runs a credit round if one is due, then
    /// generates and dispatches.
    pub fn tick(&mut self, out: &mut Vec<Envelope<P>>) {
        let now = self.controller.now();
        let room = self.out.capacity();
        let grants = self
            .controller
            .recompute_round(now, self.inbound.values_mut(), room);
        self.metrics.credit_rounds = self.controller.rounds();
        for grant in grants {
            self.metrics.credit_granted += u64::from(grant.amount);
            out.push(Envelope::new(
                self.id,
                grant.peer.stage,
                StreamMsg::CreditGrant {
                    slot: grant.peer.slot,
                    amount: i64::from(grant.amount),
                },
            ));
        }
        self.advance(out);
    }

    /// Dispatches whatever credit allows without generating or closing.
    pub fn flush(&mut self, out: &mut Vec<Envelope<P>>) {
        let outcome = self.out.dispatch(self.controller.now());
        for delivery in outcome.deliveries {
            let count = delivery.items.len() as u64;
            self.metrics.batches_dispatched += 1;
            self.metrics.elements_dispatched += count;
            out.push(Envelope::new(
                self.id,
                delivery.peer.stage,
                StreamMsg::Batch(Batch {
                    slot: delivery.peer.slot,
                    seq: delivery.seq,
                    payload: delivery.items,
                }),
            ));
        }
        for (slot, peer) in outcome.closed {
            debug!(stage = %self.id, %slot, "outbound path closed");
            out.push(Envelope::new(
                self.id,
                peer.stage,
                StreamMsg::PathClose {
                    slot: peer.slot,
                    reason: CloseReason::Completed,
                },
            ));
        }
    }

    fn on_handshake(
        &mut self,
        from: StageId,
        their_slot: SlotId,
        tag: TypeTag,
        out: &mut Vec<Envelope<P>>,
    ) {
        let reject = |stage: &mut Self, reason: CloseReason, out: &mut Vec<Envelope<P>>| {
            stage.metrics.handshakes_rejected += 1;
            warn!(stage = %stage.id, peer = %from, type_tag = %tag, %reason, "handshake rejected");
            out.push(Envelope::new(
                stage.id,
                from,
                StreamMsg::Abort {
                    slot: their_slot,
                    reason,
                },
            ));
        };

        if !self.logic.accepts(tag, &self.out) {
            reject(self, CloseReason::TypeMismatch, out);
            return;
        }
        let slot = match self.allocate_slot() {
            Ok(slot) => slot,
            Err(err) => {
                reject(self, CloseReason::Failure(err.to_string()), out);
                return;
            }
        };
        if !self.logic.on_inbound_open(slot, tag) {
            reject(self, CloseReason::Rejected, out);
            return;
        }

        let credit = self.controller.initial_credit(tag, self.out.capacity());
        let peer = Peer {
            stage: from,
            slot: their_slot,
        };
        let path = self
            .controller
            .open(slot, Direction::Inbound, tag, peer, credit);
        self.inbound.insert(slot, path);
        self.metrics.credit_granted += u64::from(credit);
        out.push(Envelope::new(
            self.id,
            from,
            StreamMsg::HandshakeAck {
                slot: their_slot,
                inbound_slot: slot,
                initial_credit: credit,
            },
        ));
    }

    fn on_handshake_ack(
        &mut self,
        from: StageId,
        slot: SlotId,
        inbound_slot: SlotId,
        initial_credit: u32,
    ) {
        let Some(pending) = self.pending.remove(&slot) else {
            self.unknown_slot(slot, "handshake-ack");
            return;
        };
        if pending.peer != from {
            warn!(stage = %self.id, %slot, expected = %pending.peer, actual = %from, "handshake acknowledged by another stage");
        }
        let peer = Peer {
            stage: from,
            slot: inbound_slot,
        };
        let path = self.controller.open(
            slot,
            Direction::Outbound,
            pending.tag,
            peer,
            initial_credit,
        );
        if let Err(err) = self.out.assign_tagged(pending.tag, path) {
            warn!(stage = %self.id, %slot, %err, "acknowledged path dropped");
        }
    }

    fn on_batch(&mut self, batch: Batch<P>, out: &mut Vec<Envelope<P>>) {
        let Batch { slot, seq, payload } = batch;
        let actual = payload.type_tag();
        let Some(path) = self.inbound.get_mut(&slot) else {
            self.unknown_slot(slot, "batch");
            return;
        };

        if path.type_tag != actual || !self.logic.accepts(actual, &self.out) {
            self.metrics.type_mismatches += 1;
            let err = StreamError::TypeMismatch { slot, actual };
            error!(stage = %self.id, %slot, expected = %path.type_tag, %actual, %err, "batch dropped");
            return;
        }

        match path.check_seq(seq) {
            SeqCheck::InOrder => {}
            SeqCheck::Gap { expected } => {
                warn!(stage = %self.id, %slot, expected, seq, "batch sequence gap");
            }
            SeqCheck::Duplicate { expected } => {
                warn!(stage = %self.id, %slot, expected, seq, "duplicate batch dropped");
                return;
            }
        }

        let count = payload.len();
        let count32 = u32::try_from(count).unwrap_or(u32::MAX);
        if !self.controller.consume(path, count32) {
            self.metrics.flow_control_violations += 1;
        }
        let peer = path.peer;

        let started = self.controller.now();
        let result = self.logic.on_batch(slot, payload, &mut self.out);
        let elapsed = self.controller.now().saturating_sub(started);
        self.controller.observe(actual, count, elapsed);

        match result {
            Ok(()) => {
                self.metrics.batches_received += 1;
                self.metrics.elements_received += count as u64;
            }
            Err(err) => {
                warn!(stage = %self.id, %slot, %err, "batch handler failed");
            }
        }

        out.push(Envelope::new(
            self.id,
            peer.stage,
            StreamMsg::BatchAck {
                slot: peer.slot,
                seq,
                count: count32,
            },
        ));
    }

    fn on_credit(&mut self, slot: SlotId, amount: i64) {
        let Some(path) = self.out.path_mut(slot) else {
            self.unknown_slot(slot, "credit");
            return;
        };
        if let Err(err) = self.controller.grant(path, amount) {
            self.metrics.flow_control_violations += 1;
            warn!(stage = %self.id, %slot, %err, "credit grant rejected");
        }
    }

    fn on_close(&mut self, slot: SlotId, reason: &CloseReason, aborted: bool) {
        if let Some(mut path) = self.inbound.remove(&slot) {
            let tag = path.type_tag;
            if aborted {
                self.controller.abort(&mut path);
                warn!(stage = %self.id, %slot, %reason, "inbound path aborted");
            } else {
                match self.controller.close(&mut path, 0) {
                    Ok(()) => debug!(stage = %self.id, %slot, %reason, "inbound path closed"),
                    Err(err) => warn!(stage = %self.id, %slot, %reason, %err, "inbound path closed"),
                }
            }
            self.logic.on_inbound_closed(slot, tag, aborted);
            return;
        }

        if self.out.contains_slot(slot) {
            let discarded = if aborted {
                self.out.abort_path(slot).unwrap_or(0)
            } else {
                self.out.take_pending(slot).unwrap_or(0)
            };
            self.metrics.elements_discarded += discarded as u64;
            let Some(path) = self.out.path_mut(slot) else {
                return;
            };
            if aborted {
                warn!(stage = %self.id, %slot, %reason, discarded, "outbound path aborted");
            } else if path.is_live() {
                if let Err(err) = self.controller.close(path, discarded) {
                    self.metrics.premature_closes += 1;
                    warn!(stage = %self.id, %slot, %reason, %err, "outbound path closed by peer");
                }
            }
            return;
        }

        if let Some(pending) = self.pending.remove(&slot) {
            warn!(stage = %self.id, %slot, type_tag = %pending.tag, %reason, "handshake refused by peer");
            return;
        }

        self.unknown_slot(slot, if aborted { "abort" } else { "close" });
    }

    fn unknown_slot(&mut self, slot: SlotId, message: &'static str) {
        self.metrics.unknown_slots += 1;
        let err = StreamError::UnknownSlot { slot, message };
        warn!(stage = %self.id, %err, "message dropped");
    }

    // ---------------------------------------------------------------------
    // Progress
    // ---------------------------------------------------------------------

    /// Generates, closes exhausted outputs when draining and dispatches.
    fn advance(&mut self, out: &mut Vec<Envelope<P>>) {
        self.logic.generate(&mut self.out);
        self.refresh_state();
        if self.state == StageState::Draining {
            self.close_exhausted();
        }
        self.flush(out);
        self.refresh_state();
    }

    fn close_exhausted(&mut self) {
        for tag in self.out.layout() {
            if self.out.finished(tag) != Some(false) || self.out.buffered_of(tag) != Some(0) {
                continue;
            }
            let inbound_of_tag = self
                .inbound
                .values()
                .filter(|p| p.type_tag == tag)
                .count();
            if self.logic.input_exhausted(tag, inbound_of_tag) {
                debug!(stage = %self.id, type_tag = %tag, "closing exhausted output");
                if let Err(err) = self.out.close_type(tag) {
                    warn!(stage = %self.id, type_tag = %tag, %err, "output close failed");
                }
            }
        }
    }

    fn refresh_state(&mut self) {
        if !self.ever_active {
            if self.inbound.is_empty() && self.out.paths().next().is_none() {
                return;
            }
            self.ever_active = true;
        }
        let next = if self.done() {
            StageState::Done
        } else if !self.continuous() && self.pending.is_empty() {
            StageState::Draining
        } else {
            StageState::Active
        };
        if next != self.state {
            debug!(stage = %self.id, from = ?self.state, to = ?next, "stage state changed");
            self.state = next;
        }
    }

    fn allocate_slot(&mut self) -> Result<SlotId, StreamError> {
        self.slots
            .allocate(|s| {
                self.inbound.contains_key(&s)
                    || self.pending.contains_key(&s)
                    || self.out.contains_slot(s)
            })
            .ok_or(StreamError::SlotsExhausted)
    }
}
