//! # Credit Controller
//!
//! Per-path credit arithmetic and the periodic credit round.
//!
//! ## How It Works
//!
//! ```text
//! ┌──────────┐                               ┌──────────┐
//! │  Sender  │<── HandshakeAck (initial) ────│ Receiver │
//! │          │── Batch (≤ credit-in_flight) ─>│          │
//! │          │<── BatchAck (count) ──────────│          │
//! │          │<── CreditGrant (top-up) ──────│          │
//! └──────────┘                               └──────────┘
//! ```
//!
//! 1. The receiver hands out initial credit in its handshake acknowledgement.
//! 2. The sender spends credit by dispatching; elements stay `in_flight`
//!    until acknowledged.
//! 3. Once per `credit_round_interval` the receiver tops every open inbound
//!    path up to a target derived from how fast it processes that type:
//!    `clamp(target_horizon / time_per_unit, min_credit, max_credit)`, never
//!    more than the room its own outputs have left.
//!
//! Fast consumers get larger windows, slow ones smaller: a leaky bucket whose
//! depth is `target_horizon`.

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CreditConfig;
use crate::error::StreamError;
use crate::path::{Direction, Path, PathState, Peer, SlotId};
use crate::payload::TypeTag;

/// A credit top-up produced by a credit round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundGrant {
    /// Local inbound slot that received the credit.
    pub slot: SlotId,
    /// Upstream half of that path.
    pub peer: Peer,
    /// Granted amount.
    pub amount: u32,
}

/// Credit bookkeeping for one stage.
#[derive(Debug)]
pub struct CreditController {
    config: CreditConfig,
    clock: Arc<dyn Clock>,
    /// Measured per-element processing time, by type.
    estimates: FxHashMap<TypeTag, Duration>,
    last_round: Option<Duration>,
    rounds: u64,
}

impl CreditController {
    /// Creates a controller reading time from `clock`.
    #[must_use]
    pub fn new(config: CreditConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            estimates: FxHashMap::default(),
            last_round: None,
            rounds: 0,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    /// Current time according to the injected clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Shared handle to the injected clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Number of credit rounds that actually ran.
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Creates an open path holding `initial_credit`.
    #[must_use]
    pub fn open(
        &self,
        slot: SlotId,
        direction: Direction,
        type_tag: TypeTag,
        peer: Peer,
        initial_credit: u32,
    ) -> Path {
        debug!(%slot, ?direction, %type_tag, credit = initial_credit, "path opened");
        Path {
            slot,
            peer,
            direction,
            type_tag,
            credit: initial_credit,
            in_flight: 0,
            state: PathState::Open,
            seq: 0,
            last_dispatch: None,
        }
    }

    /// Adds `amount` to the path's credit and returns the new credit.
    ///
    /// Grants to a closed path are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::FlowControlViolation`] if `amount` is negative
    /// or the sum would overflow. The credit is left unchanged and an open
    /// path is forced into `Closing`.
    pub fn grant(&self, path: &mut Path, amount: i64) -> Result<u32, StreamError> {
        if path.state == PathState::Closed {
            return Ok(path.credit);
        }
        let next = u32::try_from(amount)
            .ok()
            .and_then(|amount| path.credit.checked_add(amount));
        match next {
            Some(credit) => {
                path.credit = credit;
                Ok(credit)
            }
            None => {
                if path.state == PathState::Open {
                    path.state = PathState::Closing;
                }
                Err(StreamError::FlowControlViolation {
                    slot: path.slot,
                    amount,
                    credit: path.credit,
                })
            }
        }
    }

    /// Releases `count` acknowledged elements of an outbound path.
    ///
    /// Both `in_flight` and `credit` shrink, so the available credit is
    /// unchanged.
    pub fn acknowledge(&self, path: &mut Path, count: u32) {
        if count > path.in_flight {
            warn!(
                slot = %path.slot,
                count,
                in_flight = path.in_flight,
                "acknowledgement exceeds in-flight elements"
            );
        }
        path.in_flight = path.in_flight.saturating_sub(count);
        path.credit = path.credit.saturating_sub(count);
    }

    /// Spends inbound credit for `count` received elements.
    ///
    /// Returns `false` (and clamps the credit at zero) if the sender exceeded
    /// its credit.
    pub fn consume(&self, path: &mut Path, count: u32) -> bool {
        match path.credit.checked_sub(count) {
            Some(rest) => {
                path.credit = rest;
                true
            }
            None => {
                warn!(
                    slot = %path.slot,
                    count,
                    credit = path.credit,
                    "batch exceeds granted credit"
                );
                path.credit = 0;
                false
            }
        }
    }

    /// Per-element processing time assumed for `tag`.
    ///
    /// Measured estimate first, then the configured value, then the default.
    #[must_use]
    pub fn time_per_unit(&self, tag: TypeTag) -> Duration {
        self.estimates
            .get(&tag)
            .copied()
            .unwrap_or_else(|| self.config.time_per_unit(tag))
    }

    /// Credit a path of type `tag` should hold after a round.
    #[must_use]
    pub fn target_credit(&self, tag: TypeTag) -> u32 {
        let per_unit = self.time_per_unit(tag).as_nanos().max(1);
        let units = self.config.target_horizon.as_nanos() / per_unit;
        let units = u32::try_from(units).unwrap_or(u32::MAX);
        units.clamp(self.config.min_credit, self.config.max_credit)
    }

    /// Credit handed to a new inbound path of type `tag`.
    #[must_use]
    pub fn initial_credit(&self, tag: TypeTag, room: usize) -> u32 {
        self.target_credit(tag).min(clamp_room(room))
    }

    /// Records that `count` elements of `tag` took `elapsed` to process.
    pub fn observe(&mut self, tag: TypeTag, count: usize, elapsed: Duration) {
        let Ok(count) = u32::try_from(count) else {
            return;
        };
        if count == 0 || elapsed.is_zero() {
            return;
        }
        let sample = elapsed / count;
        let alpha = self.config.ewma_alpha;
        self.estimates
            .entry(tag)
            .and_modify(|estimate| {
                *estimate = estimate.mul_f64(1.0 - alpha) + sample.mul_f64(alpha);
            })
            .or_insert(sample);
    }

    /// Returns `true` if a credit round may run at `now`.
    #[must_use]
    pub fn round_due(&self, now: Duration) -> bool {
        match self.last_round {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.config.credit_round_interval,
        }
    }

    /// Runs a credit round over `paths` if one is due.
    ///
    /// `room` is shared by every open inbound path: each path is topped up to
    /// `min(target, share)`, where `share` is the room left divided over the
    /// paths not yet served. The path served first rotates from round to
    /// round. The grants are applied to the paths and returned so the caller
    /// can notify the senders.
    pub fn recompute_round<'a>(
        &mut self,
        now: Duration,
        paths: impl IntoIterator<Item = &'a mut Path>,
        room: usize,
    ) -> Vec<RoundGrant> {
        if !self.round_due(now) {
            return Vec::new();
        }
        self.last_round = Some(now);
        self.rounds += 1;

        let mut open: Vec<&mut Path> = paths
            .into_iter()
            .filter(|p| p.direction == Direction::Inbound && p.state == PathState::Open)
            .collect();
        if !open.is_empty() {
            let start = usize::try_from((self.rounds - 1) % open.len() as u64).unwrap_or(0);
            open.rotate_left(start);
        }

        let mut room = clamp_room(room);
        let mut left = u32::try_from(open.len()).unwrap_or(u32::MAX);
        let mut grants = Vec::new();
        for path in open {
            let share = room.div_ceil(left);
            left -= 1;
            let desired = self.target_credit(path.type_tag).min(share);
            if desired > path.credit {
                let amount = desired - path.credit;
                path.credit = desired;
                room -= amount;
                grants.push(RoundGrant {
                    slot: path.slot,
                    peer: path.peer,
                    amount,
                });
            }
        }
        debug!(round = self.rounds, room_left = room, grants = grants.len(), "credit round");
        grants
    }

    /// Closes a path.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::PrematureClose`] if `buffered` elements had to
    /// be discarded. The path is closed either way.
    pub fn close(&self, path: &mut Path, buffered: usize) -> Result<(), StreamError> {
        path.state = PathState::Closed;
        path.credit = 0;
        path.in_flight = 0;
        debug!(slot = %path.slot, "path closed");
        if buffered > 0 {
            return Err(StreamError::PrematureClose {
                slot: path.slot,
                discarded: buffered,
            });
        }
        Ok(())
    }

    /// Forces a path closed, dropping all credit.
    pub fn abort(&self, path: &mut Path) {
        path.state = PathState::Closed;
        path.credit = 0;
        path.in_flight = 0;
        debug!(slot = %path.slot, "path aborted");
    }
}

fn clamp_room(room: usize) -> u32 {
    u32::try_from(room).unwrap_or(u32::MAX)
}
