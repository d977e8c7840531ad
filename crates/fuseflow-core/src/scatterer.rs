//! Buffered, credit-respecting dispatch of one element type.
//!
//! A [`Scatterer<T>`] owns a shared buffer of elements nobody has been
//! charged for yet, plus the outbound paths of type `T`. Each path has its
//! own queue:
//!
//! ```text
//!              push/extend
//!                   │
//!                   ▼
//!            ┌─────────────┐   distribute    ┌──────────────┐  ≤ credit-in_flight
//!            │ shared buf  │──(clone/move)──▶│ queue slot-1 │──────────▶ Batch
//!            └─────────────┘        │        └──────────────┘
//!                                   │        ┌──────────────┐
//!                                   └───────▶│ queue slot-2 │──────────▶ Batch
//!                                            └──────────────┘
//! ```
//!
//! Broadcast moves the whole shared buffer into every open path's queue on
//! each dispatch, so a slow path only grows its own backlog and never holds
//! elements in the shared buffer. [`capacity`](Scatterer::capacity) accounts
//! for that backlog, which keeps producers throttled to the slowest path.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::trace;

use crate::config::{DispatchPolicy, DEFAULT_MAX_BATCH_SIZE};
use crate::path::{Direction, Path, PathState, Peer, SlotId};

/// Elements sent on one path by a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<X> {
    /// Local outbound slot.
    pub slot: SlotId,
    /// Receiving half.
    pub peer: Peer,
    /// Sequence number assigned to this batch.
    pub seq: u64,
    /// The elements.
    pub items: X,
}

/// Everything a dispatch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome<X> {
    /// Batches to send, in order.
    pub deliveries: Vec<Delivery<X>>,
    /// Paths that finished closing during this dispatch.
    pub closed: Vec<(SlotId, Peer)>,
}

impl<X> Default for DispatchOutcome<X> {
    fn default() -> Self {
        Self {
            deliveries: Vec::new(),
            closed: Vec::new(),
        }
    }
}

impl<X> DispatchOutcome<X> {
    /// Returns `true` if nothing was sent or closed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.closed.is_empty()
    }

    /// Converts the items of every delivery.
    #[must_use]
    pub fn map<Y>(self, mut f: impl FnMut(X) -> Y) -> DispatchOutcome<Y> {
        DispatchOutcome {
            deliveries: self
                .deliveries
                .into_iter()
                .map(|d| Delivery {
                    slot: d.slot,
                    peer: d.peer,
                    seq: d.seq,
                    items: f(d.items),
                })
                .collect(),
            closed: self.closed,
        }
    }

    /// Appends another outcome.
    pub fn append(&mut self, mut other: Self) {
        self.deliveries.append(&mut other.deliveries);
        self.closed.append(&mut other.closed);
    }
}

#[derive(Debug)]
struct OutboundPath<T> {
    path: Path,
    queue: VecDeque<T>,
}

impl<T> OutboundPath<T> {
    /// Credit not yet spoken for by queued elements.
    fn free(&self) -> usize {
        (self.path.available() as usize).saturating_sub(self.queue.len())
    }
}

/// Outbound buffer and paths for elements of type `T`.
#[derive(Debug)]
pub struct Scatterer<T> {
    buf: VecDeque<T>,
    paths: Vec<OutboundPath<T>>,
    policy: DispatchPolicy,
    max_batch_size: usize,
    /// Next path index tried by round-robin distribution.
    rr_cursor: usize,
}

impl<T> Default for Scatterer<T> {
    fn default() -> Self {
        Self::new(DispatchPolicy::default(), DEFAULT_MAX_BATCH_SIZE)
    }
}

impl<T> Scatterer<T> {
    /// Creates an empty scatterer.
    ///
    /// A `max_batch_size` of zero is treated as one.
    #[must_use]
    pub fn new(policy: DispatchPolicy, max_batch_size: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            paths: Vec::new(),
            policy,
            max_batch_size: max_batch_size.max(1),
            rr_cursor: 0,
        }
    }

    /// Dispatch policy in use.
    #[must_use]
    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Appends an element to the shared buffer.
    pub fn push(&mut self, item: T) {
        self.buf.push_back(item);
    }

    /// Appends elements to the shared buffer.
    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.buf.extend(items);
    }

    /// Number of elements in the shared buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Elements queued on `slot` but not yet sent. `None` for unknown slots.
    #[must_use]
    pub fn pending(&self, slot: SlotId) -> Option<usize> {
        self.find(slot).map(|i| self.paths[i].queue.len())
    }

    /// Wires in a newly acknowledged outbound path.
    ///
    /// A path already assigned under the same slot is replaced.
    pub fn assign(&mut self, path: Path) {
        debug_assert_eq!(path.direction, Direction::Outbound);
        match self.find(path.slot) {
            Some(i) => self.paths[i] = OutboundPath::new(path),
            None => self.paths.push(OutboundPath::new(path)),
        }
    }

    /// All paths, including closed ones.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.paths.iter().map(|p| &p.path)
    }

    /// Looks up a path by slot.
    #[must_use]
    pub fn path(&self, slot: SlotId) -> Option<&Path> {
        self.find(slot).map(|i| &self.paths[i].path)
    }

    /// Looks up a path by slot for modification.
    pub fn path_mut(&mut self, slot: SlotId) -> Option<&mut Path> {
        self.find(slot).map(|i| &mut self.paths[i].path)
    }

    /// Number of assigned paths, closed ones included.
    #[must_use]
    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    /// Number of paths that are not closed.
    #[must_use]
    pub fn num_live_paths(&self) -> usize {
        self.paths.iter().filter(|p| p.path.is_live()).count()
    }

    /// How many more elements can be pushed without outgrowing the credit
    /// of the open paths. Zero means this type is congested.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let mut open = self
            .paths
            .iter()
            .filter(|p| p.path.state == PathState::Open)
            .peekable();
        if open.peek().is_none() {
            return 0;
        }
        let room = match self.policy {
            DispatchPolicy::Broadcast => open.map(OutboundPath::free).min().unwrap_or(0),
            DispatchPolicy::RoundRobin => open
                .map(OutboundPath::free)
                .fold(0usize, usize::saturating_add),
        };
        room.saturating_sub(self.buf.len())
    }

    /// Returns `true` if the shared buffer is empty and every path is closed.
    #[must_use]
    pub fn clean(&self) -> bool {
        self.buf.is_empty() && self.paths.iter().all(|p| p.path.is_closed())
    }

    /// Returns `true` once this type had paths and none of them is open.
    #[must_use]
    pub fn finished(&self) -> bool {
        !self.paths.is_empty() && self.paths.iter().all(|p| p.path.state != PathState::Open)
    }

    /// Starts a graceful close of every open path.
    ///
    /// Closing paths keep draining the shared buffer. Each path closes once
    /// the shared buffer and its own queue are sent and acknowledged.
    pub fn close_all(&mut self)
    where
        T: Clone,
    {
        self.distribute();
        for out in &mut self.paths {
            if out.path.state == PathState::Open {
                out.path.state = PathState::Closing;
            }
        }
    }

    /// Discards the queue of `slot` and returns how many elements it held.
    pub fn take_pending(&mut self, slot: SlotId) -> Option<usize> {
        let i = self.find(slot)?;
        let discarded = self.paths[i].queue.len();
        self.paths[i].queue.clear();
        Some(discarded)
    }

    /// Discards the queue of `slot` and closes it immediately.
    pub fn abort_path(&mut self, slot: SlotId) -> Option<usize> {
        let discarded = self.take_pending(slot)?;
        if let Some(path) = self.path_mut(slot) {
            path.state = PathState::Closed;
            path.credit = 0;
            path.in_flight = 0;
        }
        Some(discarded)
    }

    /// Moves buffered elements onto the paths and emits what credit allows.
    ///
    /// No path is ever sent more than `credit - in_flight` elements. Once the
    /// shared buffer is empty, closing paths whose queue is empty and fully
    /// acknowledged become closed and are reported in
    /// [`DispatchOutcome::closed`].
    pub fn dispatch(&mut self, now: Duration) -> DispatchOutcome<Vec<T>>
    where
        T: Clone,
    {
        self.distribute();

        let mut outcome = DispatchOutcome::default();
        let max_batch = self.max_batch_size;
        let drained = self.buf.is_empty();
        for out in &mut self.paths {
            if out.path.is_closed() {
                continue;
            }
            let mut quota = out.queue.len().min(out.path.available() as usize);
            while quota > 0 {
                let n = quota.min(max_batch);
                let items: Vec<T> = out.queue.drain(..n).collect();
                // n <= available, which is a u32
                out.path.in_flight += u32::try_from(n).unwrap_or(u32::MAX);
                out.path.last_dispatch = Some(now);
                let seq = out.path.next_seq();
                trace!(slot = %out.path.slot, seq, count = n, "batch dispatched");
                outcome.deliveries.push(Delivery {
                    slot: out.path.slot,
                    peer: out.path.peer,
                    seq,
                    items,
                });
                quota -= n;
            }
            if out.path.state == PathState::Closing
                && drained
                && out.queue.is_empty()
                && out.path.in_flight == 0
            {
                out.path.state = PathState::Closed;
                out.path.credit = 0;
                outcome.closed.push((out.path.slot, out.path.peer));
            }
        }
        outcome
    }

    /// Empties the shared buffer into the per-path queues.
    fn distribute(&mut self)
    where
        T: Clone,
    {
        if self.buf.is_empty() {
            return;
        }
        match self.policy {
            DispatchPolicy::Broadcast => self.distribute_broadcast(),
            DispatchPolicy::RoundRobin => self.distribute_round_robin(),
        }
    }

    fn distribute_broadcast(&mut self)
    where
        T: Clone,
    {
        let live: Vec<usize> = (0..self.paths.len())
            .filter(|&i| self.paths[i].path.is_live())
            .collect();
        let Some((&last, rest)) = live.split_last() else {
            return;
        };
        for &i in rest {
            self.paths[i].queue.extend(self.buf.iter().cloned());
        }
        self.paths[last].queue.extend(self.buf.drain(..));
    }

    fn distribute_round_robin(&mut self) {
        let n = self.paths.len();
        'elements: while !self.buf.is_empty() {
            for step in 0..n {
                let i = (self.rr_cursor + step) % n;
                let out = &mut self.paths[i];
                if out.path.is_live() && out.free() > 0 {
                    if let Some(item) = self.buf.pop_front() {
                        out.queue.push_back(item);
                    }
                    self.rr_cursor = (i + 1) % n;
                    continue 'elements;
                }
            }
            break;
        }
    }

    fn find(&self, slot: SlotId) -> Option<usize> {
        self.paths.iter().position(|p| p.path.slot == slot)
    }
}

impl<T> OutboundPath<T> {
    fn new(path: Path) -> Self {
        Self {
            path,
            queue: VecDeque::new(),
        }
    }
}
