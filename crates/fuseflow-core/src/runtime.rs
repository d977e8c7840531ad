//! Deterministic in-process host for stages.
//!
//! [`LocalRuntime`] owns every stage, delivers envelopes in FIFO order and
//! drives credit rounds from a shared [`ManualClock`]. It is single threaded
//! and fully deterministic, which makes it the harness for integration tests
//! and benchmarks. Stages are addressed by [`StageId`]; typed access goes
//! through a [`NodeHandle`], which stops resolving once the stage is reaped.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, ManualClock};
use crate::error::StreamError;
use crate::message::{Envelope, StreamMsg};
use crate::path::StageId;
use crate::payload::{Payload, TypeTag};
use crate::stage::{Stage, StageLogic};

/// A unit the runtime can host.
pub trait StreamNode<P: Payload>: Send + Any {
    /// Id the node was spawned with.
    fn id(&self) -> StageId;

    /// Handles one message; follow-up messages go to `out`.
    fn handle(&mut self, from: StageId, msg: StreamMsg<P>, out: &mut Vec<Envelope<P>>);

    /// Periodic timer callback.
    fn tick(&mut self, out: &mut Vec<Envelope<P>>);

    /// Whether the node can be removed.
    fn done(&self) -> bool;

    /// Upcast for typed access.
    fn as_any(&self) -> &dyn Any;

    /// Upcast for typed access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<P: Payload, L: StageLogic<P>> StreamNode<P> for Stage<P, L> {
    fn id(&self) -> StageId {
        Stage::id(self)
    }

    fn handle(&mut self, from: StageId, msg: StreamMsg<P>, out: &mut Vec<Envelope<P>>) {
        Stage::handle(self, from, msg, out);
    }

    fn tick(&mut self, out: &mut Vec<Envelope<P>>) {
        Stage::tick(self, out);
    }

    fn done(&self) -> bool {
        Stage::done(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Typed reference to a node inside a [`LocalRuntime`].
pub struct NodeHandle<N> {
    id: StageId,
    _node: PhantomData<fn() -> N>,
}

impl<N> NodeHandle<N> {
    /// Id of the referenced node.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.id
    }
}

impl<N> Clone for NodeHandle<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for NodeHandle<N> {}

impl<N> fmt::Debug for NodeHandle<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.id).finish()
    }
}

/// Single-threaded host delivering envelopes between stages.
pub struct LocalRuntime<P> {
    nodes: BTreeMap<StageId, Box<dyn StreamNode<P>>>,
    queue: VecDeque<Envelope<P>>,
    clock: Arc<ManualClock>,
    next_id: u64,
    delivered: u64,
}

impl<P: Payload> Default for LocalRuntime<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> fmt::Debug for LocalRuntime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("queued", &self.queue.len())
            .field("delivered", &self.delivered)
            .field("now", &self.clock.now())
            .finish()
    }
}

impl<P: Payload> LocalRuntime<P> {
    /// Creates an empty runtime with its clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(ManualClock::new()))
    }

    /// Creates an empty runtime driven by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
            clock,
            next_id: 1,
            delivered: 0,
        }
    }

    /// The shared clock.
    #[must_use]
    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    /// Spawns a node. `make` receives the new id and the shared clock.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `make`.
    pub fn spawn<N: StreamNode<P>>(
        &mut self,
        make: impl FnOnce(StageId, Arc<dyn Clock>) -> Result<N, StreamError>,
    ) -> Result<NodeHandle<N>, StreamError> {
        let id = StageId(self.next_id);
        self.next_id += 1;
        let clock: Arc<dyn Clock> = self.clock.clone();
        let node = make(id, clock)?;
        debug_assert_eq!(node.id(), id);
        self.nodes.insert(id, Box::new(node));
        debug!(stage = %id, "stage spawned");
        Ok(NodeHandle {
            id,
            _node: PhantomData,
        })
    }

    /// Resolves a handle. `None` once the node was reaped.
    #[must_use]
    pub fn get<N: StreamNode<P>>(&self, handle: &NodeHandle<N>) -> Option<&N> {
        self.nodes.get(&handle.id)?.as_any().downcast_ref()
    }

    /// Resolves a handle for modification.
    pub fn get_mut<N: StreamNode<P>>(&mut self, handle: &NodeHandle<N>) -> Option<&mut N> {
        self.nodes.get_mut(&handle.id)?.as_any_mut().downcast_mut()
    }

    /// Returns `true` if a node with `id` is hosted.
    #[must_use]
    pub fn contains(&self, id: StageId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of hosted nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no node is hosted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Envelopes waiting for delivery.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Envelopes delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Asks `upstream` to open a path of type `tag` towards `downstream`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnknownStage`] if either stage is not hosted.
    pub fn connect(
        &mut self,
        upstream: StageId,
        downstream: StageId,
        tag: TypeTag,
    ) -> Result<(), StreamError> {
        for id in [upstream, downstream] {
            if !self.contains(id) {
                return Err(StreamError::UnknownStage(id));
            }
        }
        self.send(Envelope::new(
            downstream,
            upstream,
            StreamMsg::Join { declared_type: tag },
        ));
        Ok(())
    }

    /// Queues an envelope.
    pub fn send(&mut self, envelope: Envelope<P>) {
        self.queue.push_back(envelope);
    }

    /// Delivers queued envelopes until the queue is empty. Returns the
    /// number of delivered envelopes.
    pub fn run(&mut self) -> usize {
        let mut delivered = 0;
        let mut out = Vec::new();
        while let Some(envelope) = self.queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&envelope.to) else {
                warn!(
                    from = %envelope.from,
                    to = %envelope.to,
                    message = envelope.msg.kind(),
                    "envelope to unknown stage dropped"
                );
                continue;
            };
            node.handle(envelope.from, envelope.msg, &mut out);
            self.queue.extend(out.drain(..));
            delivered += 1;
        }
        self.delivered += delivered as u64;
        delivered
    }

    /// Runs the timer callback of every node.
    pub fn tick_all(&mut self) {
        let mut out = Vec::new();
        for node in self.nodes.values_mut() {
            node.tick(&mut out);
        }
        self.queue.extend(out);
    }

    /// Alternates [`run`](Self::run), advancing the clock by `cycle` and
    /// [`tick_all`](Self::tick_all) until `done` holds. Returns the number
    /// of cycles it took.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Stalled`] if `done` still fails after
    /// `max_cycles` cycles.
    pub fn run_until(
        &mut self,
        mut done: impl FnMut(&Self) -> bool,
        cycle: Duration,
        max_cycles: usize,
    ) -> Result<usize, StreamError> {
        for cycles in 0..max_cycles {
            self.run();
            if done(self) {
                return Ok(cycles);
            }
            self.clock.advance(cycle);
            self.tick_all();
        }
        self.run();
        if done(self) {
            return Ok(max_cycles);
        }
        Err(StreamError::Stalled { cycles: max_cycles })
    }

    /// Returns `true` if every hosted node is done.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.nodes.values().all(|n| n.done())
    }

    /// Removes every node that is done and returns their ids.
    pub fn reap_done(&mut self) -> Vec<StageId> {
        let done: Vec<StageId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.done())
            .map(|(&id, _)| id)
            .collect();
        for id in &done {
            self.nodes.remove(id);
            debug!(stage = %id, "stage reaped");
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreditConfig, StageConfig};
    use crate::payload::Element;
    use crate::scatterer::Scatterer;
    use crate::sink::{make_sink, SinkStage};
    use crate::source::{make_source, SourceStage};

    crate::stream_payload! {
        enum Msg {
            Ints(i64) => "i64",
        }
    }

    fn config() -> StageConfig {
        StageConfig::new(CreditConfig::builder().max_credit(4).max_batch_size(2).build())
    }

    fn spawn_pipeline(
        rt: &mut LocalRuntime<Msg>,
        end: i64,
    ) -> (
        NodeHandle<SourceStage<Msg, i64, i64>>,
        NodeHandle<SinkStage<Msg, i64, Vec<i64>>>,
    ) {
        let source = rt
            .spawn(|id, clock| {
                make_source(
                    id,
                    config(),
                    clock,
                    |next: &mut i64| *next = 1,
                    move |next: &mut i64, out: &mut Scatterer<i64>, n: usize| {
                        for _ in 0..n {
                            if *next > end {
                                break;
                            }
                            out.push(*next);
                            *next += 1;
                        }
                    },
                    move |next: &i64| *next > end,
                )
            })
            .unwrap();
        let sink = rt
            .spawn(|id, clock| {
                make_sink(
                    id,
                    config(),
                    clock,
                    |_: &mut Vec<i64>| {},
                    |seen: &mut Vec<i64>, x: i64| seen.push(x),
                    |_: &mut Vec<i64>| {},
                )
            })
            .unwrap();
        (source, sink)
    }

    #[test]
    fn test_source_to_sink_in_order() {
        let mut rt = LocalRuntime::<Msg>::new();
        let (source, sink) = spawn_pipeline(&mut rt, 20);
        rt.connect(source.id(), sink.id(), <i64 as Element<Msg>>::TAG)
            .unwrap();

        let cycles = rt
            .run_until(LocalRuntime::all_done, Duration::from_millis(10), 100)
            .unwrap();
        assert!(cycles > 0);

        let seen = rt.get(&sink).unwrap().logic().state();
        assert_eq!(*seen, (1..=20).collect::<Vec<_>>());
        assert!(rt.get(&sink).unwrap().logic().finalized());

        let mut reaped = rt.reap_done();
        reaped.sort();
        assert_eq!(reaped, vec![source.id(), sink.id()]);
        assert!(rt.get(&source).is_none());
        assert!(rt.is_empty());
    }

    #[test]
    fn test_connect_unknown_stage() {
        let mut rt = LocalRuntime::<Msg>::new();
        let (source, _) = spawn_pipeline(&mut rt, 1);
        assert_eq!(
            rt.connect(source.id(), StageId(99), TypeTag::new("i64")),
            Err(StreamError::UnknownStage(StageId(99)))
        );
    }

    #[test]
    fn test_stalls_without_consumer() {
        let mut rt = LocalRuntime::<Msg>::new();
        let (_source, _sink) = spawn_pipeline(&mut rt, 5);
        assert_eq!(
            rt.run_until(LocalRuntime::all_done, Duration::from_millis(10), 3),
            Err(StreamError::Stalled { cycles: 3 })
        );
        assert_eq!(rt.clock().now(), Duration::from_millis(30));
    }

    #[test]
    fn test_envelope_to_unknown_stage_dropped() {
        let mut rt = LocalRuntime::<Msg>::new();
        rt.send(Envelope::new(
            StageId(1),
            StageId(2),
            StreamMsg::CreditGrant {
                slot: crate::path::SlotId(1),
                amount: 1,
            },
        ));
        assert_eq!(rt.run(), 0);
        assert_eq!(rt.queued(), 0);
    }
}
