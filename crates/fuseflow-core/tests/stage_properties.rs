//! Randomized message interleavings against a small fused topology.
//!
//! Envelopes stay FIFO per `(from, to)` channel, like a mailbox per sender,
//! but channels are drained in random order and stages tick at random
//! points. Stage invariants must hold after every step, and the run must
//! still complete once the topology is allowed to settle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fuseflow_core::{
    make_sink, make_source, Clock, CreditConfig, Element, Envelope, ManualClock, Scatterer,
    SinkStage, SourceStage, Stage, StageConfig, StageId, StageState, StreamMsg, StreamNode,
    TypeTag,
};
use proptest::prelude::*;

fuseflow_core::stream_payload! {
    pub enum Msg {
        Ints(i64) => "i64",
        Strings(String) => "string",
    }
}

const INTS: TypeTag = <i64 as Element<Msg>>::TAG;
const STRINGS: TypeTag = <String as Element<Msg>>::TAG;
const CYCLE: Duration = Duration::from_millis(1);

const INT_SOURCE: StageId = StageId(1);
const STRING_SOURCE: StageId = StageId(2);
const MIDDLE: StageId = StageId(3);
const SUM: StageId = StageId(4);
const COLLECT: StageId = StageId(5);
const ALL: [StageId; 5] = [INT_SOURCE, STRING_SOURCE, MIDDLE, SUM, COLLECT];

const INT_COUNT: i64 = 20;
const STRING_COUNT: usize = 5;

#[derive(Debug, Default)]
struct Remaining(usize);

#[derive(Debug, Default)]
struct Sum(i64);

#[derive(Debug, Default)]
struct Collected(Vec<String>);

type IntSource = SourceStage<Msg, i64, Remaining>;
type StringSource = SourceStage<Msg, String, Remaining>;
type SumSink = SinkStage<Msg, i64, Sum>;
type CollectSink = SinkStage<Msg, String, Collected>;

#[derive(Debug, Clone)]
enum Op {
    Deliver(usize),
    Tick(usize),
    Advance,
    Release,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => any::<usize>().prop_map(Op::Deliver),
        2 => (0..ALL.len()).prop_map(Op::Tick),
        1 => Just(Op::Advance),
        1 => Just(Op::Release),
    ]
}

fn config(max_credit: u32, max_batch_size: usize) -> StageConfig {
    StageConfig::new(
        CreditConfig::builder()
            .credit_round_interval(CYCLE)
            .max_credit(max_credit)
            .max_batch_size(max_batch_size)
            .build(),
    )
}

struct World {
    clock: Arc<ManualClock>,
    nodes: BTreeMap<StageId, Box<dyn StreamNode<Msg>>>,
    queue: VecDeque<Envelope<Msg>>,
    inputs_wired: usize,
    released: bool,
}

impl World {
    fn new(max_credit: u32, max_batch_size: usize) -> Self {
        let clock = Arc::new(ManualClock::new());
        let shared: Arc<dyn Clock> = clock.clone();
        let cfg = || config(max_credit, max_batch_size);
        let mut nodes: BTreeMap<StageId, Box<dyn StreamNode<Msg>>> = BTreeMap::new();

        let ints: IntSource = make_source(
            INT_SOURCE,
            cfg(),
            Arc::clone(&shared),
            |s: &mut Remaining| s.0 = usize::try_from(INT_COUNT).unwrap(),
            |s: &mut Remaining, out: &mut Scatterer<i64>, n: usize| {
                let take = n.min(s.0);
                let first = INT_COUNT - i64::try_from(s.0).unwrap() + 1;
                out.extend((0..take).map(|i| first + i64::try_from(i).unwrap()));
                s.0 -= take;
            },
            |s: &Remaining| s.0 == 0,
        )
        .unwrap();
        nodes.insert(INT_SOURCE, Box::new(ints));

        let strings: StringSource = make_source(
            STRING_SOURCE,
            cfg(),
            Arc::clone(&shared),
            |s: &mut Remaining| s.0 = STRING_COUNT,
            |s: &mut Remaining, out: &mut Scatterer<String>, n: usize| {
                let take = n.min(s.0);
                for _ in 0..take {
                    out.push(format!("s{}", STRING_COUNT - s.0));
                    s.0 -= 1;
                }
            },
            |s: &Remaining| s.0 == 0,
        )
        .unwrap();
        nodes.insert(STRING_SOURCE, Box::new(strings));

        let middle: Stage<Msg> = Stage::builder(MIDDLE)
            .config(cfg().continuous(true))
            .clock(Arc::clone(&shared))
            .output::<i64>()
            .output::<String>()
            .build()
            .unwrap();
        nodes.insert(MIDDLE, Box::new(middle));

        let sum: SumSink = make_sink(
            SUM,
            cfg(),
            Arc::clone(&shared),
            |_: &mut Sum| {},
            |s: &mut Sum, x: i64| s.0 += x,
            |_: &mut Sum| {},
        )
        .unwrap();
        nodes.insert(SUM, Box::new(sum));

        let collect: CollectSink = make_sink(
            COLLECT,
            cfg(),
            shared,
            |_: &mut Collected| {},
            |s: &mut Collected, x: String| s.0.push(x),
            |_: &mut Collected| {},
        )
        .unwrap();
        nodes.insert(COLLECT, Box::new(collect));

        let queue = [
            (SUM, MIDDLE, INTS),
            (COLLECT, MIDDLE, STRINGS),
            (MIDDLE, INT_SOURCE, INTS),
            (MIDDLE, STRING_SOURCE, STRINGS),
        ]
        .into_iter()
        .map(|(from, to, declared_type)| {
            Envelope::new(from, to, StreamMsg::Join { declared_type })
        })
        .collect();

        Self {
            clock,
            nodes,
            queue,
            inputs_wired: 0,
            released: false,
        }
    }

    fn node<N: 'static>(&self, id: StageId) -> &N {
        self.nodes[&id].as_any().downcast_ref::<N>().unwrap()
    }

    fn middle(&self) -> &Stage<Msg> {
        self.node(MIDDLE)
    }

    fn absorb(&mut self, out: Vec<Envelope<Msg>>) {
        self.inputs_wired += out
            .iter()
            .filter(|env| env.from == MIDDLE && matches!(env.msg, StreamMsg::HandshakeAck { .. }))
            .count();
        self.queue.extend(out);
    }

    fn deliver(&mut self, env: Envelope<Msg>) {
        let mut out = Vec::new();
        if let Some(node) = self.nodes.get_mut(&env.to) {
            node.handle(env.from, env.msg, &mut out);
        }
        self.absorb(out);
    }

    /// Delivers the oldest envelope of the `pick`-th open channel.
    fn deliver_on(&mut self, pick: usize) {
        let mut channels: Vec<(StageId, StageId)> = Vec::new();
        for env in &self.queue {
            if !channels.contains(&(env.from, env.to)) {
                channels.push((env.from, env.to));
            }
        }
        if channels.is_empty() {
            return;
        }
        let (from, to) = channels[pick % channels.len()];
        let pos = self
            .queue
            .iter()
            .position(|env| env.from == from && env.to == to)
            .unwrap();
        let env = self.queue.remove(pos).unwrap();
        self.deliver(env);
    }

    fn tick(&mut self, id: StageId) {
        let mut out = Vec::new();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.tick(&mut out);
        }
        self.absorb(out);
    }

    /// Ends the middle stage's setup once both inputs and outputs are wired.
    fn try_release(&mut self) {
        if self.released || self.inputs_wired < 2 {
            return;
        }
        let m = self.middle();
        if m.pending_handshakes() > 0 || m.outbound().paths().count() < 2 {
            return;
        }
        let middle = self
            .nodes
            .get_mut(&MIDDLE)
            .and_then(|node| node.as_any_mut().downcast_mut::<Stage<Msg>>())
            .unwrap();
        middle.set_continuous(false);
        self.released = true;
    }

    fn all_done(&self) -> bool {
        self.nodes.values().all(|node| node.done())
    }

    fn check(&self) -> Result<(), TestCaseError> {
        let m = self.middle();
        let out = m.outbound();

        let expected_done = !m.continuous()
            && m.pending_handshakes() == 0
            && m.inbound_paths().next().is_none()
            && out.clean();
        prop_assert_eq!(m.done(), expected_done);
        if m.state() == StageState::Done {
            prop_assert!(m.done());
        }
        prop_assert_eq!(m.congested(), out.capacity() == 0);
        prop_assert_eq!(out.clean(), out.clean_states().iter().all(|(_, c)| *c));
        for path in out.paths() {
            prop_assert!(path.in_flight() <= path.credit(), "{:?}", path);
        }

        let ints: &IntSource = self.node(INT_SOURCE);
        let strings: &StringSource = self.node(STRING_SOURCE);
        for path in ints.outbound().paths().chain(strings.outbound().paths()) {
            prop_assert!(path.in_flight() <= path.credit(), "{:?}", path);
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stage_invariants_hold_under_any_interleaving(
        ops in prop::collection::vec(op(), 0..120),
        max_credit in 1u32..12,
        max_batch_size in 1usize..6,
    ) {
        let mut world = World::new(max_credit, max_batch_size);

        for op in ops {
            match op {
                Op::Deliver(pick) => world.deliver_on(pick),
                Op::Tick(i) => world.tick(ALL[i]),
                Op::Advance => world.clock.advance(CYCLE),
                Op::Release => world.try_release(),
            }
            world.check()?;
        }

        for _ in 0..5_000 {
            while let Some(env) = world.queue.pop_front() {
                world.deliver(env);
                world.check()?;
            }
            world.try_release();
            if world.all_done() {
                break;
            }
            world.clock.advance(CYCLE);
            for id in ALL {
                world.tick(id);
            }
            world.check()?;
        }

        prop_assert!(world.all_done());
        prop_assert_eq!(world.node::<SumSink>(SUM).logic().state().0, INT_COUNT * (INT_COUNT + 1) / 2);
        let expected: Vec<String> = (0..STRING_COUNT).map(|i| format!("s{i}")).collect();
        prop_assert_eq!(&world.node::<CollectSink>(COLLECT).logic().state().0, &expected);
        prop_assert_eq!(world.middle().state(), StageState::Done);
    }

    #[test]
    fn grants_raise_credit_by_exactly_the_amount(grants in prop::collection::vec(0i64..50, 1..20)) {
        let mut world = World::new(4, 2);
        // wire everything but never let the sinks grant beyond the handshake
        for _ in 0..50 {
            let Some(env) = world.queue.pop_front() else { break };
            world.deliver(env);
        }
        let m = world.middle();
        let slot = m.outbound().paths().find(|p| p.type_tag() == INTS).unwrap().slot();
        let mut expected = m.outbound().path(slot).unwrap().credit();

        let middle = world
            .nodes
            .get_mut(&MIDDLE)
            .and_then(|node| node.as_any_mut().downcast_mut::<Stage<Msg>>())
            .unwrap();
        for amount in grants {
            let mut out = Vec::new();
            middle.handle(SUM, StreamMsg::CreditGrant { slot, amount }, &mut out);
            expected += u32::try_from(amount).unwrap();
            let path = middle.outbound().path(slot).unwrap();
            prop_assert_eq!(path.credit(), expected);
            prop_assert!(path.in_flight() <= path.credit());
        }
    }
}
