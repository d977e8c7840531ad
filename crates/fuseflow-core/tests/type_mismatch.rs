//! A batch whose type does not match is dropped, changes nothing and is
//! logged exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fuseflow_core::{
    Batch, Envelope, ManualClock, Stage, StageId, StreamMsg, TypeTag,
};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

fuseflow_core::stream_payload! {
    pub enum Msg {
        Ints(i64) => "i64",
        Floats(f64) => "f64",
    }
}

const INTS: TypeTag = TypeTag::new("i64");
const UPSTREAM: StageId = StageId(10);
const DOWNSTREAM: StageId = StageId(20);

/// Counts `ERROR` events.
#[derive(Clone, Default)]
struct ErrorCount(Arc<AtomicUsize>);

impl ErrorCount {
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for ErrorCount {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A forwarding stage with an `i64` output wired to `DOWNSTREAM` and an
/// `i64` input from `UPSTREAM`.
fn wired_stage() -> Stage<Msg> {
    let mut stage: Stage<Msg> = Stage::builder(StageId(1))
        .continuous(true)
        .clock(Arc::new(ManualClock::new()))
        .output::<i64>()
        .build()
        .unwrap();

    let mut out = Vec::new();
    stage.handle(
        DOWNSTREAM,
        StreamMsg::Join {
            declared_type: INTS,
        },
        &mut out,
    );
    let StreamMsg::Handshake { slot, .. } = out.remove(0).msg else {
        panic!("expected a handshake");
    };
    stage.handle(
        DOWNSTREAM,
        StreamMsg::HandshakeAck {
            slot,
            inbound_slot: fuseflow_core::SlotId(1),
            initial_credit: 8,
        },
        &mut out,
    );
    stage.handle(
        UPSTREAM,
        StreamMsg::Handshake {
            slot: fuseflow_core::SlotId(1),
            declared_type: INTS,
            layout: std::iter::once(INTS).collect(),
        },
        &mut out,
    );
    stage
}

fn mistyped(stage: &Stage<Msg>) -> StreamMsg<Msg> {
    let slot = stage.inbound_paths().next().unwrap().slot();
    StreamMsg::Batch(Batch {
        slot,
        seq: 0,
        payload: Msg::Floats(vec![1.5, 2.5]),
    })
}

#[test]
fn test_mistyped_batch_is_dropped_and_logged_once() {
    let errors = ErrorCount::default();
    let subscriber = tracing_subscriber::registry().with(errors.clone());

    tracing::subscriber::with_default(subscriber, || {
        let mut stage = wired_stage();
        let inbound_before = stage.inbound_paths().next().unwrap().clone();
        let out_path_before = stage.outbound().paths().next().unwrap().clone();
        assert_eq!(errors.get(), 0);

        let msg = mistyped(&stage);
        let mut out: Vec<Envelope<Msg>> = Vec::new();
        stage.handle(UPSTREAM, msg, &mut out);

        assert_eq!(errors.get(), 1);
        assert!(out.is_empty());
        assert_eq!(stage.metrics().type_mismatches, 1);
        assert_eq!(stage.metrics().batches_received, 0);
        assert_eq!(stage.outbound().buffered_of(INTS), Some(0));

        let inbound_after = stage.inbound_paths().next().unwrap();
        assert_eq!(inbound_after.credit(), inbound_before.credit());
        let out_path_after = stage.outbound().paths().next().unwrap();
        assert_eq!(out_path_after.credit(), out_path_before.credit());
        assert_eq!(out_path_after.in_flight(), 0);

        // the path keeps working
        let slot = inbound_after.slot();
        stage.handle(
            UPSTREAM,
            StreamMsg::Batch(Batch {
                slot,
                seq: 0,
                payload: Msg::Ints(vec![1, 2]),
            }),
            &mut out,
        );
        assert_eq!(errors.get(), 1);
        assert_eq!(stage.metrics().elements_received, 2);
        assert_eq!(stage.metrics().elements_dispatched, 2);
    });
}
