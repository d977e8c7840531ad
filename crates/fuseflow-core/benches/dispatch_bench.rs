//! Dispatch benchmarks
//!
//! Measures scatterer dispatch under both policies, fused dispatch across
//! element types, and a full source -> stage -> sink pipeline on the local
//! runtime.
//!
//! Run with: cargo bench --bench dispatch_bench

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use fuseflow_core::{
    make_sink, make_source, CreditConfig, CreditController, Direction, DispatchPolicy,
    FusedScatterer, LocalRuntime, ManualClock, Peer, Scatterer, SlotId, Stage, StageConfig,
    StageId, TypeTag,
};

fuseflow_core::stream_payload! {
    pub enum BenchMsg {
        Ints(i64) => "i64",
        Floats(f64) => "f64",
    }
}

const INTS: TypeTag = TypeTag::new("i64");
const FLOATS: TypeTag = TypeTag::new("f64");
const WINDOW: u32 = 1 << 20;

fn controller() -> CreditController {
    CreditController::new(CreditConfig::default(), Arc::new(ManualClock::new()))
}

fn peer(i: u16) -> Peer {
    Peer {
        stage: StageId(u64::from(i) + 100),
        slot: SlotId(1),
    }
}

fn scatterer(policy: DispatchPolicy, paths: u16) -> Scatterer<i64> {
    let ctl = controller();
    let mut s = Scatterer::new(policy, 64);
    for i in 0..paths {
        s.assign(ctl.open(SlotId(i + 1), Direction::Outbound, INTS, peer(i), WINDOW));
    }
    s
}

/// Acknowledges everything in flight so the window never closes.
fn ack_all(ctl: &CreditController, s: &mut Scatterer<i64>, paths: u16) {
    for i in 0..paths {
        if let Some(path) = s.path_mut(SlotId(i + 1)) {
            let n = path.in_flight();
            ctl.acknowledge(path, n);
            let _ = ctl.grant(path, i64::from(n));
        }
    }
}

// Scatterer Benchmarks

fn bench_scatterer_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("scatterer_dispatch");
    let batch = 1024;
    group.throughput(Throughput::Elements(batch as u64));

    for policy in [DispatchPolicy::Broadcast, DispatchPolicy::RoundRobin] {
        for paths in [1u16, 4, 16] {
            group.bench_with_input(
                BenchmarkId::new(format!("{policy:?}"), paths),
                &paths,
                |b, &paths| {
                    let ctl = controller();
                    let mut s = scatterer(policy, paths);
                    let items: Vec<i64> = (0..batch).collect();
                    b.iter(|| {
                        s.extend(items.iter().copied());
                        let outcome = s.dispatch(Duration::ZERO);
                        ack_all(&ctl, &mut s, paths);
                        black_box(outcome.deliveries.len())
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_scatterer_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("scatterer_capacity");
    group.throughput(Throughput::Elements(1));

    for paths in [1u16, 16, 128] {
        group.bench_with_input(BenchmarkId::new("broadcast", paths), &paths, |b, &paths| {
            let s = scatterer(DispatchPolicy::Broadcast, paths);
            b.iter(|| black_box(s.capacity()));
        });
    }

    group.finish();
}

// Fused Benchmarks

fn bench_fused_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fused_dispatch");
    let batch = 512usize;
    group.throughput(Throughput::Elements(2 * batch as u64));

    group.bench_function("two_types", |b| {
        let ctl = controller();
        let mut fused = FusedScatterer::<BenchMsg>::new(DispatchPolicy::Broadcast, 64)
            .with::<i64>()
            .and_then(FusedScatterer::with::<f64>)
            .unwrap();
        fused
            .assign_tagged(INTS, ctl.open(SlotId(1), Direction::Outbound, INTS, peer(0), WINDOW))
            .unwrap();
        fused
            .assign_tagged(
                FLOATS,
                ctl.open(SlotId(2), Direction::Outbound, FLOATS, peer(1), WINDOW),
            )
            .unwrap();
        let ints: Vec<i64> = (0..batch as i64).collect();
        let floats: Vec<f64> = ints.iter().map(|&i| i as f64 * 0.5).collect();

        b.iter(|| {
            let _ = fused.absorb(BenchMsg::Ints(ints.clone()));
            let _ = fused.absorb(BenchMsg::Floats(floats.clone()));
            let outcome = fused.dispatch(Duration::ZERO);
            for slot in [SlotId(1), SlotId(2)] {
                if let Some(path) = fused.path_mut(slot) {
                    let n = path.in_flight();
                    ctl.acknowledge(path, n);
                    let _ = ctl.grant(path, i64::from(n));
                }
            }
            black_box(outcome.deliveries.len())
        });
    });

    group.finish();
}

// End-to-End Benchmarks

#[derive(Debug, Default)]
struct Remaining(u64);

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);

    for elements in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(elements));
        group.bench_with_input(
            BenchmarkId::new("source_stage_sink", elements),
            &elements,
            |b, &elements| {
                b.iter(|| {
                    let config = StageConfig::new(
                        CreditConfig::builder()
                            .credit_round_interval(Duration::from_millis(1))
                            .max_credit(256)
                            .build(),
                    );
                    let mut rt = LocalRuntime::<BenchMsg>::new();
                    let source = rt
                        .spawn(|id, clock| {
                            make_source(
                                id,
                                config.clone(),
                                clock,
                                |s: &mut Remaining| s.0 = elements,
                                |s: &mut Remaining, out: &mut Scatterer<i64>, n: usize| {
                                    let take = s.0.min(n as u64);
                                    out.extend((0..take).map(|i| i as i64));
                                    s.0 -= take;
                                },
                                |s: &Remaining| s.0 == 0,
                            )
                        })
                        .unwrap();
                    let stage = rt
                        .spawn(|id, clock| {
                            Stage::builder(id)
                                .config(config.clone())
                                .clock(clock)
                                .output::<i64>()
                                .build()
                        })
                        .unwrap();
                    let sink = rt
                        .spawn(|id, clock| {
                            make_sink(
                                id,
                                config.clone(),
                                clock,
                                |_: &mut i64| {},
                                |s: &mut i64, x: i64| *s += x,
                                |_: &mut i64| {},
                            )
                        })
                        .unwrap();

                    rt.connect(stage.id(), sink.id(), INTS).unwrap();
                    rt.connect(source.id(), stage.id(), INTS).unwrap();
                    rt.run_until(LocalRuntime::all_done, Duration::from_millis(1), 1_000_000)
                        .unwrap();
                    black_box(rt.get(&sink).map(|s| *s.logic().state()))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    scatterer_benches,
    bench_scatterer_dispatch,
    bench_scatterer_capacity,
);

criterion_group!(fused_benches, bench_fused_dispatch);

criterion_group!(end_to_end_benches, bench_pipeline);

criterion_main!(scatterer_benches, fused_benches, end_to_end_benches);
