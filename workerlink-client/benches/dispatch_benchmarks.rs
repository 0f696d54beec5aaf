use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use workerlink_client::{ClientConfig, WorkerClient, WorkerDefinition};
use workerlink_core::{AccessOptions, Accessible, CallOptions, Declaration, Gate, Gated, Remote};

struct Adder {
    gate: Gate,
    name: Accessible<String>,
}

impl Adder {
    fn name(&self) -> Gated<String> {
        self.gate.access("name", &self.name)
    }

    fn add(&self, a: i64, b: i64) -> Gated<i64> {
        self.gate.call("add", (a, b), |(a, b)| a + b)
    }
}

impl Remote for Adder {
    fn construct() -> Self {
        Adder {
            gate: Gate::new::<Adder>(),
            name: Accessible::new("adder".to_string()),
        }
    }

    fn gate(&self) -> &Gate {
        &self.gate
    }

    fn declare(decl: &mut Declaration<Self>) {
        decl.accessible("name", AccessOptions::new(), |a| &a.name)
            .callable("add", CallOptions::new(), |a, mut args| {
                a.add(args.take(0)?, args.take(1)?).into_real()
            });
    }
}

fn bench_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("round_trip");

    for mock in [false, true] {
        let config = ClientConfig::in_app().with_mock_serialization(mock);
        let client = WorkerClient::<Adder>::new(WorkerDefinition::in_app_only(), config);
        runtime.block_on(client.connect()).unwrap();

        group.bench_with_input(BenchmarkId::new("call", mock), &client, |b, client| {
            b.iter(|| black_box(runtime.block_on(client.call(|a| a.add(2, 3))).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("get", mock), &client, |b, client| {
            b.iter(|| black_box(runtime.block_on(client.get(|a| a.name())).unwrap()))
        });

        runtime.block_on(client.destroy());
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
