//! Event bus dispatch throughput
//!
//! Measures routing cost from `dispatch` to delivery in agent inboxes, for
//! unicast traffic spread over a population and for broadcasts.

use colony::mesh::{BusConfig, EventBus, Inbox};
use colony::model::{Address, AgentId, Event};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use std::hint::black_box;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn population(bus: &EventBus, size: usize) -> (Vec<AgentId>, Vec<Inbox>) {
    (0..size)
        .map(|i| {
            let id = AgentId::parse(format!("agent-{i}")).unwrap();
            let inbox = bus.register_agent(id.clone(), "bench").unwrap();
            (id, inbox)
        })
        .unzip()
}

fn bench_unicast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bus_unicast");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(5));

    for size in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let bus = EventBus::new(BusConfig::default());
                    let (ids, mut inboxes) = population(&bus, size);
                    let mut rng = rand::rng();
                    let targets: Vec<usize> =
                        (0..iters).map(|_| rng.random_range(0..size)).collect();
                    let mut expected = vec![0usize; size];
                    for &target in &targets {
                        expected[target] += 1;
                    }

                    let start = Instant::now();
                    for &target in &targets {
                        bus.dispatch(Event::new(
                            "Tick",
                            Address::Env,
                            Address::Agent(ids[target].clone()),
                        ))
                        .unwrap();
                    }
                    for (inbox, count) in inboxes.iter_mut().zip(expected) {
                        for _ in 0..count {
                            black_box(inbox.recv().await);
                        }
                    }
                    let elapsed = start.elapsed();
                    bus.shutdown();
                    elapsed
                })
            })
        });
    }
    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bus_broadcast");
    group.measurement_time(Duration::from_secs(5));

    for size in [16usize, 256] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let bus = EventBus::new(BusConfig::default());
                    let (_ids, mut inboxes) = population(&bus, size);

                    let start = Instant::now();
                    for _ in 0..iters {
                        bus.dispatch(Event::new("Tick", Address::Env, Address::All))
                            .unwrap();
                    }
                    for inbox in inboxes.iter_mut() {
                        for _ in 0..iters {
                            black_box(inbox.recv().await);
                        }
                    }
                    let elapsed = start.elapsed();
                    bus.shutdown();
                    elapsed
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_unicast, bench_broadcast);
criterion_main!(benches);
