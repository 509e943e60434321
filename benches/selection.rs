use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mongo_session::core::{Endpoint, EndpointState, Preference, ServerRole, TagSet};
use mongo_session::topology::selector::RoundRobin;
use mongo_session::topology::{ServerSelector, Topology, TopologyView};
use std::time::Duration;

/// One primary followed by `members - 1` secondaries spread over two data centers
fn replica_set(members: usize) -> TopologyView {
    let states = (0..members).map(|i| {
        let role = if i == 0 { ServerRole::Primary } else { ServerRole::Secondary };
        let dc = if i % 2 == 0 { "ny" } else { "sf" };
        EndpointState::with_role(
            Endpoint::new(format!("node{i}.example.com"), 27017),
            role,
            Duration::from_millis(1 + (i as u64 % 20)),
        )
        .with_tags([("dc", dc)])
    });
    TopologyView::new(1, states)
}

fn bench_select(c: &mut Criterion) {
    let selector = ServerSelector::new(Duration::from_millis(15), Duration::from_secs(10));
    let preferences = [
        ("primary", Preference::primary()),
        ("secondary_preferred", Preference::secondary_preferred()),
        ("nearest_tagged", Preference::nearest().tags(TagSet::from_pairs([("dc", "sf")]))),
    ];

    let mut group = c.benchmark_group("select");
    for members in [3, 7, 50] {
        let view = replica_set(members);
        for (name, preference) in &preferences {
            group.bench_with_input(BenchmarkId::new(*name, members), &view, |b, view| {
                b.iter(|| black_box(selector.select(view, preference)))
            });
        }
    }
    group.finish();

    let round_robin = ServerSelector::with_strategy(
        Duration::from_millis(15),
        Duration::from_secs(10),
        Box::new(RoundRobin::new()),
    );
    let view = replica_set(7);
    let preference = Preference::secondary();
    c.bench_function("select_round_robin", |b| {
        b.iter(|| black_box(round_robin.select(&view, &preference)))
    });
}

fn bench_publish(c: &mut Criterion) {
    let members: Vec<Endpoint> = (0..7)
        .map(|i| Endpoint::new(format!("node{i}.example.com"), 27017))
        .collect();
    let topology = Topology::new(members.clone());

    c.bench_function("topology_publish", |b| {
        let mut i = 0;
        b.iter(|| {
            let endpoint = &members[i % members.len()];
            topology.set_state(EndpointState::with_role(
                endpoint.clone(),
                ServerRole::Secondary,
                Duration::from_millis(3),
            ));
            i += 1;
            black_box(topology.snapshot().version())
        })
    });
}

criterion_group!(benches, bench_select, bench_publish);
criterion_main!(benches);
