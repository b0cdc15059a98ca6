//! Benchmarks for the hot pure paths of the control plane
//!
//! Namespace naming runs on every request, state transitions and quota
//! summation on every admission and watcher cycle.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tenant_disk_operator::controlplane::{used_capacity, DiskEvent, DiskState};
use tenant_disk_operator::domain::disk::{generate_namespace_name, Disk, DiskStatus, Scope};

fn bench_namespace_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("naming");
    group.throughput(Throughput::Elements(1));

    group.bench_function("short_scope", |b| {
        b.iter(|| generate_namespace_name(black_box("acme"), black_box("ml")));
    });

    let org = "a-very-long-organisation-name-that-needs-truncating";
    let project = "and-an-equally-long-project-name-for-good-measure";
    group.bench_function("truncated_scope", |b| {
        b.iter(|| generate_namespace_name(black_box(org), black_box(project)));
    });

    group.finish();
}

fn bench_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.throughput(Throughput::Elements(
        (DiskState::ALL.len() * DiskEvent::ALL.len()) as u64,
    ));

    group.bench_function("all_pairs", |b| {
        b.iter(|| {
            let mut allowed = 0;
            for state in DiskState::ALL {
                for event in DiskEvent::ALL {
                    if black_box(state).apply(black_box(event)).is_ok() {
                        allowed += 1;
                    }
                }
            }
            allowed
        });
    });

    group.finish();
}

fn bench_used_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("quota");

    let now = Utc::now();
    let statuses = [
        DiskStatus::Pending,
        DiskStatus::Ready,
        DiskStatus::Broken,
        DiskStatus::Deleting,
    ];
    let disks: Vec<Disk> = (0..1000u64)
        .map(|i| Disk {
            id: format!("disk-{:04}", i),
            name: None,
            scope: Scope::new("acme", "ml"),
            owner: "alice".into(),
            storage_class: None,
            requested_capacity_bytes: (i % 64 + 1) << 30,
            capacity_bytes: None,
            used_bytes: None,
            status: statuses[i as usize % statuses.len()],
            life_span: None,
            last_usage_check: None,
            last_used_at: None,
            created_at: now,
        })
        .collect();

    group.throughput(Throughput::Elements(disks.len() as u64));
    group.bench_function("sum_1000_disks", |b| {
        b.iter(|| used_capacity(black_box(&disks)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_namespace_name,
    bench_transitions,
    bench_used_capacity
);
criterion_main!(benches);
